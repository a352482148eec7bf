use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use wire::tls::TlsIdentity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "kebab-case")]
pub struct JudgeConfig {
    /// Server to connect to
    pub server_host: String,
    #[serde(default = "JudgeConfig::default_port")]
    pub server_port: u16,
    /// Name the server's certificate is verified against; defaults to the
    /// host
    #[serde(default)]
    pub server_name: Option<String>,
    /// Identifier announced to the server; must be unique across workers
    pub judge_id: String,
    /// Problem data is cached here, one subdirectory per problem code
    pub cache_dir: PathBuf,
    /// PEM certificate chain presented to the server
    pub certificate_file: PathBuf,
    /// PEM private key matching the certificate
    pub private_key_file: PathBuf,
    /// CA used to verify the server certificate
    pub ca_file: PathBuf,
    #[serde(default = "JudgeConfig::default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    /// Bound on waits covering a busy server phase (hashing, archiving)
    #[serde(default = "JudgeConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Delay before reconnecting after the connection drops
    #[serde(default = "JudgeConfig::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Static answers for the server's info queries (platform facts are
    /// filled in automatically)
    #[serde(default)]
    pub info: HashMap<String, String>,
    /// Supported languages and how to build and run them
    pub langs: HashMap<String, LangConfig>,
    /// The sandbox subprocess running compilers and solutions
    pub limiter: LimiterConfig,
}

/// Toolchain for one language. Commands may use the placeholders `{source}`,
/// `{bin}`, `{dir}`, `{socket}` and `{result-file}`; the limiter placeholders
/// are substituted by the limiter client.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "kebab-case")]
pub struct LangConfig {
    /// File name the submitted source is saved under, e.g. `main.cpp`
    pub source_name: String,
    /// Compile command; empty means the language needs no compilation
    #[serde(default)]
    pub compile: Vec<String>,
    /// Execute command for one case
    pub execute: Vec<String>,
    /// Wall-clock bound for compilation
    #[serde(default = "LangConfig::default_compile_time_ms")]
    pub compile_time_ms: u64,
}

impl LangConfig {
    fn default_compile_time_ms() -> u64 {
        60_000
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LimiterChannel {
    /// The limiter connects to a unix socket and writes its result record
    Socket,
    /// The limiter writes its result record into a file
    File,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "kebab-case")]
pub struct LimiterConfig {
    /// Command line of the limiter; receives `{socket}` or `{result-file}`
    /// plus the execution placeholders
    pub command: Vec<String>,
    pub channel: LimiterChannel,
}

impl JudgeConfig {
    fn default_port() -> u16 {
        9196
    }

    fn default_network_timeout_ms() -> u64 {
        2000
    }

    fn default_busy_timeout_ms() -> u64 {
        600_000
    }

    fn default_reconnect_delay_ms() -> u64 {
        5000
    }

    pub fn load(path: &Path) -> Result<JudgeConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: JudgeConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.judge_id.is_empty() {
            return Err(ConfigError::Invalid("judge-id must not be empty".into()));
        }
        if self.langs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one language must be configured".into(),
            ));
        }
        for (lang, lc) in &self.langs {
            if lc.execute.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language {:?} has an empty execute command",
                    lang
                )));
            }
        }
        if self.limiter.command.is_empty() {
            return Err(ConfigError::Invalid(
                "limiter command must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn tls_identity(&self) -> TlsIdentity {
        TlsIdentity {
            cert: self.certificate_file.clone(),
            key: self.private_key_file.clone(),
            ca: self.ca_file.clone(),
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.server_host)
    }

    pub fn network_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.network_timeout_ms)
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }
}
