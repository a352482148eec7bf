use serde::Deserialize;
use std::path::{Path, PathBuf};
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
pub struct ServerConfig {
    /// Port the server listens on for worker connections
    #[serde(default = "ServerConfig::default_port")]
    pub listen_port: u16,
    /// Bind the listener to [::] instead of 0.0.0.0
    #[serde(default)]
    pub use_ipv6: bool,
    /// PEM certificate chain presented to workers
    pub certificate_file: PathBuf,
    /// PEM private key matching the certificate
    pub private_key_file: PathBuf,
    /// CA used to verify worker certificates
    pub ca_file: PathBuf,
    /// Timeout for ordinary control-message reads and writes
    #[serde(default = "ServerConfig::default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    /// Timeout for waits that cover a busy peer phase (hashing, archiving,
    /// compiling, running a case); keepalives arrive during it but do not
    /// extend it
    #[serde(default = "ServerConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Capacity of the pending-task queue, shared across all languages
    #[serde(default = "ServerConfig::default_queue_size")]
    pub queue_size: usize,
    /// Longest worker identifier the server accepts
    #[serde(default = "ServerConfig::default_judge_id_max_len")]
    pub judge_id_max_len: usize,
    /// Seconds between polls of the task source when it reports no work
    #[serde(default = "ServerConfig::default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Directory holding one subdirectory of test data per problem code
    pub data_dir: PathBuf,
    /// Task source endpoint
    pub web_url: String,
    /// Shared secret for the task source's request checksums
    pub web_secret: String,
    /// Timeout for task source requests
    #[serde(default = "ServerConfig::default_web_timeout_ms")]
    pub web_timeout_ms: u64,
}

impl ServerConfig {
    fn default_port() -> u16 {
        9196
    }

    fn default_network_timeout_ms() -> u64 {
        2000
    }

    fn default_busy_timeout_ms() -> u64 {
        600_000
    }

    fn default_queue_size() -> usize {
        1024
    }

    fn default_judge_id_max_len() -> usize {
        20
    }

    fn default_refresh_interval_secs() -> u64 {
        2
    }

    fn default_web_timeout_ms() -> u64 {
        10_000
    }

    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ServerConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.network_timeout_ms < 1000 {
            return Err(ConfigError::Invalid(
                "network-timeout-ms must be at least 1000".to_string(),
            ));
        }
        if self.judge_id_max_len == 0 {
            return Err(ConfigError::Invalid(
                "judge-id-max-len must be at least 1".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid(
                "queue-size must be at least 1".to_string(),
            ));
        }
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "refresh-interval-secs must be at least 1".to_string(),
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

    pub fn network_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.network_timeout_ms)
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }
}
