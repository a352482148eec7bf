use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the manifest every problem's data directory must carry.
pub const MANIFEST_NAME: &str = "problem.toml";

#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("cannot read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("problem has no cases")]
    Empty,
}

/// Describes how to judge one problem: the ordered list of test cases with
/// their limits and scores. Lives next to the test data and travels with it
/// through the directory sync.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "kebab-case")]
pub struct ProblemManifest {
    pub cases: Vec<CaseSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "kebab-case")]
pub struct CaseSpec {
    /// Input file fed to the program
    pub input: String,
    /// Expected output
    pub answer: String,
    #[serde(default = "CaseSpec::default_time_ms")]
    pub time_ms: u64,
    #[serde(default = "CaseSpec::default_memory_kb")]
    pub memory_kb: u64,
    #[serde(default = "CaseSpec::default_score")]
    pub score: u32,
}

impl CaseSpec {
    fn default_time_ms() -> u64 {
        1000
    }

    fn default_memory_kb() -> u64 {
        262_144
    }

    fn default_score() -> u32 {
        10
    }
}

impl ProblemManifest {
    pub fn load(data_dir: &Path) -> Result<ProblemManifest, ProblemError> {
        let path = data_dir.join(MANIFEST_NAME);
        let raw = std::fs::read_to_string(&path).map_err(|source| ProblemError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: ProblemManifest =
            toml::from_str(&raw).map_err(|source| ProblemError::Parse { path, source })?;
        if manifest.cases.is_empty() {
            return Err(ProblemError::Empty);
        }
        Ok(manifest)
    }
}
