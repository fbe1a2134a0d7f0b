use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// JSON snapshot backing the in-process store.
    pub data_path: PathBuf,
    /// tracing filter used when RUST_LOG is unset.
    pub log_filter: String,
    /// Options attached to exports created without explicit options.
    pub export_options: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("kvsfs.json"),
            log_filter: "info".to_string(),
            export_options: "rw".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
