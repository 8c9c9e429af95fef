//! Batch configuration
//!
//! Loaded from a JSON file; CLI flags override individual fields.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Models allowed as vector roots. Empty denies every root.
    #[serde(default)]
    pub regulated_models: Vec<String>,

    /// Log every vector of a batch at debug level
    #[serde(default)]
    pub log_vectors: bool,
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn with_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncConfig {
            regulated_models: models.into_iter().map(Into::into).collect(),
            log_vectors: false,
        }
    }

    pub fn is_regulated(&self, model: &str) -> bool {
        self.regulated_models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"regulated_models": ["Todo"], "log_vectors": true}}"#).unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert!(config.is_regulated("Todo"));
        assert!(!config.is_regulated("User"));
        assert!(config.log_vectors);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(SyncConfig::from_file(file.path()), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_empty_denies_all() {
        assert!(!SyncConfig::default().is_regulated("Todo"));
    }
}
