//! Runtime configuration types.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the JIT backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Hex-dump each function's generated code after compilation
    pub dump_code: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self { dump_code: false }
    }
}

impl JitConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(!config.dump_code);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dump_code = true").unwrap();

        let config = JitConfig::load(file.path()).unwrap();
        assert!(config.dump_code);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dump_cod = true").unwrap();

        assert!(matches!(
            JitConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
