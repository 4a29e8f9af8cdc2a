//! Bridge configuration
//!
//! All fields have defaults, so a configuration file only needs the keys it
//! overrides:
//!
//! ```json
//! { "host_name": "Host", "min_timer_delay_ms": 4 }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for one [`Bridge`](crate::Bridge)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine name used in diagnostics
    pub engine_name: String,
    /// Host runtime name; prefixes host errors seen by script code
    pub host_name: String,
    /// Lower bound applied to every `setTimeout` delay
    pub min_timer_delay_ms: u64,
    /// File name reported for errors raised by evaluated source
    pub eval_file_name: String,
    /// Log rejected promises nobody handled after each drain
    pub report_unhandled_rejections: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine_name: "Quickbridge".to_string(),
            host_name: "Rust".to_string(),
            min_timer_delay_ms: 0,
            eval_file_name: "evaluate".to_string(),
            report_unhandled_rejections: true,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine_name.trim().is_empty() {
            return Err(Error::Config("engine_name must not be empty".to_string()));
        }
        if self.host_name.trim().is_empty() {
            return Err(Error::Config("host_name must not be empty".to_string()));
        }
        if self.eval_file_name.is_empty() {
            return Err(Error::Config("eval_file_name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.engine_name, "Quickbridge");
        assert_eq!(config.host_name, "Rust");
        assert_eq!(config.min_timer_delay_ms, 0);
        assert_eq!(config.eval_file_name, "evaluate");
        assert!(config.report_unhandled_rejections);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = BridgeConfig::from_json_str(r#"{ "min_timer_delay_ms": 4 }"#).unwrap();
        assert_eq!(config.min_timer_delay_ms, 4);
        assert_eq!(config.host_name, "Rust");
    }

    #[test]
    fn test_invalid_json_is_a_config_error() {
        let err = BridgeConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = BridgeConfig::from_json_str(r#"{ "host_name": " " }"#).unwrap_err();
        assert_eq!(err.to_string(), "ConfigError: host_name must not be empty");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "engine_name": "Embedded", "eval_file_name": "repl" }}"#).unwrap();
        let config = BridgeConfig::from_path(file.path()).unwrap();
        assert_eq!(config.engine_name, "Embedded");
        assert_eq!(config.eval_file_name, "repl");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::from_path(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_pretty_json_round_trip() {
        let config = BridgeConfig {
            min_timer_delay_ms: 10,
            ..BridgeConfig::default()
        };
        let json = config.to_json_pretty().unwrap();
        assert_eq!(BridgeConfig::from_json_str(&json).unwrap(), config);
    }
}
