//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::BisectConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BisectConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<BisectConfig, ConfigError> {
    let config: BisectConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RebindMethod;
    use crate::health::FaultKind;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.search.chunk_size, 0x10000);
        assert_eq!(config.verify.attempts, 3);
        assert_eq!(config.recovery.auto_recovery_timeout_secs, 60);
    }

    #[test]
    fn test_hex_fields_and_rules() {
        let config = parse_config(
            r#"
            [device]
            bdf = "0000:03:00.0"
            driver = "mt7925e"
            rebind_method = "sysfs"

            [search]
            start = 0x8000
            end = 0xc000
            chunk_size = 0x1000

            [[classifier.rules]]
            contains = ["mt7925e", "fw own timeout"]
            kind = "completion_timeout"

            [[report.regions]]
            name = "ce_high"
            start = 0x8000
            end = 0xc000
            "#,
        )
        .unwrap();

        assert_eq!(config.device.rebind_method, RebindMethod::Sysfs);
        assert_eq!(config.search.start, 0x8000);
        assert_eq!(config.search.end, 0xc000);
        assert_eq!(config.classifier.rules.len(), 1);
        assert_eq!(config.classifier.rules[0].kind, Some(FaultKind::CompletionTimeout));
        assert_eq!(config.report.regions[0].name, "ce_high");
    }

    #[test]
    fn test_validation_failure_is_reported() {
        let err = parse_config("[search]\nchunk_size = 0x3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("search.chunk_size"));
    }

    #[test]
    fn test_parse_error() {
        let err = parse_config("[search\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/bisect.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
