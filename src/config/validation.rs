//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate alignment of every address field (probe granularity is 4 bytes)
//! - Validate value ranges (timeouts > 0, stride >= 1, attempts >= 1)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BisectConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::BisectConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} = {value:#x} is not 4-byte aligned")]
    Unaligned { field: &'static str, value: u64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("search range {start:#x}-{end:#x} is empty")]
    EmptyRange { start: u64, end: u64 },

    #[error("search end {end:#x} is past the mapped BAR size {bar_size:#x}")]
    PastBar { end: u64, bar_size: u64 },

    #[error("region '{name}' has start {start:#x} >= end {end:#x}")]
    BadRegion { name: String, start: u64, end: u64 },

    #[error("classifier rule #{index} has no match strings")]
    EmptyRule { index: usize },

    #[error("metrics address '{0}' is not a socket address")]
    MetricsAddress(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &BisectConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.device.bdf.trim().is_empty() {
        errors.push(ValidationError::Empty { field: "device.bdf" });
    }
    if config.device.driver.trim().is_empty() {
        errors.push(ValidationError::Empty {
            field: "device.driver",
        });
    }

    let search = &config.search;
    check_aligned(&mut errors, "search.start", search.start);
    check_aligned(&mut errors, "search.end", search.end);
    check_aligned(&mut errors, "search.chunk_size", search.chunk_size);
    if search.chunk_size == 0 {
        errors.push(ValidationError::Zero {
            field: "search.chunk_size",
        });
    }
    if search.end != 0 && search.end <= search.start {
        errors.push(ValidationError::EmptyRange {
            start: search.start,
            end: search.end,
        });
    }
    let bar_size = config.device.bar_size;
    if bar_size != 0 && search.end > bar_size {
        errors.push(ValidationError::PastBar {
            end: search.end,
            bar_size,
        });
    }
    if bar_size != 0 && search.end == 0 && search.start >= bar_size {
        errors.push(ValidationError::EmptyRange {
            start: search.start,
            end: bar_size,
        });
    }

    if config.probe.health_stride == 0 {
        errors.push(ValidationError::Zero {
            field: "probe.health_stride",
        });
    }
    if config.probe.settle_ms > 0 && config.probe.settle_poll_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "probe.settle_poll_ms",
        });
    }

    if config.recovery.poll_interval_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "recovery.poll_interval_ms",
        });
    }
    if config.recovery.rebind_timeout_secs == 0 {
        errors.push(ValidationError::Zero {
            field: "recovery.rebind_timeout_secs",
        });
    }
    if config.recovery.max_consecutive_failures == 0 {
        errors.push(ValidationError::Zero {
            field: "recovery.max_consecutive_failures",
        });
    }

    if !config.verify.skip && config.verify.attempts == 0 {
        errors.push(ValidationError::Zero {
            field: "verify.attempts",
        });
    }

    if config.state.dir.trim().is_empty() {
        errors.push(ValidationError::Empty { field: "state.dir" });
    }
    if config.state.keep_checkpoints == 0 {
        errors.push(ValidationError::Zero {
            field: "state.keep_checkpoints",
        });
    }

    for (index, rule) in config.classifier.rules.iter().enumerate() {
        if rule.contains.iter().all(|s| s.trim().is_empty()) {
            errors.push(ValidationError::EmptyRule { index });
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    for region in &config.report.regions {
        if region.start >= region.end {
            errors.push(ValidationError::BadRegion {
                name: region.name.clone(),
                start: region.start,
                end: region.end,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_aligned(errors: &mut Vec<ValidationError>, field: &'static str, value: u64) {
    if value % 4 != 0 {
        errors.push(ValidationError::Unaligned { field, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RegionConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&BisectConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = BisectConfig::default();
        config.search.start = 0x2;
        config.search.chunk_size = 0;
        config.probe.health_stride = 0;
        config.verify.attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::Unaligned {
            field: "search.start",
            value: 0x2
        }));
        assert!(errors.contains(&ValidationError::Zero {
            field: "search.chunk_size"
        }));
        assert!(errors.contains(&ValidationError::Zero {
            field: "probe.health_stride"
        }));
        assert!(errors.contains(&ValidationError::Zero {
            field: "verify.attempts"
        }));
    }

    #[test]
    fn test_skip_verify_allows_zero_attempts() {
        let mut config = BisectConfig::default();
        config.verify.skip = true;
        config.verify.attempts = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_range_checks() {
        let mut config = BisectConfig::default();
        config.search.start = 0x8000;
        config.search.end = 0x4000;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::EmptyRange {
                start: 0x8000,
                end: 0x4000
            }]
        );

        config.search.start = 0;
        config.search.end = 0x400000;
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::PastBar { .. }));
    }

    #[test]
    fn test_bad_region() {
        let mut config = BisectConfig::default();
        config.report.regions.push(RegionConfig {
            name: "ce".into(),
            start: 0x2000,
            end: 0x1000,
            description: String::new(),
        });
        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].to_string().contains("'ce'"));
    }
}
