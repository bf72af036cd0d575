//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a bisection
//! run. All types derive Serde traits for deserialization from config files;
//! TOML hex literals (`0x8000`) are accepted for every address field.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::classifier::RuleConfig;

/// Root configuration for a run.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BisectConfig {
    /// Device under test.
    pub device: DeviceConfig,

    /// Address range and coarse chunking.
    pub search: SearchConfig,

    /// Probe sweep settings.
    pub probe: ProbeConfig,

    /// Recovery timeouts and escalation.
    pub recovery: RecoveryConfig,

    /// Verify phase settings.
    pub verify: VerifyConfig,

    /// Checkpoint storage.
    pub state: StateConfig,

    /// Kernel log classification.
    pub classifier: ClassifierConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// How the owning driver is cycled during escalated recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RebindMethod {
    /// Write the BDF to the driver's `unbind` and `bind` nodes.
    Sysfs,
    /// `modprobe -r <driver>` followed by `modprobe <driver>`.
    Modprobe,
}

/// Device configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// PCI address (e.g., "0004:01:00.0").
    pub bdf: String,

    /// Owning driver (module name for modprobe, directory under drivers/).
    pub driver: String,

    /// BAR index to map.
    pub bar: u8,

    /// Bytes of the BAR to map. Zero means the size of the resource file.
    pub bar_size: u64,

    /// Config-space offset of the PCIe Link Status register.
    pub link_status_offset: u64,

    pub rebind_method: RebindMethod,

    /// Root of the sysfs tree.
    pub sysfs_root: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bdf: "0004:01:00.0".to_string(),
            driver: "ath12k_pci".to_string(),
            bar: 0,
            bar_size: 2 * 1024 * 1024,
            link_status_offset: 0x82,
            rebind_method: RebindMethod::Modprobe,
            sysfs_root: "/sys".to_string(),
        }
    }
}

/// Search range configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    /// First byte offset to probe.
    pub start: u64,

    /// End of the range (exclusive). Zero means the end of the BAR.
    pub end: u64,

    /// Coarse chunk size in bytes.
    pub chunk_size: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0,
            chunk_size: 0x10000,
        }
    }
}

/// Probe sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Health snapshot every N reads (minimum 1).
    pub health_stride: u64,

    /// How long to keep watching the log after a clean sweep, in milliseconds.
    pub settle_ms: u64,

    /// Poll interval during the settle window, in milliseconds.
    pub settle_poll_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            health_stride: 64,
            settle_ms: 5000,
            settle_poll_ms: 500,
        }
    }
}

impl ProbeConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }
}

/// Recovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Health poll interval while waiting, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long to wait for the device to come back on its own.
    pub auto_recovery_timeout_secs: u64,

    /// How long to wait after a rebind or reset.
    pub rebind_timeout_secs: u64,

    /// Quiet period after a successful recovery before the next probe.
    pub settle_ms: u64,

    /// Abort the run after this many unrecoverable faults in a row.
    pub max_consecutive_failures: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            auto_recovery_timeout_secs: 60,
            rebind_timeout_secs: 30,
            settle_ms: 2000,
            max_consecutive_failures: 5,
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn auto_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_recovery_timeout_secs)
    }

    pub fn rebind_timeout(&self) -> Duration {
        Duration::from_secs(self.rebind_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Verify phase configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Isolated re-probes per candidate.
    pub attempts: u32,

    /// Promote every candidate without re-probing.
    pub skip: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            skip: false,
        }
    }
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding checkpoint files.
    pub dir: String,

    /// Checkpoints kept per run (newest first).
    pub keep_checkpoints: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: "bisect-state".to_string(),
            keep_checkpoints: 3,
        }
    }
}

/// Kernel log classification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Tags that mark a log line as coming from the bus or the device driver.
    pub watch_tags: Vec<String>,

    /// Extra rules, checked before the built-in table.
    pub rules: Vec<RuleConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            watch_tags: vec![
                "aer".to_string(),
                "pcieport".to_string(),
                "pciehp".to_string(),
                "ath12k".to_string(),
            ],
            rules: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}

/// Report labelling.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReportConfig {
    pub regions: Vec<RegionConfig>,
}

/// A named register block used to label offsets in the report.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionConfig {
    pub name: String,
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub description: String,
}
