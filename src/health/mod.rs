//! Device health subsystem.
//!
//! # Data Flow
//! ```text
//! Fault classification (classifier.rs):
//!     Kernel log lines since cursor
//!     → Ordered rule table
//!     → FaultKind events (+ terminal confirmation)
//!
//! Health snapshot (snapshot.rs):
//!     Presence + driver binding + link status + classified faults
//!     → HealthVerdict (immutable, one per check)
//!     → Cursor advanced past the consumed lines
//! ```
//!
//! # Design Decisions
//! - A verdict is healthy only when the device is present, bound, linked up
//!   and no destructive fault was logged since the last check
//! - Unsupported requests are background noise from probing holes in the
//!   register map and never make a verdict unhealthy
//! - Classification never drops an error-looking line; unknown ones are kept

pub mod classifier;
pub mod snapshot;

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::device::LinkStatus;

pub use classifier::{Classification, FaultClassifier, RuleAction, RuleConfig};
pub use snapshot::HealthMonitor;

/// Bus-level fault classes reported by the kernel log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A read was never answered. The kind this tool hunts for.
    CompletionTimeout,
    /// Explicit error completion; harmless.
    UnsupportedRequest,
    MalformedTlp,
    /// The function left the bus.
    DeviceGone,
    /// Error-looking line that matched no rule.
    Unknown,
}

impl FaultKind {
    /// Whether the device must be recovered before the next probe.
    pub fn requires_recovery(self) -> bool {
        matches!(self, FaultKind::CompletionTimeout)
    }

    /// Whether the whole run must stop.
    pub fn is_terminal_for_run(self) -> bool {
        matches!(self, FaultKind::DeviceGone)
    }

    /// Ordering used to pick the dominant fault of a batch.
    fn severity(self) -> u8 {
        match self {
            FaultKind::DeviceGone => 4,
            FaultKind::CompletionTimeout => 3,
            FaultKind::MalformedTlp => 2,
            FaultKind::UnsupportedRequest => 1,
            FaultKind::Unknown => 0,
        }
    }

    /// The most severe fault in `faults`.
    pub fn dominant<I: IntoIterator<Item = FaultKind>>(faults: I) -> Option<FaultKind> {
        faults.into_iter().max_by_key(|kind| kind.severity())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::CompletionTimeout => "completion_timeout",
            FaultKind::UnsupportedRequest => "unsupported_request",
            FaultKind::MalformedTlp => "malformed_tlp",
            FaultKind::DeviceGone => "device_gone",
            FaultKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health observation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthVerdict {
    pub present: bool,
    pub driver_bound: bool,
    pub link_up: bool,
    /// Raw Link Status, when it could be read.
    pub link_status: Option<LinkStatus>,
    /// Faults logged since the previous check, in log order.
    pub new_faults: Vec<FaultKind>,
    /// The driver reported it will not recover from the current fault.
    pub terminal_confirmed: bool,
    pub checked_at: SystemTime,
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        self.present
            && self.driver_bound
            && self.link_up
            && !self
                .new_faults
                .iter()
                .any(|kind| matches!(kind, FaultKind::CompletionTimeout | FaultKind::DeviceGone))
    }

    /// The fault that best explains an unhealthy verdict.
    ///
    /// A missing device is `DeviceGone` regardless of the log; an unbound
    /// driver or a dead link with nothing logged is `Unknown`.
    pub fn dominant_fault(&self) -> Option<FaultKind> {
        if !self.present {
            return Some(FaultKind::DeviceGone);
        }
        let logged = FaultKind::dominant(self.new_faults.iter().copied());
        if self.is_healthy() {
            return None;
        }
        match logged {
            Some(kind) if kind.severity() >= FaultKind::CompletionTimeout.severity() => Some(kind),
            _ => Some(FaultKind::Unknown),
        }
    }

    /// Non-destructive faults logged alongside this verdict.
    pub fn informational(&self) -> impl Iterator<Item = FaultKind> + '_ {
        self.new_faults.iter().copied().filter(|kind| {
            !matches!(kind, FaultKind::CompletionTimeout | FaultKind::DeviceGone)
        })
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "present={} bound={} link={} faults={:?}",
            self.present,
            self.driver_bound,
            match self.link_status {
                Some(lnk) => lnk.to_string(),
                None => "unreadable".to_string(),
            },
            self.new_faults
        )
    }
}
