//! Probe subsystem.
//!
//! # Data Flow
//! ```text
//! AddressRange from the search engine
//!     → executor.rs (drain stale log, read each DWORD via Transport)
//!     → HealthMonitor snapshot every `health_stride` reads
//!     → ProbeOutcome (faulted? which kind? where did it stop?)
//! ```
//!
//! # Design Decisions
//! - A probe never recovers the device; that is the engine's call
//! - `DeviceGone` is reported like any other fault and never retried here
//! - A destructive fault already in the log refuses the probe, since it
//!   belongs to whatever ran before
//! - Reads the transport rejects outright (outside the window) are caller
//!   errors, never device faults

pub mod executor;

use std::time::Duration;

use thiserror::Error;

use crate::device::TransportError;
use crate::health::FaultKind;
use crate::search::range::AddressRange;

pub use executor::ProbeExecutor;

/// Result of one sweep. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub range: AddressRange,
    pub faulted: bool,
    /// Dominant fault of the verdict that stopped the sweep.
    pub fault_kind: Option<FaultKind>,
    pub elapsed: Duration,
    pub reads: u64,
    /// Offset of the last read issued.
    pub last_offset: Option<u64>,
    /// Non-destructive faults seen during the sweep.
    pub informational: Vec<FaultKind>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// A destructive fault was logged before the first read.
    #[error("device logged {0} before the probe started")]
    NotReady(FaultKind),

    /// The transport refused the read while the device stayed healthy.
    #[error("read rejected by transport: {0}")]
    Transport(#[from] TransportError),
}
