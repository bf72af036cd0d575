//! Crash-localization search.
//!
//! # Data Flow
//! ```text
//! SearchState (fresh from range + chunk size, or restored checkpoint)
//!     → engine.rs picks the next action for the current phase
//!     → ProbeExecutor sweep → RecoveryOrchestrator if it faulted
//!     → state.rs pure transition → next SearchState
//!     → CheckpointStore::save
//!     → ... until Done → report.rs
//! ```
//!
//! # Design Decisions
//! - The state value is the only memory of the search; nothing is
//!   re-derived on resume
//! - A range is only ever called safe after every DWORD in it was read
//! - Overlapping faults are never assumed away: a pushed-back half is
//!   always probed on its own

pub mod engine;
pub mod range;
pub mod report;
pub mod state;

pub use engine::{AbortReason, BisectionEngine, RunOutcome};
pub use range::{AddressRange, RangeError};
pub use report::RunReport;
pub use state::{
    AbandonedRange, CrashEntry, CrashStatus, PartitionError, Phase, SafeRange, SearchState,
    SuspectRange, TransientFault,
};
