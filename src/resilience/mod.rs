//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Probe faulted (CompletionTimeout / DeviceGone):
//!     → recovery.rs (Degraded → AwaitingAutoRecovery)
//!     → poll HealthMonitor on a fixed interval until healthy or timeout
//!     → On timeout: rebind driver (or function reset), poll again
//!     → RecoveryReport back to the search engine
//! ```
//!
//! # Design Decisions
//! - Every wait has a deadline; nothing polls forever
//! - One attempt per fault; the engine decides what an unrecoverable range means
//! - Recovery never reads the BAR, only sysfs and the kernel log

pub mod recovery;

pub use recovery::{
    RecoveryOrchestrator, RecoveryOutcome, RecoveryReport, RecoveryState, Transition,
};
