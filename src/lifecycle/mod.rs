//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Pre-flight device checks → Restore or create state
//!
//! Shutdown (shutdown.rs):
//!     Stop requested → engine finishes current step → checkpoint → exit 130
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Request graceful stop
//!     Second signal → Immediate exit
//! ```
//!
//! # Design Decisions
//! - A stop request is honoured only after a checkpoint, never mid-probe
//!   or mid-recovery
//! - Pre-flight failures are fatal before any state is written

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::{preflight, PreflightError};
