//! Crash-offset bisection for PCI BARs.
//!
//! Finds the register offsets whose reads make a device stop answering,
//! recovering the device after every fault and checkpointing the search
//! after every step.

// Core search
pub mod probe;
pub mod search;
pub mod store;

// Device and its health
pub mod device;
pub mod health;
pub mod resilience;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use config::BisectConfig;
pub use error::BisectError;
pub use lifecycle::Shutdown;
pub use search::{AddressRange, BisectionEngine, RunOutcome, RunReport, SearchState};
