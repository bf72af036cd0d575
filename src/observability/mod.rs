//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events: phase, range, offset, fault)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Operator terminal (stderr)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Every phase change, probe, recovery transition and abandonment is
//!   logged as it happens, so a watching operator always knows which range
//!   is under test
//! - Metrics are cheap (atomic increments) and off unless enabled

pub mod logging;
pub mod metrics;
