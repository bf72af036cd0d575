//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → CLI flags override individual fields
//!     → validation.rs again on the merged result
//!     → BisectConfig (validated, immutable for the run)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the run starts; a resumed run may change
//!   timeouts but never the range or chunk size recorded in the checkpoint
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::BisectConfig;
pub use schema::{
    ClassifierConfig, DeviceConfig, ProbeConfig, RecoveryConfig, SearchConfig, StateConfig,
    VerifyConfig,
};
pub use validation::{validate_config, ValidationError};
