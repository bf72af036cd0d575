//! Top-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::device::TransportError;
use crate::lifecycle::PreflightError;
use crate::probe::ProbeError;
use crate::search::{AddressRange, Phase, RangeError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BisectError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pre-flight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("invalid search range: {0}")]
    Range(#[from] RangeError),

    #[error("failed to map BAR: {0}")]
    Map(#[from] TransportError),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("search range {range} runs past the {window:#x}-byte BAR window")]
    PastWindow { range: AddressRange, window: u64 },

    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("run '{0}' already has checkpoints; use `resume`")]
    RunExists(String),

    #[error("no checkpoint found for run '{0}'")]
    NoCheckpoint(String),

    #[error("run '{run_id}' is still in phase {phase}; only finished runs can be discarded")]
    NotDone { run_id: String, phase: Phase },

    #[error("refusing to discard run '{0}' without --yes")]
    NotConfirmed(String),
}
