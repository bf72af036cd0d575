//! Startup checks.
//!
//! # Responsibilities
//! - Confirm the device is on the bus and answering config reads
//! - Confirm the BAR resource file exists before it is mapped
//!
//! # Design Decisions
//! - Fail fast: probing a device that is already wedged tells us nothing
//! - Reads config space only, never the BAR

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::device::{ControlError, DeviceControl};
use crate::search::range::Hex;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("device {0} is not present")]
    NotPresent(String),

    #[error("BAR resource {} does not exist", .0.display())]
    MissingResource(PathBuf),

    #[error("device {bdf} returned id {id:#010x}; it is not responding")]
    NotResponding { bdf: String, id: u32 },

    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Run the pre-flight checks, returning the vendor/device id dword.
pub fn preflight<C: DeviceControl>(
    control: &mut C,
    bdf: &str,
    resource: &Path,
) -> Result<u32, PreflightError> {
    if !control.is_present() {
        return Err(PreflightError::NotPresent(bdf.to_string()));
    }
    if !resource.exists() {
        return Err(PreflightError::MissingResource(resource.to_path_buf()));
    }

    let id = control.device_id()?;
    if id == 0xffff_ffff || id == 0 {
        return Err(PreflightError::NotResponding {
            bdf: bdf.to_string(),
            id,
        });
    }

    if !control.is_driver_bound() {
        tracing::warn!(bdf, "No driver bound; recovery by rebind may not work");
    }
    match control.read_link_status() {
        Ok(link) => tracing::info!(bdf, id = %Hex(u64::from(id)), link = %link, "Pre-flight passed"),
        Err(e) => tracing::warn!(bdf, error = %e, "Link status unreadable"),
    }
    Ok(id)
}
