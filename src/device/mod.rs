//! External device collaborators.
//!
//! # Data Flow
//! ```text
//! Probe executor:
//!     → Transport::read_aligned4 (BAR window, one DWORD per call)
//!
//! Health monitor:
//!     → DeviceControl (presence, driver binding, link status)
//!     → LogSource::tail_since (kernel log since the last cursor)
//!
//! Recovery orchestrator:
//!     → DeviceControl::rebind_driver / bus_reset
//! ```
//!
//! # Design Decisions
//! - Three narrow traits instead of one device object, so the search code
//!   never sees a path, a file descriptor or a subprocess
//! - A transport read that triggers a completion timeout must come back with
//!   `TransportError::Timeout`; it never blocks the caller indefinitely
//! - `sim` provides a programmable fault oracle behind the same traits

pub mod dmesg;
pub mod mmio;
pub mod sim;
pub mod sysfs;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dmesg::DmesgLog;
pub use mmio::MmioTransport;
pub use sim::{SimBehavior, SimControl, SimLog, SimTransport, SimulatedBus};
pub use sysfs::SysfsControl;

/// Errors surfaced by a register transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The read did not complete within the transport's own deadline.
    #[error("read at {offset:#08x} timed out")]
    Timeout { offset: u64 },

    /// Offset lies outside the mapped window.
    #[error("offset {offset:#08x} outside window of {size:#x} bytes")]
    OutOfBounds { offset: u64, size: u64 },

    /// Offset is not DWORD aligned.
    #[error("offset {0:#08x} is not 4-byte aligned")]
    Unaligned(u64),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the system log collaborator.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to read kernel log: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel log reader exited with {0}")]
    Reader(String),
}

/// Errors surfaced by the device-control collaborator.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("device control I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("device does not support {0}")]
    Unsupported(&'static str),
}

/// Reads aligned 32-bit registers from the device window.
pub trait Transport {
    /// Size of the window in bytes.
    fn window_size(&self) -> u64;

    /// Read the DWORD at `offset`.
    fn read_aligned4(&mut self, offset: u64) -> Result<u32, TransportError>;
}

/// Position in an append-only log: the newest timestamp consumed and how
/// many lines carrying that timestamp have been consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogCursor {
    pub timestamp: u64,
    pub consumed: u32,
}

impl LogCursor {
    /// Cursor just past the `index`th (0-based) line stamped `timestamp`.
    pub fn after(timestamp: u64, index: u32) -> Self {
        Self {
            timestamp,
            consumed: index + 1,
        }
    }

    /// Whether the `index`th line stamped `timestamp` has not been consumed yet.
    pub fn precedes(self, timestamp: u64, index: u32) -> bool {
        timestamp > self.timestamp || (timestamp == self.timestamp && index >= self.consumed)
    }
}

/// Append-only, monotonically advancing system log.
pub trait LogSource {
    /// Return every line appended after `cursor`, plus the cursor that follows them.
    fn tail_since(&mut self, cursor: LogCursor) -> Result<(Vec<String>, LogCursor), LogError>;
}

/// Presence, binding, link and reset controls for the device under test.
pub trait DeviceControl {
    fn is_present(&mut self) -> bool;

    fn is_driver_bound(&mut self) -> bool;

    fn read_link_status(&mut self) -> Result<LinkStatus, ControlError>;

    /// Vendor/device identity dword from config space offset 0.
    fn device_id(&mut self) -> Result<u32, ControlError>;

    fn rebind_driver(&mut self) -> Result<(), ControlError>;

    fn bus_reset(&mut self) -> Result<(), ControlError>;
}

/// PCIe Link Status register (capability offset 0x12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus(pub u16);

impl LinkStatus {
    /// Bits 3:0, current link speed encoding.
    pub fn current_speed(self) -> u8 {
        (self.0 & 0x000f) as u8
    }

    /// Bits 9:4, negotiated link width.
    pub fn negotiated_width(self) -> u8 {
        ((self.0 >> 4) & 0x003f) as u8
    }

    /// Bit 13, Data Link Layer Link Active.
    pub fn dll_link_active(self) -> bool {
        self.0 & (1 << 13) != 0
    }

    /// A dead function reads back all ones; a powered-down link reads zero.
    pub fn is_up(self) -> bool {
        self.0 != 0xffff && self.0 != 0x0000 && self.negotiated_width() != 0
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x} (gen{} x{})",
            self.0,
            self.current_speed(),
            self.negotiated_width()
        )
    }
}
