//! BAR access through the sysfs `resourceN` file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::device::{Transport, TransportError};

/// Read-only mapping of one PCI BAR.
///
/// Reads are issued as single volatile 32-bit loads. On a completion timeout
/// the root complex answers the load itself (all ones) after its own timer
/// fires, so a read never hangs the process.
pub struct MmioTransport {
    path: PathBuf,
    map: Mmap,
    size: u64,
    // Keeps the descriptor alive for the lifetime of the mapping.
    _file: File,
}

impl MmioTransport {
    /// Map `size` bytes of the resource file (or the whole file when `None`).
    pub fn open(path: &Path, size: Option<u64>) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;

        let size = match size {
            Some(size) => size,
            None => file.metadata()?.len(),
        };

        // SAFETY: the mapping is read-only and only ever accessed through
        // bounds-checked volatile loads in `read_aligned4`.
        let map = unsafe { MmapOptions::new().len(size as usize).map(&file)? };

        tracing::info!(path = %path.display(), size, "BAR mapped");

        Ok(Self {
            path: path.to_path_buf(),
            map,
            size,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for MmioTransport {
    fn window_size(&self) -> u64 {
        self.size
    }

    fn read_aligned4(&mut self, offset: u64) -> Result<u32, TransportError> {
        if offset % 4 != 0 {
            return Err(TransportError::Unaligned(offset));
        }
        if offset + 4 > self.size {
            return Err(TransportError::OutOfBounds {
                offset,
                size: self.size,
            });
        }

        // SAFETY: offset is aligned and `offset + 4 <= len`, checked above.
        let value = unsafe {
            let ptr = self.map.as_ptr().add(offset as usize) as *const u32;
            std::ptr::read_volatile(ptr)
        };

        Ok(u32::from_le(value))
    }
}
