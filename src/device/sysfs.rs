//! Device control through Linux sysfs.
//!
//! # Responsibilities
//! - Presence and driver-binding checks from the device directory
//! - Link Status and identity reads from the `config` file
//! - Driver rebind (sysfs unbind/bind or a module reload) and function reset

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::schema::{DeviceConfig, RebindMethod};
use crate::device::{ControlError, DeviceControl, LinkStatus};

/// `DeviceControl` for one PCI function under `<root>/bus/pci/devices/<bdf>`.
#[derive(Debug, Clone)]
pub struct SysfsControl {
    bdf: String,
    driver: String,
    link_status_offset: u64,
    rebind_method: RebindMethod,
    root: PathBuf,
}

impl SysfsControl {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            bdf: config.bdf.clone(),
            driver: config.driver.clone(),
            link_status_offset: config.link_status_offset,
            rebind_method: config.rebind_method,
            root: PathBuf::from(&config.sysfs_root),
        }
    }

    /// `<root>/bus/pci/devices/<bdf>`.
    pub fn device_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices").join(&self.bdf)
    }

    /// `<device_dir>/resource<bar>`.
    pub fn resource_path(&self, bar: u8) -> PathBuf {
        self.device_dir().join(format!("resource{}", bar))
    }

    fn driver_dir(&self) -> PathBuf {
        self.root.join("bus/pci/drivers").join(&self.driver)
    }

    fn read_config(&self, offset: u64, buf: &mut [u8]) -> Result<(), ControlError> {
        let file = File::open(self.device_dir().join("config"))?;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_node(path: &Path, value: &str) -> Result<(), ControlError> {
        fs::write(path, value).map_err(|e| ControlError::Command {
            command: format!("write {}", path.display()),
            detail: e.to_string(),
        })
    }

    fn run(program: &str, args: &[&str]) -> Result<(), ControlError> {
        let output = Command::new(program).args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(ControlError::Command {
            command: format!("{} {}", program, args.join(" ")),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl DeviceControl for SysfsControl {
    fn is_present(&mut self) -> bool {
        self.device_dir().exists()
    }

    fn is_driver_bound(&mut self) -> bool {
        self.device_dir().join("driver").exists()
    }

    fn read_link_status(&mut self) -> Result<LinkStatus, ControlError> {
        let mut raw = [0u8; 2];
        self.read_config(self.link_status_offset, &mut raw)?;
        Ok(LinkStatus(u16::from_le_bytes(raw)))
    }

    fn device_id(&mut self) -> Result<u32, ControlError> {
        let mut raw = [0u8; 4];
        self.read_config(0, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn rebind_driver(&mut self) -> Result<(), ControlError> {
        match self.rebind_method {
            RebindMethod::Sysfs => {
                let driver_dir = self.driver_dir();
                if self.is_driver_bound() {
                    Self::write_node(&driver_dir.join("unbind"), &self.bdf)?;
                }
                Self::write_node(&driver_dir.join("bind"), &self.bdf)
            }
            RebindMethod::Modprobe => {
                Self::run("modprobe", &["-r", &self.driver])?;
                Self::run("modprobe", &[&self.driver])
            }
        }
    }

    fn bus_reset(&mut self) -> Result<(), ControlError> {
        let reset = self.device_dir().join("reset");
        if !reset.exists() {
            return Err(ControlError::Unsupported("function reset"));
        }
        Self::write_node(&reset, "1")
    }
}
