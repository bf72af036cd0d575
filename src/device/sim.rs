//! Simulated PCI function with a programmable fault oracle.
//!
//! # Responsibilities
//! - Stand in for the BAR transport, the kernel log and sysfs controls
//! - Fault on chosen offsets the way real firmware does: the read returns
//!   all ones, AER lines appear in the log, the link drops until recovery
//! - Record reads, rebinds and resets for assertions
//!
//! The three handles returned by [`SimulatedBus::parts`] share one state, so
//! a read through the transport is visible to the log and control handles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{
    ControlError, DeviceControl, LinkStatus, LogCursor, LogError, LogSource, Transport,
    TransportError,
};

const SIM_BDF: &str = "0000:01:00.0";
const SIM_PORT: &str = "0000:00:1c.0";
const SIM_DRIVER: &str = "simdev";
const LINK_UP: u16 = 0x2013;

/// How the simulated device comes back after a completion timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    /// Firmware restarts by itself after this many health polls.
    AutoRecover { polls: u32 },
    /// Only a driver rebind (or reset) brings it back, this many polls later.
    NeedsRebind { polls: u32 },
    /// Nothing brings it back.
    Dead,
}

#[derive(Debug)]
struct SimState {
    window: u64,
    faulting: BTreeSet<u64>,
    gone: BTreeSet<u64>,
    unsupported: BTreeSet<u64>,
    unbinds: BTreeSet<u64>,
    scripts: BTreeMap<u64, VecDeque<bool>>,
    behavior: SimBehavior,
    declines: bool,
    clock: u64,
    log: Vec<(u64, String)>,
    degraded: bool,
    present: bool,
    bound: bool,
    intervened: bool,
    polls: u32,
    reads: Vec<u64>,
    rebinds: u32,
    resets: u32,
}

impl SimState {
    fn emit(&mut self, line: String) {
        self.clock += 10;
        let ts = self.clock;
        let stamped = format!("[{:>5}.{:06}] {}", ts / 1_000_000, ts % 1_000_000, line);
        self.log.push((ts, stamped));
    }

    fn completion_timeout(&mut self) {
        self.emit(format!(
            "pcieport {}: AER: Uncorrected (Non-Fatal) error received: {}",
            SIM_PORT, SIM_BDF
        ));
        self.emit(format!(
            "{} {}: PCIe Bus Error: severity=Uncorrected (Non-Fatal), type=Transaction Layer, (Requester ID)",
            SIM_DRIVER, SIM_BDF
        ));
        self.emit(format!(
            "{} {}:    [14] CmpltTO                (First)",
            SIM_DRIVER, SIM_BDF
        ));
        if self.declines {
            self.emit(format!(
                "{} {}: AER: can't recover (no error_detected callback)",
                SIM_DRIVER, SIM_BDF
            ));
        }
        self.degraded = true;
        self.intervened = false;
        self.polls = 0;
    }

    fn should_fault(&mut self, offset: u64) -> bool {
        if let Some(script) = self.scripts.get_mut(&offset) {
            if let Some(next) = script.pop_front() {
                return next;
            }
        }
        self.faulting.contains(&offset)
    }

    fn tick(&mut self) {
        if !self.degraded || !self.present {
            return;
        }
        self.polls += 1;
        let recovered = match self.behavior {
            SimBehavior::AutoRecover { polls } => self.polls >= polls,
            SimBehavior::NeedsRebind { polls } => self.intervened && self.polls >= polls,
            SimBehavior::Dead => false,
        };
        if recovered {
            self.degraded = false;
            self.bound = true;
            self.emit(format!("{} {}: firmware successfully recovered", SIM_DRIVER, SIM_BDF));
        }
    }

    fn intervene(&mut self) {
        self.bound = true;
        if self.degraded {
            self.intervened = true;
            self.polls = 0;
        }
    }
}

/// Builder and inspection handle for a simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// A healthy device with a `window`-byte BAR that recovers on its own.
    pub fn new(window: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                window,
                faulting: BTreeSet::new(),
                gone: BTreeSet::new(),
                unsupported: BTreeSet::new(),
                unbinds: BTreeSet::new(),
                scripts: BTreeMap::new(),
                behavior: SimBehavior::AutoRecover { polls: 1 },
                declines: false,
                clock: 1_000_000,
                log: Vec::new(),
                degraded: false,
                present: true,
                bound: true,
                intervened: false,
                polls: 0,
                reads: Vec::new(),
                rebinds: 0,
                resets: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reading `offset` causes a completion timeout every time.
    pub fn with_fault(self, offset: u64) -> Self {
        self.lock().faulting.insert(offset);
        self
    }

    /// Reading `offset` makes the device drop off the bus.
    pub fn with_device_gone(self, offset: u64) -> Self {
        self.lock().gone.insert(offset);
        self
    }

    /// Reading `offset` logs an unsupported-request completion but is harmless.
    pub fn with_unsupported(self, offset: u64) -> Self {
        self.lock().unsupported.insert(offset);
        self
    }

    /// Reading `offset` detaches the driver without logging anything; a
    /// rebind attaches it again.
    pub fn with_driver_unbind(self, offset: u64) -> Self {
        self.lock().unbinds.insert(offset);
        self
    }

    /// Per-read fault script for `offset`; once exhausted the permanent
    /// fault set decides.
    pub fn with_script(self, offset: u64, faults: &[bool]) -> Self {
        self.lock()
            .scripts
            .insert(offset, faults.iter().copied().collect());
        self
    }

    /// The driver logs that it cannot recover after every completion timeout.
    pub fn with_declined_recovery(self) -> Self {
        self.lock().declines = true;
        self
    }

    pub fn with_behavior(self, behavior: SimBehavior) -> Self {
        self.lock().behavior = behavior;
        self
    }

    /// Transport, log and control handles sharing this device.
    pub fn parts(&self) -> (SimTransport, SimLog, SimControl) {
        (
            SimTransport { bus: self.clone() },
            SimLog { bus: self.clone() },
            SimControl { bus: self.clone() },
        )
    }

    /// Every offset read so far, in order.
    pub fn reads(&self) -> Vec<u64> {
        self.lock().reads.clone()
    }

    pub fn read_count(&self, offset: u64) -> usize {
        self.lock().reads.iter().filter(|&&o| o == offset).count()
    }

    pub fn rebinds(&self) -> u32 {
        self.lock().rebinds
    }

    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// Driver tag used in simulated log lines.
    pub fn driver_tag() -> &'static str {
        SIM_DRIVER
    }
}

/// Simulated BAR transport.
#[derive(Debug, Clone)]
pub struct SimTransport {
    bus: SimulatedBus,
}

impl Transport for SimTransport {
    fn window_size(&self) -> u64 {
        self.bus.lock().window
    }

    fn read_aligned4(&mut self, offset: u64) -> Result<u32, TransportError> {
        let mut state = self.bus.lock();
        if offset % 4 != 0 {
            return Err(TransportError::Unaligned(offset));
        }
        if offset + 4 > state.window {
            return Err(TransportError::OutOfBounds {
                offset,
                size: state.window,
            });
        }
        state.reads.push(offset);

        if !state.present {
            return Err(TransportError::Timeout { offset });
        }
        if state.degraded {
            return Ok(0xffff_ffff);
        }
        if state.gone.contains(&offset) {
            state.emit(format!(
                "pcieport {}: pciehp: Slot(0): Card not present",
                SIM_PORT
            ));
            state.present = false;
            state.bound = false;
            return Ok(0xffff_ffff);
        }
        if state.should_fault(offset) {
            state.completion_timeout();
            return Ok(0xffff_ffff);
        }
        if state.unbinds.contains(&offset) {
            state.bound = false;
            return Ok((offset as u32) ^ 0xa5a5_0000);
        }
        if state.unsupported.contains(&offset) {
            state.emit(format!(
                "{} {}:    [20] UnsupReq               (First)",
                SIM_DRIVER, SIM_BDF
            ));
            return Ok(0xffff_ffff);
        }
        Ok((offset as u32) ^ 0xa5a5_0000)
    }
}

/// Simulated kernel log.
#[derive(Debug, Clone)]
pub struct SimLog {
    bus: SimulatedBus,
}

impl LogSource for SimLog {
    fn tail_since(&mut self, cursor: LogCursor) -> Result<(Vec<String>, LogCursor), LogError> {
        let state = self.bus.lock();
        let mut next = cursor;
        let lines: Vec<String> = state
            .log
            .iter()
            .filter(|(ts, _)| cursor.precedes(*ts, 0))
            .map(|(ts, line)| {
                next = LogCursor::after(*ts, 0);
                line.clone()
            })
            .collect();
        Ok((lines, next))
    }
}

/// Simulated sysfs controls. Each presence check counts as one health poll.
#[derive(Debug, Clone)]
pub struct SimControl {
    bus: SimulatedBus,
}

impl DeviceControl for SimControl {
    fn is_present(&mut self) -> bool {
        let mut state = self.bus.lock();
        state.tick();
        state.present
    }

    fn is_driver_bound(&mut self) -> bool {
        self.bus.lock().bound
    }

    fn read_link_status(&mut self) -> Result<LinkStatus, ControlError> {
        let state = self.bus.lock();
        if !state.present || state.degraded {
            return Ok(LinkStatus(0xffff));
        }
        Ok(LinkStatus(LINK_UP))
    }

    fn device_id(&mut self) -> Result<u32, ControlError> {
        let state = self.bus.lock();
        if !state.present || state.degraded {
            return Ok(0xffff_ffff);
        }
        Ok(0x1107_17cb)
    }

    fn rebind_driver(&mut self) -> Result<(), ControlError> {
        let mut state = self.bus.lock();
        state.rebinds += 1;
        if !state.present {
            return Err(ControlError::Command {
                command: "rebind".to_string(),
                detail: "no such device".to_string(),
            });
        }
        state.intervene();
        Ok(())
    }

    fn bus_reset(&mut self) -> Result<(), ControlError> {
        let mut state = self.bus.lock();
        state.resets += 1;
        if !state.present {
            return Err(ControlError::Unsupported("function reset"));
        }
        state.intervene();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_degrades_until_polled() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x40)
            .with_behavior(SimBehavior::AutoRecover { polls: 2 });
        let (mut transport, mut log, mut control) = bus.parts();

        assert_eq!(transport.read_aligned4(0x3c).unwrap(), 0xa5a5_003c);
        assert_eq!(transport.read_aligned4(0x40).unwrap(), 0xffff_ffff);
        assert!(bus.is_degraded());

        let (lines, _) = log.tail_since(LogCursor::default()).unwrap();
        assert!(lines.iter().any(|l| l.contains("CmpltTO")));

        assert!(!control.read_link_status().unwrap().is_up());
        control.is_present();
        assert!(bus.is_degraded());
        control.is_present();
        assert!(!bus.is_degraded());
        assert!(control.read_link_status().unwrap().is_up());
    }

    #[test]
    fn test_needs_rebind() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x0)
            .with_behavior(SimBehavior::NeedsRebind { polls: 1 });
        let (mut transport, _, mut control) = bus.parts();

        transport.read_aligned4(0).unwrap();
        for _ in 0..5 {
            control.is_present();
        }
        assert!(bus.is_degraded());

        control.rebind_driver().unwrap();
        control.is_present();
        assert!(!bus.is_degraded());
        assert_eq!(bus.rebinds(), 1);
    }

    #[test]
    fn test_script_then_permanent_set() {
        let bus = SimulatedBus::new(0x100)
            .with_script(0x8, &[false, true])
            .with_behavior(SimBehavior::AutoRecover { polls: 1 });
        let (mut transport, _, mut control) = bus.parts();

        transport.read_aligned4(0x8).unwrap();
        assert!(!bus.is_degraded());
        transport.read_aligned4(0x8).unwrap();
        assert!(bus.is_degraded());
        control.is_present();
        transport.read_aligned4(0x8).unwrap();
        assert!(!bus.is_degraded());
        assert_eq!(bus.read_count(0x8), 3);
    }

    #[test]
    fn test_device_gone() {
        let bus = SimulatedBus::new(0x100).with_device_gone(0x10);
        let (mut transport, _, mut control) = bus.parts();

        transport.read_aligned4(0x10).unwrap();
        assert!(!control.is_present());
        assert!(matches!(
            transport.read_aligned4(0x14),
            Err(TransportError::Timeout { offset: 0x14 })
        ));
        assert!(control.rebind_driver().is_err());
    }
}
