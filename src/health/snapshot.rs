//! Health snapshots.
//!
//! # Responsibilities
//! - Query presence, driver binding and link status
//! - Classify kernel log lines appended since the last check
//! - Advance the log cursor as a side effect of every check
//!
//! # Design Decisions
//! - Synchronous: every input is a sysfs read or one log read
//! - A failed log read is reported as an `Unknown` fault and the cursor is
//!   kept, so the lines are classified on the next successful read
//! - A driver's refusal to recover stays flagged on every verdict until the
//!   device is healthy again

use std::time::SystemTime;

use crate::device::{DeviceControl, LogCursor, LogError, LogSource};
use crate::health::{Classification, FaultClassifier, HealthVerdict};
use crate::health::FaultKind;

/// Produces [`HealthVerdict`]s for one device.
pub struct HealthMonitor<L, C> {
    log: L,
    control: C,
    classifier: FaultClassifier,
    cursor: LogCursor,
    declined: bool,
}

impl<L: LogSource, C: DeviceControl> HealthMonitor<L, C> {
    pub fn new(log: L, control: C, classifier: FaultClassifier) -> Self {
        Self {
            log,
            control,
            classifier,
            cursor: LogCursor::default(),
            declined: false,
        }
    }

    /// Move the cursor to the current end of the log so history from before
    /// the run is never attributed to a probe.
    pub fn skip_history(&mut self) -> Result<LogCursor, LogError> {
        let (lines, cursor) = self.log.tail_since(self.cursor)?;
        tracing::debug!(skipped = lines.len(), "Skipped kernel log history");
        self.cursor = cursor;
        Ok(cursor)
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    /// Take one health snapshot.
    pub fn snapshot(&mut self) -> HealthVerdict {
        let present = self.control.is_present();
        let (driver_bound, link_status) = if present {
            let bound = self.control.is_driver_bound();
            let link = match self.control.read_link_status() {
                Ok(link) => Some(link),
                Err(e) => {
                    tracing::debug!(error = %e, "Link status unreadable");
                    None
                }
            };
            (bound, link)
        } else {
            (false, None)
        };

        let classification = self.read_log();
        if classification.terminal_confirmed {
            self.declined = true;
        }

        let verdict = HealthVerdict {
            present,
            driver_bound,
            link_up: link_status.map(|l| l.is_up()).unwrap_or(false),
            link_status,
            new_faults: classification.faults,
            terminal_confirmed: self.declined,
            checked_at: SystemTime::now(),
        };
        if verdict.is_healthy() {
            self.declined = false;
        }
        verdict
    }

    /// Consume pending log lines without judging the device.
    pub fn drain(&mut self) -> Classification {
        self.read_log()
    }

    fn read_log(&mut self) -> Classification {
        match self.log.tail_since(self.cursor) {
            Ok((lines, cursor)) => {
                self.cursor = cursor;
                let classification = self.classifier.classify(&lines);
                if !classification.faults.is_empty() {
                    for line in &lines {
                        tracing::debug!(line = %line, "Kernel log");
                    }
                }
                classification
            }
            Err(e) => {
                tracing::warn!(error = %e, "Kernel log unreadable");
                Classification {
                    faults: vec![FaultKind::Unknown],
                    terminal_confirmed: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ClassifierConfig;
    use crate::device::{SimulatedBus, Transport};

    fn monitor(bus: &SimulatedBus) -> HealthMonitor<crate::device::SimLog, crate::device::SimControl> {
        let (_, log, control) = bus.parts();
        HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default()))
    }

    #[test]
    fn test_healthy_device() {
        let bus = SimulatedBus::new(0x100);
        let verdict = monitor(&bus).snapshot();
        assert!(verdict.is_healthy());
        assert!(verdict.new_faults.is_empty());
    }

    #[test]
    fn test_fault_is_reported_once() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x20)
            .with_behavior(crate::device::SimBehavior::Dead);
        let mut monitor = monitor(&bus);
        let (mut transport, _, _) = bus.parts();
        transport.read_aligned4(0x20).unwrap();

        let first = monitor.snapshot();
        assert!(!first.is_healthy());
        assert_eq!(first.new_faults, vec![FaultKind::CompletionTimeout]);

        let second = monitor.snapshot();
        assert!(second.new_faults.is_empty());
        // Still unhealthy: the link stays down until recovery.
        assert!(!second.link_up);
        assert!(!second.is_healthy());
    }

    #[test]
    fn test_skip_history() {
        let bus = SimulatedBus::new(0x100).with_unsupported(0x4);
        let (mut transport, _, _) = bus.parts();
        transport.read_aligned4(0x4).unwrap();

        let mut monitor = monitor(&bus);
        monitor.skip_history().unwrap();
        assert!(monitor.snapshot().new_faults.is_empty());
    }

    #[test]
    fn test_unsupported_request_stays_healthy() {
        let bus = SimulatedBus::new(0x100).with_unsupported(0x4);
        let mut monitor = monitor(&bus);
        let (mut transport, _, _) = bus.parts();
        transport.read_aligned4(0x4).unwrap();

        let verdict = monitor.snapshot();
        assert!(verdict.is_healthy());
        assert_eq!(verdict.new_faults, vec![FaultKind::UnsupportedRequest]);
    }
}
