//! Bounded read sweeps.
//!
//! # Responsibilities
//! - Read every aligned DWORD of a range, in ascending order
//! - Take a health snapshot every `health_stride` reads and after the last
//! - Stop at the first unhealthy verdict
//!
//! # Design Decisions
//! - Reading on through firmware that stopped answering only prolongs the
//!   outage, so a sweep never continues past a bad verdict
//! - A transport error ends the sweep; the follow-up snapshot decides what
//!   it was. On a healthy device only a timeout counts as a fault
//! - AER lines can trail the read that caused them, so a clean sweep keeps
//!   watching for `probe.settle_ms`

use std::time::Duration;

use tokio::time::{self, Instant};

use crate::config::schema::ProbeConfig;
use crate::device::{DeviceControl, LogSource, Transport, TransportError};
use crate::health::{FaultKind, HealthMonitor, HealthVerdict};
use crate::observability::metrics;
use crate::probe::{ProbeError, ProbeOutcome};
use crate::search::range::{AddressRange, Hex};

/// Issues read sweeps through a [`Transport`].
pub struct ProbeExecutor<T> {
    transport: T,
    config: ProbeConfig,
}

struct Sweep {
    range: AddressRange,
    started: Instant,
    reads: u64,
    last_offset: Option<u64>,
    informational: Vec<FaultKind>,
}

impl Sweep {
    fn observe(&mut self, verdict: &HealthVerdict) {
        for kind in verdict.informational() {
            metrics::record_fault(kind.as_str());
            self.informational.push(kind);
        }
    }

    fn finish(self, fault_kind: Option<FaultKind>) -> ProbeOutcome {
        let elapsed = self.started.elapsed();
        let faulted = fault_kind.is_some();
        metrics::record_probe(if faulted { "faulted" } else { "clean" }, elapsed);
        if let Some(kind) = fault_kind {
            metrics::record_fault(kind.as_str());
            tracing::warn!(
                range = %self.range,
                offset = %Hex(self.last_offset.unwrap_or(self.range.start)),
                fault = %kind,
                reads = self.reads,
                elapsed_ms = elapsed.as_millis() as u64,
                "Probe faulted"
            );
        } else {
            tracing::info!(
                range = %self.range,
                reads = self.reads,
                elapsed_ms = elapsed.as_millis() as u64,
                "Probe clean"
            );
        }
        ProbeOutcome {
            range: self.range,
            faulted,
            fault_kind,
            elapsed,
            reads: self.reads,
            last_offset: self.last_offset,
            informational: self.informational,
        }
    }
}

impl<T: Transport> ProbeExecutor<T> {
    pub fn new(transport: T, config: ProbeConfig) -> Self {
        Self { transport, config }
    }

    pub fn window_size(&self) -> u64 {
        self.transport.window_size()
    }

    /// Sweep `range` once.
    pub async fn probe<L, C>(
        &mut self,
        range: AddressRange,
        monitor: &mut HealthMonitor<L, C>,
    ) -> Result<ProbeOutcome, ProbeError>
    where
        L: LogSource,
        C: DeviceControl,
    {
        let window = self.transport.window_size();
        if range.end > window {
            return Err(TransportError::OutOfBounds {
                offset: range.start.max(window),
                size: window,
            }
            .into());
        }

        let stride = self.config.health_stride.max(1);
        let stale = monitor.drain();
        let destructive = stale
            .faults
            .iter()
            .copied()
            .filter(|kind| matches!(kind, FaultKind::CompletionTimeout | FaultKind::DeviceGone));
        if let Some(kind) = FaultKind::dominant(destructive) {
            tracing::warn!(range = %range, fault = %kind, "Fault logged before the probe; not probing");
            return Err(ProbeError::NotReady(kind));
        }
        if !stale.faults.is_empty() {
            tracing::debug!(faults = ?stale.faults, "Discarded log lines from before the probe");
        }

        tracing::info!(range = %range, words = range.words(), "Probing");
        let mut sweep = Sweep {
            range,
            started: Instant::now(),
            reads: 0,
            last_offset: None,
            informational: Vec::new(),
        };

        for offset in range.offsets() {
            sweep.last_offset = Some(offset);
            sweep.reads += 1;

            match self.transport.read_aligned4(offset) {
                Ok(value) => {
                    tracing::trace!(offset = %Hex(offset), value = %Hex(u64::from(value)), "Read");
                }
                Err(e) => {
                    tracing::warn!(offset = %Hex(offset), error = %e, "Read failed");
                    let verdict = monitor.snapshot();
                    sweep.observe(&verdict);
                    let kind = if verdict.is_healthy() {
                        match e {
                            TransportError::Timeout { .. } => FaultKind::CompletionTimeout,
                            other => return Err(other.into()),
                        }
                    } else {
                        verdict.dominant_fault().unwrap_or(FaultKind::Unknown)
                    };
                    return Ok(sweep.finish(Some(kind)));
                }
            }

            let last = offset + 4 >= range.end;
            if sweep.reads % stride == 0 || last {
                let verdict = monitor.snapshot();
                sweep.observe(&verdict);
                if !verdict.is_healthy() {
                    tracing::debug!(verdict = %verdict, "Unhealthy during sweep");
                    return Ok(sweep.finish(verdict.dominant_fault()));
                }
            }
        }

        if let Some(kind) = self.settle(monitor, &mut sweep).await {
            return Ok(sweep.finish(Some(kind)));
        }
        Ok(sweep.finish(None))
    }

    async fn settle<L, C>(
        &self,
        monitor: &mut HealthMonitor<L, C>,
        sweep: &mut Sweep,
    ) -> Option<FaultKind>
    where
        L: LogSource,
        C: DeviceControl,
    {
        let settle = self.config.settle();
        if settle.is_zero() {
            return None;
        }
        let poll = self.config.settle_poll().max(Duration::from_millis(1));
        let deadline = Instant::now() + settle;

        while Instant::now() < deadline {
            let wait = poll.min(deadline.saturating_duration_since(Instant::now()));
            time::sleep(wait).await;
            let verdict = monitor.snapshot();
            sweep.observe(&verdict);
            if !verdict.is_healthy() {
                tracing::debug!(verdict = %verdict, "Fault surfaced while settling");
                return verdict.dominant_fault();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ClassifierConfig;
    use crate::device::{SimBehavior, SimControl, SimLog, SimTransport, SimulatedBus};
    use crate::health::FaultClassifier;

    fn setup(
        bus: &SimulatedBus,
        stride: u64,
    ) -> (ProbeExecutor<SimTransport>, HealthMonitor<SimLog, SimControl>) {
        let (transport, log, control) = bus.parts();
        let config = ProbeConfig {
            health_stride: stride,
            settle_ms: 0,
            settle_poll_ms: 0,
        };
        (
            ProbeExecutor::new(transport, config),
            HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default())),
        )
    }

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn test_clean_sweep_reads_every_word() {
        let bus = SimulatedBus::new(0x100);
        let (mut executor, mut monitor) = setup(&bus, 4);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();

        assert!(!outcome.faulted);
        assert_eq!(outcome.fault_kind, None);
        assert_eq!(outcome.reads, 16);
        assert_eq!(bus.reads(), range(0x40, 0x80).offsets().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stops_at_first_unhealthy_verdict() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x48)
            .with_behavior(SimBehavior::Dead);
        let (mut executor, mut monitor) = setup(&bus, 1);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();

        assert!(outcome.faulted);
        assert_eq!(outcome.fault_kind, Some(FaultKind::CompletionTimeout));
        assert_eq!(outcome.last_offset, Some(0x48));
        assert_eq!(bus.reads(), vec![0x40, 0x44, 0x48]);
    }

    #[tokio::test]
    async fn test_stride_bounds_overrun() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x44)
            .with_behavior(SimBehavior::Dead);
        let (mut executor, mut monitor) = setup(&bus, 4);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();

        assert!(outcome.faulted);
        // Detected at the fourth read, not the sixteenth.
        assert_eq!(outcome.reads, 4);
    }

    #[tokio::test]
    async fn test_fault_on_last_word_is_attributed_to_the_range() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x7c)
            .with_behavior(SimBehavior::Dead);
        let (mut executor, mut monitor) = setup(&bus, 64);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();
        assert!(outcome.faulted);
        assert_eq!(outcome.last_offset, Some(0x7c));
    }

    #[tokio::test]
    async fn test_device_gone_is_surfaced() {
        let bus = SimulatedBus::new(0x100).with_device_gone(0x40);
        let (mut executor, mut monitor) = setup(&bus, 1);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();
        assert_eq!(outcome.fault_kind, Some(FaultKind::DeviceGone));
        assert_eq!(outcome.reads, 1);
    }

    #[tokio::test]
    async fn test_unsupported_request_is_informational() {
        let bus = SimulatedBus::new(0x100).with_unsupported(0x50);
        let (mut executor, mut monitor) = setup(&bus, 1);

        let outcome = executor.probe(range(0x40, 0x80), &mut monitor).await.unwrap();
        assert!(!outcome.faulted);
        assert_eq!(outcome.informational, vec![FaultKind::UnsupportedRequest]);
    }

    #[tokio::test]
    async fn test_range_past_window_is_refused() {
        let bus = SimulatedBus::new(0x100);
        let (mut executor, mut monitor) = setup(&bus, 1);

        let result = executor.probe(range(0xc0, 0x110), &mut monitor).await;
        assert!(matches!(
            result,
            Err(ProbeError::Transport(TransportError::OutOfBounds { offset: 0x100, size: 0x100 }))
        ));
        assert!(bus.reads().is_empty());
    }

    #[tokio::test]
    async fn test_pending_timeout_refuses_sweep() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x48)
            .with_behavior(SimBehavior::Dead);
        let (mut executor, mut monitor) = setup(&bus, 1);
        // Something else tripped the device before this probe.
        let (mut other, _, _) = bus.parts();
        other.read_aligned4(0x48).unwrap();

        let result = executor.probe(range(0x0, 0x10), &mut monitor).await;
        assert!(matches!(
            result,
            Err(ProbeError::NotReady(FaultKind::CompletionTimeout))
        ));
        assert_eq!(bus.reads(), vec![0x48]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_window_is_waited_after_clean_sweep() {
        let bus = SimulatedBus::new(0x100);
        let (transport, log, control) = bus.parts();
        let mut executor = ProbeExecutor::new(
            transport,
            ProbeConfig {
                health_stride: 64,
                settle_ms: 1_000,
                settle_poll_ms: 250,
            },
        );
        let mut monitor =
            HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default()));

        let started = Instant::now();
        let outcome = executor.probe(range(0x0, 0x10), &mut monitor).await.unwrap();
        assert!(!outcome.faulted);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
