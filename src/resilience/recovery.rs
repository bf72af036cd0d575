//! Device recovery state machine.
//!
//! # States
//! - Healthy: device answers and the log is quiet
//! - Degraded: a destructive fault was observed
//! - AwaitingAutoRecovery: polling while firmware restarts on its own
//! - Rebinding: driver rebind (or function reset) issued, polling again
//! - Unrecoverable: nothing brought the device back
//!
//! # State Transitions
//! ```text
//! Healthy → Degraded: CompletionTimeout or DeviceGone observed
//! Degraded → AwaitingAutoRecovery: always
//! AwaitingAutoRecovery → Healthy: verdict healthy within auto_recovery_timeout
//! AwaitingAutoRecovery → Rebinding: timeout, or the driver declined to recover
//! Rebinding → Healthy: verdict healthy within rebind_timeout
//! Rebinding → Unrecoverable: timeout
//! Healthy → Degraded: completion timeout logged while settling
//! ```
//!
//! # Design Decisions
//! - One attempt per fault; polling is at a fixed interval, never a tight loop
//! - Every transition is logged with the trigger and elapsed time
//! - A device that leaves the bus ends recovery at once
//! - Recovery is only finished once the settle window passes without a
//!   destructive fault; a device that keeps relapsing is unrecoverable

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::config::schema::RecoveryConfig;
use crate::device::{DeviceControl, LogSource};
use crate::health::{FaultKind, HealthMonitor, HealthVerdict};
use crate::observability::metrics;

/// Settle-window relapses tolerated before giving up on the device.
const MAX_SETTLE_RELAPSES: u32 = 2;

/// Recovery state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    Healthy,
    Degraded,
    AwaitingAutoRecovery,
    Rebinding,
    Unrecoverable,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::Healthy => "healthy",
            RecoveryState::Degraded => "degraded",
            RecoveryState::AwaitingAutoRecovery => "awaiting_auto_recovery",
            RecoveryState::Rebinding => "rebinding",
            RecoveryState::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// A single state change, timed from the start of the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RecoveryState,
    pub to: RecoveryState,
    pub elapsed: Duration,
}

/// How a recovery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Device was already healthy; nothing to do.
    AlreadyHealthy,
    /// Came back on its own (transient).
    Recovered,
    /// Came back after a rebind or reset (escalated).
    Escalated,
    /// Still down after the rebind window (terminal for the range).
    Unrecoverable,
    /// Left the bus (terminal for the run).
    DeviceGone,
}

impl RecoveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryOutcome::AlreadyHealthy => "already_healthy",
            RecoveryOutcome::Recovered => "recovered",
            RecoveryOutcome::Escalated => "escalated",
            RecoveryOutcome::Unrecoverable => "unrecoverable",
            RecoveryOutcome::DeviceGone => "device_gone",
        }
    }
}

/// Everything that happened during one recovery attempt.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub trigger: FaultKind,
    pub outcome: RecoveryOutcome,
    pub transitions: Vec<Transition>,
    pub elapsed: Duration,
    pub last_verdict: Option<HealthVerdict>,
}

impl RecoveryReport {
    pub fn visited(&self, state: RecoveryState) -> bool {
        self.transitions.iter().any(|t| t.to == state)
    }
}

enum PollResult {
    Healthy(HealthVerdict),
    TimedOut(Option<HealthVerdict>),
    /// Driver reported it will not recover; waiting longer is pointless.
    Declined(HealthVerdict),
    Gone(HealthVerdict),
}

/// Drives a faulted device back to health.
#[derive(Debug, Clone)]
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
}

struct Attempt {
    trigger: FaultKind,
    state: RecoveryState,
    started: Instant,
    transitions: Vec<Transition>,
    last_verdict: Option<HealthVerdict>,
}

impl Attempt {
    fn enter(&mut self, to: RecoveryState) {
        let elapsed = self.started.elapsed();
        let from = self.state;
        tracing::info!(
            from = %from,
            to = %to,
            trigger = %self.trigger,
            elapsed_ms = elapsed.as_millis() as u64,
            "Recovery transition"
        );
        self.transitions.push(Transition { from, to, elapsed });
        self.state = to;
    }
}

impl RecoveryOrchestrator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Bring the device back after `trigger` was observed.
    pub async fn recover<L, C>(
        &self,
        monitor: &mut HealthMonitor<L, C>,
        trigger: FaultKind,
    ) -> RecoveryReport
    where
        L: LogSource,
        C: DeviceControl,
    {
        let mut attempt = Attempt {
            trigger,
            state: RecoveryState::Healthy,
            started: Instant::now(),
            transitions: Vec::new(),
            last_verdict: None,
        };
        attempt.enter(RecoveryState::Degraded);

        let mut outcome = RecoveryOutcome::Unrecoverable;
        let mut escalated = false;
        let mut relapses = 0;

        loop {
            match attempt.state {
                RecoveryState::Degraded => {
                    if trigger.is_terminal_for_run() {
                        outcome = RecoveryOutcome::DeviceGone;
                        attempt.enter(RecoveryState::Unrecoverable);
                    } else {
                        attempt.enter(RecoveryState::AwaitingAutoRecovery);
                    }
                }
                RecoveryState::AwaitingAutoRecovery => {
                    match self
                        .poll_until_healthy(monitor, self.config.auto_recovery_timeout(), true)
                        .await
                    {
                        PollResult::Healthy(verdict) => {
                            attempt.last_verdict = Some(verdict);
                            outcome = RecoveryOutcome::Recovered;
                            attempt.enter(RecoveryState::Healthy);
                        }
                        PollResult::Gone(verdict) => {
                            attempt.last_verdict = Some(verdict);
                            outcome = RecoveryOutcome::DeviceGone;
                            attempt.enter(RecoveryState::Unrecoverable);
                        }
                        PollResult::Declined(verdict) => {
                            tracing::warn!("Driver declined to recover; escalating without waiting");
                            attempt.last_verdict = Some(verdict);
                            attempt.enter(RecoveryState::Rebinding);
                        }
                        PollResult::TimedOut(verdict) => {
                            attempt.last_verdict = verdict;
                            attempt.enter(RecoveryState::Rebinding);
                        }
                    }
                }
                RecoveryState::Rebinding => {
                    escalated = true;
                    self.intervene(monitor);
                    match self
                        .poll_until_healthy(monitor, self.config.rebind_timeout(), false)
                        .await
                    {
                        PollResult::Healthy(verdict) => {
                            attempt.last_verdict = Some(verdict);
                            outcome = RecoveryOutcome::Escalated;
                            attempt.enter(RecoveryState::Healthy);
                        }
                        PollResult::Gone(verdict) => {
                            attempt.last_verdict = Some(verdict);
                            outcome = RecoveryOutcome::DeviceGone;
                            attempt.enter(RecoveryState::Unrecoverable);
                        }
                        PollResult::Declined(verdict) => {
                            attempt.last_verdict = Some(verdict);
                            attempt.enter(RecoveryState::Unrecoverable);
                        }
                        PollResult::TimedOut(verdict) => {
                            attempt.last_verdict = verdict;
                            attempt.enter(RecoveryState::Unrecoverable);
                        }
                    }
                }
                RecoveryState::Healthy => {
                    let Some(late) = self.settle(monitor).await else {
                        break;
                    };
                    relapses += 1;
                    if late.is_terminal_for_run() {
                        outcome = RecoveryOutcome::DeviceGone;
                        attempt.enter(RecoveryState::Unrecoverable);
                    } else if relapses > MAX_SETTLE_RELAPSES {
                        tracing::error!(relapses, "Device keeps faulting while settling");
                        outcome = RecoveryOutcome::Unrecoverable;
                        attempt.enter(RecoveryState::Unrecoverable);
                    } else {
                        tracing::warn!(fault = %late, relapses, "Fault logged while settling; recovering again");
                        outcome = RecoveryOutcome::Unrecoverable;
                        attempt.enter(RecoveryState::Degraded);
                    }
                }
                RecoveryState::Unrecoverable => break,
            }
        }

        let elapsed = attempt.started.elapsed();
        metrics::record_recovery(outcome.as_str(), elapsed);

        match outcome {
            RecoveryOutcome::Unrecoverable | RecoveryOutcome::DeviceGone => tracing::error!(
                trigger = %trigger,
                outcome = outcome.as_str(),
                escalated,
                elapsed_ms = elapsed.as_millis() as u64,
                "Recovery failed"
            ),
            _ => tracing::info!(
                trigger = %trigger,
                outcome = outcome.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Device recovered"
            ),
        }

        RecoveryReport {
            trigger,
            outcome,
            transitions: attempt.transitions,
            elapsed,
            last_verdict: attempt.last_verdict,
        }
    }

    /// Check once and recover only if the device is not healthy.
    pub async fn ensure_healthy<L, C>(&self, monitor: &mut HealthMonitor<L, C>) -> RecoveryReport
    where
        L: LogSource,
        C: DeviceControl,
    {
        let verdict = monitor.snapshot();
        if verdict.is_healthy() {
            return RecoveryReport {
                trigger: FaultKind::Unknown,
                outcome: RecoveryOutcome::AlreadyHealthy,
                transitions: Vec::new(),
                elapsed: Duration::ZERO,
                last_verdict: Some(verdict),
            };
        }

        let trigger = verdict.dominant_fault().unwrap_or(FaultKind::Unknown);
        tracing::warn!(verdict = %verdict, trigger = %trigger, "Device unhealthy before probe");
        self.recover(monitor, trigger).await
    }

    fn intervene<L, C>(&self, monitor: &mut HealthMonitor<L, C>)
    where
        L: LogSource,
        C: DeviceControl,
    {
        let control = monitor.control_mut();
        match control.rebind_driver() {
            Ok(()) => tracing::warn!("Driver rebind issued"),
            Err(rebind_err) => {
                tracing::warn!(error = %rebind_err, "Driver rebind failed; trying function reset");
                match control.bus_reset() {
                    Ok(()) => tracing::warn!("Function reset issued"),
                    Err(reset_err) => {
                        tracing::error!(error = %reset_err, "Function reset failed")
                    }
                }
            }
        }
    }

    async fn poll_until_healthy<L, C>(
        &self,
        monitor: &mut HealthMonitor<L, C>,
        timeout: Duration,
        stop_on_decline: bool,
    ) -> PollResult
    where
        L: LogSource,
        C: DeviceControl,
    {
        let deadline = Instant::now() + timeout;
        let mut last = None;

        while Instant::now() < deadline {
            time::sleep(self.config.poll_interval()).await;

            let verdict = monitor.snapshot();
            tracing::debug!(verdict = %verdict, "Recovery poll");

            if verdict.is_healthy() {
                return PollResult::Healthy(verdict);
            }
            if !verdict.present {
                return PollResult::Gone(verdict);
            }
            if stop_on_decline && verdict.terminal_confirmed {
                return PollResult::Declined(verdict);
            }
            last = Some(verdict);
        }

        PollResult::TimedOut(last)
    }

    /// Wait out the settle window, then return any destructive fault the
    /// log picked up meanwhile.
    async fn settle<L, C>(&self, monitor: &mut HealthMonitor<L, C>) -> Option<FaultKind>
    where
        L: LogSource,
        C: DeviceControl,
    {
        time::sleep(self.config.settle()).await;
        let late = monitor.drain();
        FaultKind::dominant(
            late.faults
                .into_iter()
                .filter(|kind| matches!(kind, FaultKind::CompletionTimeout | FaultKind::DeviceGone)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ClassifierConfig;
    use crate::device::{SimBehavior, SimControl, SimLog, SimulatedBus, Transport};
    use crate::health::FaultClassifier;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            poll_interval_ms: 100,
            auto_recovery_timeout_secs: 1,
            rebind_timeout_secs: 1,
            settle_ms: 50,
            max_consecutive_failures: 3,
        }
    }

    fn faulted(behavior: SimBehavior) -> (SimulatedBus, HealthMonitor<SimLog, SimControl>) {
        let bus = SimulatedBus::new(0x100).with_fault(0x0).with_behavior(behavior);
        let (mut transport, log, control) = bus.parts();
        let mut monitor =
            HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default()));
        transport.read_aligned4(0).unwrap();
        monitor.snapshot();
        (bus, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recovery() {
        let (bus, mut monitor) = faulted(SimBehavior::AutoRecover { polls: 3 });
        let orchestrator = RecoveryOrchestrator::new(config());

        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert!(!report.visited(RecoveryState::Rebinding));
        assert_eq!(
            report.transitions.iter().map(|t| t.to).collect::<Vec<_>>(),
            vec![
                RecoveryState::Degraded,
                RecoveryState::AwaitingAutoRecovery,
                RecoveryState::Healthy
            ]
        );
        assert_eq!(bus.rebinds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_to_rebind() {
        let (bus, mut monitor) = faulted(SimBehavior::NeedsRebind { polls: 2 });
        let orchestrator = RecoveryOrchestrator::new(config());

        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Escalated);
        assert!(report.visited(RecoveryState::Rebinding));
        assert_eq!(bus.rebinds(), 1);
        assert!(!bus.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_after_rebind_window() {
        let (bus, mut monitor) = faulted(SimBehavior::Dead);
        let orchestrator = RecoveryOrchestrator::new(config());

        let started = Instant::now();
        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Unrecoverable);
        assert_eq!(
            report.transitions.last().map(|t| t.to),
            Some(RecoveryState::Unrecoverable)
        );
        // One rebind, no retry loop.
        assert_eq!(bus.rebinds(), 1);
        // Both windows were honoured, and nothing more.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_healthy_is_a_no_op_on_healthy_device() {
        let bus = SimulatedBus::new(0x100);
        let (_, log, control) = bus.parts();
        let mut monitor =
            HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default()));
        let orchestrator = RecoveryOrchestrator::new(config());

        let report = orchestrator.ensure_healthy(&mut monitor).await;
        assert_eq!(report.outcome, RecoveryOutcome::AlreadyHealthy);
        assert!(report.transitions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_recovery_skips_the_wait() {
        let bus = SimulatedBus::new(0x100)
            .with_fault(0x0)
            .with_declined_recovery()
            .with_behavior(SimBehavior::NeedsRebind { polls: 1 });
        let (mut transport, log, control) = bus.parts();
        let mut monitor =
            HealthMonitor::new(log, control, FaultClassifier::new(&ClassifierConfig::default()));
        transport.read_aligned4(0).unwrap();
        assert!(monitor.snapshot().terminal_confirmed);

        let orchestrator = RecoveryOrchestrator::new(RecoveryConfig {
            auto_recovery_timeout_secs: 600,
            ..config()
        });
        let started = Instant::now();
        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Escalated);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(bus.rebinds(), 1);
        // Cleared once the device is healthy again.
        assert!(!monitor.snapshot().terminal_confirmed);
    }

    /// Hands out one scripted batch of lines per log read.
    struct ScriptedLog {
        batches: std::collections::VecDeque<Vec<String>>,
        reads: u64,
    }

    impl ScriptedLog {
        fn new(batches: &[&[&str]]) -> Self {
            Self {
                batches: batches
                    .iter()
                    .map(|batch| batch.iter().map(|l| l.to_string()).collect())
                    .collect(),
                reads: 0,
            }
        }
    }

    impl LogSource for ScriptedLog {
        fn tail_since(
            &mut self,
            _cursor: crate::device::LogCursor,
        ) -> Result<(Vec<String>, crate::device::LogCursor), crate::device::LogError> {
            self.reads += 1;
            let lines = self.batches.pop_front().unwrap_or_default();
            Ok((lines, crate::device::LogCursor::after(self.reads, 0)))
        }
    }

    /// A device whose sysfs view is always fine.
    struct SteadyControl;

    impl DeviceControl for SteadyControl {
        fn is_present(&mut self) -> bool {
            true
        }
        fn is_driver_bound(&mut self) -> bool {
            true
        }
        fn read_link_status(&mut self) -> Result<crate::device::LinkStatus, crate::device::ControlError> {
            Ok(crate::device::LinkStatus(0x2013))
        }
        fn device_id(&mut self) -> Result<u32, crate::device::ControlError> {
            Ok(0x1107_17cb)
        }
        fn rebind_driver(&mut self) -> Result<(), crate::device::ControlError> {
            Ok(())
        }
        fn bus_reset(&mut self) -> Result<(), crate::device::ControlError> {
            Ok(())
        }
    }

    const LATE_TIMEOUT: &str = "ath12k_pci 0004:01:00.0:    [14] CmpltTO                (First)";

    fn scripted(batches: &[&[&str]]) -> HealthMonitor<ScriptedLog, SteadyControl> {
        HealthMonitor::new(
            ScriptedLog::new(batches),
            SteadyControl,
            FaultClassifier::new(&ClassifierConfig::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_settling_restarts_recovery() {
        // Poll, settle drain (late timeout), poll, settle drain.
        let mut monitor = scripted(&[&[], &[LATE_TIMEOUT], &[], &[]]);
        let orchestrator = RecoveryOrchestrator::new(config());

        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(
            report.transitions.iter().map(|t| t.to).collect::<Vec<_>>(),
            vec![
                RecoveryState::Degraded,
                RecoveryState::AwaitingAutoRecovery,
                RecoveryState::Healthy,
                RecoveryState::Degraded,
                RecoveryState::AwaitingAutoRecovery,
                RecoveryState::Healthy,
            ]
        );
        // The late timeout was dealt with, not left for the next probe.
        let next = orchestrator.ensure_healthy(&mut monitor).await;
        assert_eq!(next.outcome, RecoveryOutcome::AlreadyHealthy);
        assert!(monitor.snapshot().new_faults.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_settle_relapse_is_unrecoverable() {
        let mut monitor = scripted(&[
            &[],
            &[LATE_TIMEOUT],
            &[],
            &[LATE_TIMEOUT],
            &[],
            &[LATE_TIMEOUT],
        ]);
        let orchestrator = RecoveryOrchestrator::new(config());

        let report = orchestrator
            .recover(&mut monitor, FaultKind::CompletionTimeout)
            .await;

        assert_eq!(report.outcome, RecoveryOutcome::Unrecoverable);
        assert_eq!(report.transitions.last().map(|t| t.to), Some(RecoveryState::Unrecoverable));
        assert_eq!(
            report
                .transitions
                .iter()
                .filter(|t| t.to == RecoveryState::Healthy)
                .count(),
            3
        );
    }
}
