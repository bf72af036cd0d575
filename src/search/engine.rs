//! Bisection engine.
//!
//! # Phases
//! - Coarse: probe each chunk in address order; faulting chunks become suspects
//! - Bisect: halve the lowest-addressed suspect until a single DWORD remains
//! - Verify: re-probe each candidate in isolation and keep it on a majority
//!
//! # Design Decisions
//! - Exactly one step per loop iteration: a probe (plus the recovery it
//!   triggered), a readiness recovery, or a phase change
//! - Every step ends with a checkpoint; a stop request is only honoured
//!   after that checkpoint
//! - The device is brought back to health before every probe, so no probe
//!   is ever issued against a degraded device
//! - `DeviceGone` leaves the state exactly as it was and ends the run
//! - Only a completion timeout blames a range; other faults are recorded
//!   and the next readiness check deals with the device
//! - A fault logged before the first read blames nothing: the device is
//!   recovered and the same range is probed again

use std::fmt;

use crate::config::schema::{BisectConfig, RegionConfig, VerifyConfig};
use crate::device::{DeviceControl, LogSource, Transport};
use crate::error::BisectError;
use crate::health::HealthMonitor;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::probe::{ProbeError, ProbeExecutor};
use crate::resilience::{RecoveryOrchestrator, RecoveryOutcome};
use crate::search::range::{AddressRange, Hex};
use crate::search::report::RunReport;
use crate::search::state::{CrashStatus, Phase, RangeResult, SearchState};
use crate::store::CheckpointStore;

/// Why a run stopped before `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The device left the bus.
    DeviceGone,
    /// Too many unrecoverable outcomes in a row.
    RecoveryExhausted { failures: u32 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::DeviceGone => f.write_str("device left the bus"),
            AbortReason::RecoveryExhausted { failures } => {
                write!(f, "{} consecutive recoveries failed", failures)
            }
        }
    }
}

/// How [`BisectionEngine::run`] ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    /// A stop was requested; the state is checkpointed and resumable.
    Interrupted(SearchState),
    Aborted {
        reason: AbortReason,
        state: SearchState,
    },
}

enum Step {
    Next(SearchState),
    Abort(AbortReason, SearchState),
}

/// What a probe plus its recovery produced.
enum Probed {
    Resolved(RangeResult),
    /// Recovered from a fault that predates the probe; nothing resolved.
    Relapsed { recovered: bool },
    Gone,
}

enum Readiness {
    Ready { recovered: bool },
    Unrecoverable,
    Gone,
}

/// Drives a run over one device.
pub struct BisectionEngine<T, L, C, S> {
    executor: ProbeExecutor<T>,
    monitor: HealthMonitor<L, C>,
    recovery: RecoveryOrchestrator,
    store: S,
    verify: VerifyConfig,
    regions: Vec<RegionConfig>,
    shutdown: Option<ShutdownSignal>,
}

impl<T, L, C, S> BisectionEngine<T, L, C, S>
where
    T: Transport,
    L: LogSource,
    C: DeviceControl,
    S: CheckpointStore,
{
    pub fn new(transport: T, monitor: HealthMonitor<L, C>, store: S, config: &BisectConfig) -> Self {
        Self {
            executor: ProbeExecutor::new(transport, config.probe.clone()),
            monitor,
            recovery: RecoveryOrchestrator::new(config.recovery.clone()),
            store,
            verify: config.verify.clone(),
            regions: config.report.regions.clone(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn window_size(&self) -> u64 {
        self.executor.window_size()
    }

    /// Run from `state` until done, aborted or interrupted.
    pub async fn run(&mut self, mut state: SearchState) -> Result<RunOutcome, BisectError> {
        let window = self.executor.window_size();
        if state.range.end > window {
            return Err(BisectError::PastWindow {
                range: state.range,
                window,
            });
        }
        if state.sequence == 0 {
            self.checkpoint(&state)?;
        }
        if let Err(e) = self.monitor.skip_history() {
            tracing::warn!(error = %e, "Could not skip kernel log history");
        }

        tracing::info!(
            run_id = %state.run_id,
            range = %state.range,
            chunk_size = %Hex(state.chunk_size),
            phase = %state.phase,
            sequence = state.sequence,
            "Run started"
        );
        metrics::record_phase(state.phase.ordinal());
        let max_failures = self.recovery.config().max_consecutive_failures.max(1);

        while !state.is_done() {
            let step = if state.phase_exhausted() {
                Step::Next(self.advance_phase(state))
            } else {
                self.step(state).await?
            };

            let (next, abort) = match step {
                Step::Next(next) => (next, None),
                Step::Abort(reason, unchanged) => (unchanged, Some(reason)),
            };
            let next = next.next_sequence();
            self.checkpoint(&next)?;

            if let Some(reason) = abort {
                return Ok(self.aborted(reason, next));
            }
            if next.recovery_failures >= max_failures {
                let reason = AbortReason::RecoveryExhausted {
                    failures: next.recovery_failures,
                };
                return Ok(self.aborted(reason, next));
            }
            if self.stop_requested() {
                tracing::warn!(
                    run_id = %next.run_id,
                    sequence = next.sequence,
                    phase = %next.phase,
                    "Run interrupted; resume with the same run id"
                );
                return Ok(RunOutcome::Interrupted(next));
            }
            state = next;
        }

        let report = RunReport::from_state(&state, &self.regions);
        tracing::info!(
            run_id = %state.run_id,
            confirmed = report.confirmed_offsets().len(),
            transient = report.transient.len(),
            abandoned = report.abandoned.len(),
            "Run complete"
        );
        Ok(RunOutcome::Completed(report))
    }

    async fn step(&mut self, state: SearchState) -> Result<Step, BisectError> {
        match state.phase {
            Phase::Coarse => {
                let Some(chunk) = state.next_chunk() else {
                    return Ok(Step::Next(state));
                };
                self.probe_step(state, chunk, SearchState::resolve_chunk).await
            }
            Phase::Bisect => {
                let Some(head) = state.next_suspect() else {
                    return Ok(Step::Next(state));
                };
                if !head.known_faulty {
                    tracing::info!(range = %head.range, "Probing pushed-back half");
                    return self
                        .probe_step(state, head.range, SearchState::resolve_unknown_suspect)
                        .await;
                }
                match head.range.split() {
                    None => {
                        tracing::warn!(
                            offset = %Hex(head.range.start),
                            fault = %head.fault,
                            "Narrowed to a single offset"
                        );
                        Ok(Step::Next(state.promote_word()))
                    }
                    Some((lower, upper)) => {
                        tracing::info!(suspect = %head.range, lower = %lower, upper = %upper, "Bisecting");
                        self.probe_step(state, lower, SearchState::resolve_split).await
                    }
                }
            }
            Phase::Verify => self.verify_step(state).await,
            Phase::Done => Ok(Step::Next(state)),
        }
    }

    async fn probe_step(
        &mut self,
        state: SearchState,
        range: AddressRange,
        resolve: fn(SearchState, RangeResult) -> SearchState,
    ) -> Result<Step, BisectError> {
        let state = match self.ready(state).await {
            Ok(state) => state,
            Err(step) => return Ok(step),
        };

        Ok(match self.probe_and_recover(range).await? {
            Probed::Gone => Step::Abort(AbortReason::DeviceGone, state),
            Probed::Relapsed { recovered: true } => Step::Next(state.recovery_succeeded()),
            Probed::Relapsed { recovered: false } => Step::Next(state.recovery_failed()),
            Probed::Resolved(result) => {
                let next = resolve(state, result);
                Step::Next(match result {
                    RangeResult::Abandoned(_) => next.recovery_failed(),
                    RangeResult::Clean | RangeResult::Faulted(_) => next.recovery_succeeded(),
                })
            }
        })
    }

    async fn verify_step(&mut self, state: SearchState) -> Result<Step, BisectError> {
        if self.verify.skip {
            tracing::warn!(
                candidates = state.crash.iter().filter(|c| c.status == CrashStatus::Candidate).count(),
                "Verification skipped; promoting every candidate"
            );
            return Ok(Step::Next(state.confirm_unverified()));
        }
        let Some(candidate) = state.next_candidate() else {
            return Ok(Step::Next(state));
        };
        let required = self.verify.attempts.max(1);

        let state = match self.ready(state).await {
            Ok(state) => state,
            Err(step) => return Ok(step),
        };

        tracing::info!(
            offset = %Hex(candidate.offset),
            attempt = candidate.attempts + 1,
            of = required,
            "Verifying candidate"
        );
        let offset = candidate.offset;
        Ok(match self.probe_and_recover(AddressRange::word(offset)).await? {
            Probed::Gone => Step::Abort(AbortReason::DeviceGone, state),
            Probed::Relapsed { recovered: true } => Step::Next(state.recovery_succeeded()),
            Probed::Relapsed { recovered: false } => Step::Next(state.recovery_failed()),
            Probed::Resolved(RangeResult::Clean) => Step::Next(
                state
                    .record_verify_attempt(offset, false, required)
                    .recovery_succeeded(),
            ),
            Probed::Resolved(RangeResult::Faulted(_)) => Step::Next(
                state
                    .record_verify_attempt(offset, true, required)
                    .recovery_succeeded(),
            ),
            Probed::Resolved(RangeResult::Abandoned(kind)) => {
                Step::Next(state.abandon_candidate(offset, kind).recovery_failed())
            }
        })
    }

    /// Make sure the device is healthy before a probe. A failed recovery
    /// here blames no range: the step only counts the failure.
    async fn ready(&mut self, state: SearchState) -> Result<SearchState, Step> {
        match self.readiness().await {
            Readiness::Ready { recovered: false } => Ok(state),
            Readiness::Ready { recovered: true } => Ok(state.recovery_succeeded()),
            Readiness::Unrecoverable => Err(Step::Next(state.recovery_failed())),
            Readiness::Gone => Err(Step::Abort(AbortReason::DeviceGone, state)),
        }
    }

    async fn readiness(&mut self) -> Readiness {
        let report = self.recovery.ensure_healthy(&mut self.monitor).await;
        match report.outcome {
            RecoveryOutcome::AlreadyHealthy => Readiness::Ready { recovered: false },
            RecoveryOutcome::Recovered | RecoveryOutcome::Escalated => {
                Readiness::Ready { recovered: true }
            }
            RecoveryOutcome::Unrecoverable => Readiness::Unrecoverable,
            RecoveryOutcome::DeviceGone => Readiness::Gone,
        }
    }

    /// Probe `range` and, if it hit a completion timeout, recover.
    async fn probe_and_recover(&mut self, range: AddressRange) -> Result<Probed, BisectError> {
        let outcome = match self.executor.probe(range, &mut self.monitor).await {
            Ok(outcome) => outcome,
            Err(ProbeError::NotReady(kind)) => {
                if kind.is_terminal_for_run() {
                    return Ok(Probed::Gone);
                }
                let report = self.recovery.recover(&mut self.monitor, kind).await;
                return Ok(match report.outcome {
                    RecoveryOutcome::DeviceGone => Probed::Gone,
                    RecoveryOutcome::Unrecoverable => Probed::Relapsed { recovered: false },
                    RecoveryOutcome::AlreadyHealthy
                    | RecoveryOutcome::Recovered
                    | RecoveryOutcome::Escalated => Probed::Relapsed { recovered: true },
                });
            }
            Err(e) => return Err(e.into()),
        };
        let Some(kind) = outcome.fault_kind else {
            return Ok(Probed::Resolved(RangeResult::Clean));
        };
        if kind.is_terminal_for_run() {
            tracing::error!(range = %range, "Device left the bus during probe");
            return Ok(Probed::Gone);
        }
        if !kind.requires_recovery() {
            tracing::warn!(
                range = %range,
                fault = %kind,
                "Device unhealthy without a completion timeout; range not blamed"
            );
            return Ok(Probed::Resolved(RangeResult::Clean));
        }

        let report = self.recovery.recover(&mut self.monitor, kind).await;
        Ok(match report.outcome {
            RecoveryOutcome::AlreadyHealthy
            | RecoveryOutcome::Recovered
            | RecoveryOutcome::Escalated => Probed::Resolved(RangeResult::Faulted(kind)),
            RecoveryOutcome::Unrecoverable => Probed::Resolved(RangeResult::Abandoned(kind)),
            RecoveryOutcome::DeviceGone => Probed::Gone,
        })
    }

    fn advance_phase(&self, state: SearchState) -> SearchState {
        let from = state.phase;
        let next = state.advance_phase();
        tracing::info!(
            from = %from,
            to = %next.phase,
            suspects = next.suspect.len(),
            candidates = next.crash.len(),
            "Phase transition"
        );
        metrics::record_phase(next.phase.ordinal());
        next
    }

    fn checkpoint(&mut self, state: &SearchState) -> Result<(), BisectError> {
        self.store.save(state)?;
        let candidates = state
            .crash
            .iter()
            .filter(|c| c.status == CrashStatus::Candidate)
            .count();
        metrics::record_open_ranges(state.pending.len(), state.suspect.len(), candidates);
        tracing::debug!(
            sequence = state.sequence,
            phase = %state.phase,
            pending = state.pending.len(),
            suspect = state.suspect.len(),
            "Checkpoint"
        );
        Ok(())
    }

    fn aborted(&self, reason: AbortReason, state: SearchState) -> RunOutcome {
        tracing::error!(
            run_id = %state.run_id,
            sequence = state.sequence,
            reason = %reason,
            "Run aborted; state preserved for resume"
        );
        RunOutcome::Aborted { reason, state }
    }

    fn stop_requested(&mut self) -> bool {
        self.shutdown
            .as_mut()
            .map(ShutdownSignal::is_requested)
            .unwrap_or(false)
    }
}
