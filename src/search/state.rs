//! Persisted search state.
//!
//! # Responsibilities
//! - Hold the partition of the run range into pending, suspect, crash,
//!   safe and abandoned pieces
//! - Apply one search step at a time as a pure transition
//! - Check the partition invariant before anything is persisted
//!
//! # Design Decisions
//! - Transitions consume the state and return the next one; the engine
//!   never mutates a state it has already checkpointed
//! - `suspect` is kept sorted by start address, so its head is always the
//!   lowest-addressed open suspect

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::FaultKind;
use crate::search::range::{AddressRange, Hex, RangeError};

/// Search phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Coarse,
    Bisect,
    Verify,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Coarse => "coarse",
            Phase::Bisect => "bisect",
            Phase::Verify => "verify",
            Phase::Done => "done",
        }
    }

    /// Numeric value for the phase gauge.
    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Coarse => 0,
            Phase::Bisect => 1,
            Phase::Verify => 2,
            Phase::Done => 3,
        }
    }

    fn next(self) -> Phase {
        match self {
            Phase::Coarse => Phase::Bisect,
            Phase::Bisect => Phase::Verify,
            Phase::Verify | Phase::Done => Phase::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A range awaiting bisection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectRange {
    pub range: AddressRange,
    /// `false` for an upper half pushed back unprobed; it must be read
    /// whole before anything is concluded about it.
    pub known_faulty: bool,
    pub fault: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashStatus {
    Candidate,
    Confirmed,
}

/// A single faulting DWORD `[offset, offset + 4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashEntry {
    pub offset: u64,
    pub fault: FaultKind,
    pub status: CrashStatus,
    /// Isolated re-probes done so far.
    pub attempts: u32,
    /// How many of those faulted.
    pub faults: u32,
}

/// Verify result for an offset that faulted during search but not on a
/// majority of isolated re-probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientFault {
    pub offset: u64,
    pub faults: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeRange {
    pub range: AddressRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<TransientFault>,
}

/// A range whose probe left the device unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedRange {
    pub range: AddressRange,
    pub fault: FaultKind,
}

/// What one probe of a range amounted to once recovery (if any) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResult {
    Clean,
    /// Faulted, and the device was brought back.
    Faulted(FaultKind),
    /// Faulted, and the device could not be brought back.
    Abandoned(FaultKind),
}

/// Partition invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("nothing covers {from:#x}-{to:#x}")]
    Gap { from: u64, to: u64 },

    #[error("pieces overlap at {at:#x}")]
    Overlap { at: u64 },

    #[error("piece {piece} lies outside the run range {range}")]
    Outside {
        piece: AddressRange,
        range: AddressRange,
    },
}

/// The engine's persisted memory, checkpointed after every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchState {
    pub run_id: String,
    /// Monotonic checkpoint number.
    pub sequence: u64,
    pub range: AddressRange,
    pub chunk_size: u64,
    pub phase: Phase,
    /// Coarse chunks not yet probed, in scan order.
    pub pending: Vec<AddressRange>,
    pub suspect: Vec<SuspectRange>,
    pub crash: Vec<CrashEntry>,
    pub safe: Vec<SafeRange>,
    #[serde(default)]
    pub abandoned: Vec<AbandonedRange>,
    /// Unrecoverable outcomes in a row.
    #[serde(default)]
    pub recovery_failures: u32,
}

impl SearchState {
    /// Fresh state with `range` split into coarse chunks.
    pub fn new(
        run_id: impl Into<String>,
        range: AddressRange,
        chunk_size: u64,
    ) -> Result<Self, RangeError> {
        let pending = range.chunks(chunk_size)?;
        Ok(Self {
            run_id: run_id.into(),
            sequence: 0,
            range,
            chunk_size,
            phase: Phase::Coarse,
            pending,
            suspect: Vec::new(),
            crash: Vec::new(),
            safe: Vec::new(),
            abandoned: Vec::new(),
            recovery_failures: 0,
        })
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn next_chunk(&self) -> Option<AddressRange> {
        self.pending.first().copied()
    }

    pub fn next_suspect(&self) -> Option<SuspectRange> {
        self.suspect.first().copied()
    }

    pub fn next_candidate(&self) -> Option<CrashEntry> {
        self.crash
            .iter()
            .find(|c| c.status == CrashStatus::Candidate)
            .copied()
    }

    /// Whether the current phase has nothing left to do.
    pub fn phase_exhausted(&self) -> bool {
        match self.phase {
            Phase::Coarse => self.pending.is_empty(),
            Phase::Bisect => self.suspect.is_empty(),
            Phase::Verify => self.next_candidate().is_none(),
            Phase::Done => true,
        }
    }

    pub fn advance_phase(mut self) -> Self {
        self.phase = self.phase.next();
        self
    }

    /// Stamp the state for its next checkpoint.
    pub fn next_sequence(mut self) -> Self {
        self.sequence += 1;
        self
    }

    pub fn recovery_succeeded(mut self) -> Self {
        self.recovery_failures = 0;
        self
    }

    pub fn recovery_failed(mut self) -> Self {
        self.recovery_failures += 1;
        self
    }

    /// Resolve the head of `pending`.
    pub fn resolve_chunk(mut self, result: RangeResult) -> Self {
        if self.pending.is_empty() {
            return self;
        }
        let chunk = self.pending.remove(0);
        match result {
            RangeResult::Clean => self.push_safe(chunk, None),
            RangeResult::Faulted(fault) => self.insert_suspect(SuspectRange {
                range: chunk,
                known_faulty: true,
                fault,
            }),
            RangeResult::Abandoned(fault) => self.abandon(chunk, fault),
        }
        self
    }

    /// Resolve an unknown-status suspect that was probed whole.
    pub fn resolve_unknown_suspect(mut self, result: RangeResult) -> Self {
        let Some(head) = self.take_suspect() else {
            return self;
        };
        match result {
            RangeResult::Clean => self.push_safe(head.range, None),
            RangeResult::Faulted(fault) => self.insert_suspect(SuspectRange {
                range: head.range,
                known_faulty: true,
                fault,
            }),
            RangeResult::Abandoned(fault) => self.abandon(head.range, fault),
        }
        self
    }

    /// Turn a known-faulty single-word suspect into a verify candidate.
    pub fn promote_word(mut self) -> Self {
        let Some(head) = self.take_suspect() else {
            return self;
        };
        self.crash.push(CrashEntry {
            offset: head.range.start,
            fault: head.fault,
            status: CrashStatus::Candidate,
            attempts: 0,
            faults: 0,
        });
        self.crash.sort_by_key(|c| c.offset);
        self
    }

    /// Record the probe of the lower half of the head suspect.
    ///
    /// Lower faulted: lower stays suspect, upper goes back unprobed.
    /// Lower clean: lower is safe and the fault must be in the upper half.
    pub fn resolve_split(mut self, lower_result: RangeResult) -> Self {
        let Some(head) = self.take_suspect() else {
            return self;
        };
        let Some((lower, upper)) = head.range.split() else {
            self.insert_suspect(head);
            return self;
        };
        match lower_result {
            RangeResult::Faulted(fault) => {
                self.insert_suspect(SuspectRange {
                    range: lower,
                    known_faulty: true,
                    fault,
                });
                self.insert_suspect(SuspectRange {
                    range: upper,
                    known_faulty: false,
                    fault,
                });
            }
            RangeResult::Clean => {
                self.push_safe(lower, None);
                self.insert_suspect(SuspectRange {
                    range: upper,
                    known_faulty: true,
                    fault: head.fault,
                });
            }
            RangeResult::Abandoned(fault) => {
                self.abandon(lower, fault);
                self.insert_suspect(SuspectRange {
                    range: upper,
                    known_faulty: false,
                    fault,
                });
            }
        }
        self
    }

    /// Record one isolated re-probe of `offset`, adjudicating it once
    /// `required` attempts have been made.
    pub fn record_verify_attempt(mut self, offset: u64, faulted: bool, required: u32) -> Self {
        let Some(index) = self.crash.iter().position(|c| c.offset == offset) else {
            return self;
        };
        let entry = &mut self.crash[index];
        entry.attempts += 1;
        if faulted {
            entry.faults += 1;
        }
        if entry.attempts >= required {
            let entry = *entry;
            self = self.adjudicate(index, entry);
        }
        self
    }

    /// Promote every remaining candidate without re-probing.
    pub fn confirm_unverified(mut self) -> Self {
        for entry in &mut self.crash {
            entry.status = CrashStatus::Confirmed;
        }
        self
    }

    /// Give up on a candidate whose re-probe left the device unrecoverable.
    pub fn abandon_candidate(mut self, offset: u64, fault: FaultKind) -> Self {
        if let Some(index) = self.crash.iter().position(|c| c.offset == offset) {
            self.crash.remove(index);
            self.abandon(AddressRange::word(offset), fault);
        }
        self
    }

    /// Every piece of the partition, unordered.
    pub fn pieces(&self) -> Vec<AddressRange> {
        self.pending
            .iter()
            .copied()
            .chain(self.suspect.iter().map(|s| s.range))
            .chain(self.crash.iter().map(|c| AddressRange::word(c.offset)))
            .chain(self.safe.iter().map(|s| s.range))
            .chain(self.abandoned.iter().map(|a| a.range))
            .collect()
    }

    /// Pending, suspect, crash, safe and abandoned must tile `range`
    /// exactly.
    pub fn check_partition(&self) -> Result<(), PartitionError> {
        let mut pieces = self.pieces();
        pieces.sort();

        let mut cursor = self.range.start;
        for piece in pieces {
            if piece.is_empty() || !self.range.contains_range(&piece) {
                return Err(PartitionError::Outside {
                    piece,
                    range: self.range,
                });
            }
            if piece.start > cursor {
                return Err(PartitionError::Gap {
                    from: cursor,
                    to: piece.start,
                });
            }
            if piece.start < cursor {
                return Err(PartitionError::Overlap { at: piece.start });
            }
            cursor = piece.end;
        }
        if cursor < self.range.end {
            return Err(PartitionError::Gap {
                from: cursor,
                to: self.range.end,
            });
        }
        Ok(())
    }

    fn adjudicate(mut self, index: usize, entry: CrashEntry) -> Self {
        if entry.faults * 2 > entry.attempts {
            self.crash[index].status = CrashStatus::Confirmed;
            tracing::warn!(
                offset = %Hex(entry.offset),
                faults = entry.faults,
                attempts = entry.attempts,
                "Crash offset confirmed"
            );
        } else {
            self.crash.remove(index);
            tracing::info!(
                offset = %Hex(entry.offset),
                faults = entry.faults,
                attempts = entry.attempts,
                "Offset faulted only transiently; marked safe"
            );
            self.push_safe(
                AddressRange::word(entry.offset),
                Some(TransientFault {
                    offset: entry.offset,
                    faults: entry.faults,
                    attempts: entry.attempts,
                }),
            );
        }
        self
    }

    fn take_suspect(&mut self) -> Option<SuspectRange> {
        if self.suspect.is_empty() {
            None
        } else {
            Some(self.suspect.remove(0))
        }
    }

    fn insert_suspect(&mut self, suspect: SuspectRange) {
        let at = self
            .suspect
            .partition_point(|s| s.range.start < suspect.range.start);
        self.suspect.insert(at, suspect);
    }

    fn push_safe(&mut self, range: AddressRange, transient: Option<TransientFault>) {
        self.safe.push(SafeRange { range, transient });
    }

    fn abandon(&mut self, range: AddressRange, fault: FaultKind) {
        tracing::error!(range = %range, fault = %fault, "Range abandoned");
        self.abandoned.push(AbandonedRange { range, fault });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(start, end).unwrap()
    }

    fn fresh() -> SearchState {
        SearchState::new("run", range(0x0, 0x100), 0x40).unwrap()
    }

    #[test]
    fn test_new_state_is_partitioned() {
        let state = fresh();
        assert_eq!(state.pending.len(), 4);
        assert_eq!(state.phase, Phase::Coarse);
        assert!(state.check_partition().is_ok());
    }

    #[test]
    fn test_chunk_resolution() {
        let state = fresh()
            .resolve_chunk(RangeResult::Clean)
            .resolve_chunk(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .resolve_chunk(RangeResult::Abandoned(FaultKind::CompletionTimeout));

        assert_eq!(state.safe[0].range, range(0x0, 0x40));
        assert_eq!(state.suspect[0].range, range(0x40, 0x80));
        assert!(state.suspect[0].known_faulty);
        assert_eq!(state.abandoned[0].range, range(0x80, 0xc0));
        assert_eq!(state.pending, vec![range(0xc0, 0x100)]);
        assert!(state.check_partition().is_ok());
    }

    #[test]
    fn test_split_lower_faulted_pushes_upper_back_unknown() {
        let state = fresh()
            .resolve_chunk(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .resolve_split(RangeResult::Faulted(FaultKind::CompletionTimeout));

        assert_eq!(state.suspect.len(), 2);
        assert_eq!(state.suspect[0].range, range(0x0, 0x20));
        assert!(state.suspect[0].known_faulty);
        assert_eq!(state.suspect[1].range, range(0x20, 0x40));
        assert!(!state.suspect[1].known_faulty);
        assert!(state.check_partition().is_ok());
    }

    #[test]
    fn test_split_lower_clean_confines_fault_to_upper() {
        let state = fresh()
            .resolve_chunk(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .resolve_split(RangeResult::Clean);

        assert_eq!(state.safe[0].range, range(0x0, 0x20));
        assert_eq!(state.suspect.len(), 1);
        assert_eq!(state.suspect[0].range, range(0x20, 0x40));
        assert!(state.suspect[0].known_faulty);
    }

    #[test]
    fn test_suspects_stay_sorted() {
        let mut state = fresh();
        state.pending.clear();
        state.suspect = vec![SuspectRange {
            range: range(0x80, 0x100),
            known_faulty: true,
            fault: FaultKind::CompletionTimeout,
        }];
        state.insert_suspect(SuspectRange {
            range: range(0x0, 0x80),
            known_faulty: false,
            fault: FaultKind::CompletionTimeout,
        });
        assert_eq!(state.next_suspect().unwrap().range, range(0x0, 0x80));
    }

    fn with_candidate() -> SearchState {
        let mut state = SearchState::new("run", range(0x0, 0x8), 0x8).unwrap();
        state = state
            .resolve_chunk(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .resolve_split(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .promote_word();
        state
    }

    #[test]
    fn test_majority_confirms() {
        let state = with_candidate()
            .record_verify_attempt(0x0, true, 3)
            .record_verify_attempt(0x0, false, 3);
        assert_eq!(state.crash[0].status, CrashStatus::Candidate);

        let state = state.record_verify_attempt(0x0, true, 3);
        assert_eq!(state.crash[0].status, CrashStatus::Confirmed);
        assert_eq!((state.crash[0].faults, state.crash[0].attempts), (2, 3));
    }

    #[test]
    fn test_minority_downgrades_with_annotation() {
        let state = with_candidate()
            .record_verify_attempt(0x0, true, 3)
            .record_verify_attempt(0x0, false, 3)
            .record_verify_attempt(0x0, false, 3);

        assert!(state.crash.is_empty());
        let downgraded = state.safe.iter().find(|s| s.range == AddressRange::word(0x0)).unwrap();
        assert_eq!(
            downgraded.transient,
            Some(TransientFault {
                offset: 0x0,
                faults: 1,
                attempts: 3
            })
        );
        assert!(state.check_partition().is_ok());
    }

    #[test]
    fn test_partition_errors() {
        let mut state = fresh();
        state.pending.remove(1);
        assert_eq!(
            state.check_partition(),
            Err(PartitionError::Gap {
                from: 0x40,
                to: 0x80
            })
        );

        let mut state = fresh();
        state.safe.push(SafeRange {
            range: range(0x0, 0x8),
            transient: None,
        });
        assert_eq!(state.check_partition(), Err(PartitionError::Overlap { at: 0x0 }));

        let mut state = fresh();
        state.pending.push(range(0x100, 0x140));
        assert!(matches!(
            state.check_partition(),
            Err(PartitionError::Outside { .. })
        ));
    }

    #[test]
    fn test_state_survives_json() {
        let state = with_candidate();
        let json = serde_json::to_string(&state).unwrap();
        let back: SearchState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
