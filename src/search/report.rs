//! Operator-facing run report.

use std::fmt;

use serde::Serialize;

use crate::config::schema::RegionConfig;
use crate::health::FaultKind;
use crate::search::range::{AddressRange, Hex};
use crate::search::state::{AbandonedRange, CrashStatus, Phase, SearchState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashReport {
    pub offset: u64,
    pub fault: FaultKind,
    pub status: CrashStatus,
    pub faults: u32,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransientReport {
    pub offset: u64,
    pub faults: u32,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Summary of a run, finished or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub range: AddressRange,
    pub phase: Phase,
    pub sequence: u64,
    pub crashes: Vec<CrashReport>,
    /// Safe ranges, adjacent pieces merged.
    pub safe: Vec<AddressRange>,
    pub transient: Vec<TransientReport>,
    pub abandoned: Vec<AbandonedRange>,
    pub pending: Vec<AddressRange>,
    pub suspect: Vec<AddressRange>,
}

fn region_of(regions: &[RegionConfig], offset: u64) -> Option<String> {
    regions
        .iter()
        .find(|r| offset >= r.start && offset < r.end)
        .map(|r| r.name.clone())
}

/// Sort and coalesce touching ranges.
pub fn merge_ranges(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort();
    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end >= range.start => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

impl RunReport {
    pub fn from_state(state: &SearchState, regions: &[RegionConfig]) -> Self {
        let crashes = state
            .crash
            .iter()
            .map(|c| CrashReport {
                offset: c.offset,
                fault: c.fault,
                status: c.status,
                faults: c.faults,
                attempts: c.attempts,
                region: region_of(regions, c.offset),
            })
            .collect();

        let mut transient: Vec<TransientReport> = state
            .safe
            .iter()
            .filter_map(|s| s.transient)
            .map(|t| TransientReport {
                offset: t.offset,
                faults: t.faults,
                attempts: t.attempts,
                region: region_of(regions, t.offset),
            })
            .collect();
        transient.sort_by_key(|t| t.offset);

        let mut abandoned = state.abandoned.clone();
        abandoned.sort_by_key(|a| a.range);

        Self {
            run_id: state.run_id.clone(),
            range: state.range,
            phase: state.phase,
            sequence: state.sequence,
            crashes,
            safe: merge_ranges(state.safe.iter().map(|s| s.range).collect()),
            transient,
            abandoned,
            pending: state.pending.clone(),
            suspect: state.suspect.iter().map(|s| s.range).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Offsets confirmed to fault.
    pub fn confirmed_offsets(&self) -> Vec<u64> {
        self.crashes
            .iter()
            .filter(|c| c.status == CrashStatus::Confirmed)
            .map(|c| c.offset)
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} over {} (phase {}, checkpoint {})",
            self.run_id, self.range, self.phase, self.sequence
        )?;

        writeln!(f, "\ncrash offsets ({}):", self.crashes.len())?;
        for crash in &self.crashes {
            let status = match crash.status {
                CrashStatus::Confirmed => "confirmed",
                CrashStatus::Candidate => "candidate",
            };
            write!(
                f,
                "  {}  {:<20} {:<10} {}/{} faults",
                Hex(crash.offset),
                crash.fault.as_str(),
                status,
                crash.faults,
                crash.attempts
            )?;
            if let Some(region) = &crash.region {
                write!(f, "  [{}]", region)?;
            }
            writeln!(f)?;
        }

        if !self.transient.is_empty() {
            writeln!(f, "\ntransient faults, treated as safe ({}):", self.transient.len())?;
            for t in &self.transient {
                write!(f, "  {}  {}/{} faults", Hex(t.offset), t.faults, t.attempts)?;
                if let Some(region) = &t.region {
                    write!(f, "  [{}]", region)?;
                }
                writeln!(f)?;
            }
        }

        writeln!(f, "\nsafe ranges ({}):", self.safe.len())?;
        for range in &self.safe {
            writeln!(f, "  {}", range)?;
        }

        if !self.abandoned.is_empty() {
            writeln!(f, "\nabandoned ranges ({}):", self.abandoned.len())?;
            for a in &self.abandoned {
                writeln!(f, "  {}  {}", a.range, a.fault)?;
            }
        }

        if !self.is_complete() {
            writeln!(
                f,
                "\nunfinished: {} pending chunk(s), {} suspect range(s)",
                self.pending.len(),
                self.suspect.len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::state::RangeResult;

    fn range(start: u64, end: u64) -> AddressRange {
        AddressRange::new(start, end).unwrap()
    }

    #[test]
    fn test_merge_ranges() {
        let merged = merge_ranges(vec![
            range(0x40, 0x80),
            range(0x0, 0x40),
            range(0x84, 0x100),
        ]);
        assert_eq!(merged, vec![range(0x0, 0x80), range(0x84, 0x100)]);
    }

    #[test]
    fn test_report_labels_regions() {
        let state = SearchState::new("run", range(0x0, 0x8), 0x8)
            .unwrap()
            .resolve_chunk(RangeResult::Faulted(FaultKind::CompletionTimeout))
            .resolve_split(RangeResult::Clean)
            .promote_word()
            .confirm_unverified()
            .advance_phase()
            .advance_phase()
            .advance_phase();
        let regions = vec![RegionConfig {
            name: "pcie_phy".to_string(),
            start: 0x0,
            end: 0x10,
            description: String::new(),
        }];

        let report = RunReport::from_state(&state, &regions);
        assert!(report.is_complete());
        assert_eq!(report.confirmed_offsets(), vec![0x4]);
        assert_eq!(report.crashes[0].region.as_deref(), Some("pcie_phy"));
        assert_eq!(report.safe, vec![range(0x0, 0x4)]);

        let text = report.to_string();
        assert!(text.contains("0x000004"));
        assert!(text.contains("[pcie_phy]"));
        assert!(!text.contains("unfinished"));
    }
}
