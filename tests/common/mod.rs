//! Shared utilities for integration tests.

#![allow(dead_code)]

use mmio_bisect::config::schema::{ProbeConfig, RecoveryConfig};
use mmio_bisect::config::BisectConfig;
use mmio_bisect::device::{SimControl, SimLog, SimTransport, SimulatedBus};
use mmio_bisect::health::{FaultClassifier, HealthMonitor};
use mmio_bisect::search::report::merge_ranges;
use mmio_bisect::search::{AddressRange, BisectionEngine, SearchState};
use mmio_bisect::store::{CheckpointStore, MemoryStore};

pub type SimEngine<S> = BisectionEngine<SimTransport, SimLog, SimControl, S>;

/// Config with short timeouts and a health check after every read.
pub fn fast_config(chunk_size: u64) -> BisectConfig {
    let mut config = BisectConfig::default();
    config.search.chunk_size = chunk_size;
    config.probe = ProbeConfig {
        health_stride: 1,
        settle_ms: 0,
        settle_poll_ms: 0,
    };
    config.recovery = RecoveryConfig {
        poll_interval_ms: 100,
        auto_recovery_timeout_secs: 1,
        rebind_timeout_secs: 1,
        settle_ms: 0,
        max_consecutive_failures: 3,
    };
    config
}

pub fn engine<S: CheckpointStore>(bus: &SimulatedBus, store: S, config: &BisectConfig) -> SimEngine<S> {
    let (transport, log, control) = bus.parts();
    let classifier = FaultClassifier::new(&config.classifier).with_tag(SimulatedBus::driver_tag());
    BisectionEngine::new(
        transport,
        HealthMonitor::new(log, control, classifier),
        store,
        config,
    )
}

pub fn range(start: u64, end: u64) -> AddressRange {
    AddressRange::new(start, end).unwrap()
}

pub fn fresh_state(run_id: &str, start: u64, end: u64, chunk_size: u64) -> SearchState {
    SearchState::new(run_id, range(start, end), chunk_size).unwrap()
}

/// Safe pieces of `state`, merged.
pub fn safe_ranges(state: &SearchState) -> Vec<AddressRange> {
    merge_ranges(state.safe.iter().map(|s| s.range).collect())
}

/// Every checkpoint tiles the run range and sequences count up by one.
pub fn assert_history_consistent(store: &MemoryStore) {
    let history = store.history();
    assert!(!history.is_empty(), "no checkpoints recorded");
    for state in &history {
        if let Err(e) = state.check_partition() {
            panic!("checkpoint {} broke the partition: {}", state.sequence, e);
        }
    }
    for pair in history.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
}

/// First checkpoint of `phase`.
pub fn first_in_phase(
    store: &MemoryStore,
    phase: mmio_bisect::search::Phase,
) -> Option<SearchState> {
    store.history().into_iter().find(|s| s.phase == phase)
}
