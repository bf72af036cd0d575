//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define search metrics (probes, faults, recoveries, open ranges)
//! - Expose Prometheus-compatible metrics endpoint (optional)
//!
//! # Metrics
//! - `bisect_probes_total` (counter): probes by result (clean, faulted)
//! - `bisect_probe_duration_seconds` (histogram): sweep wall time
//! - `bisect_faults_total` (counter): classified faults by kind
//! - `bisect_recoveries_total` (counter): recovery attempts by outcome
//! - `bisect_recovery_duration_seconds` (histogram): time to recover
//! - `bisect_phase` (gauge): 0=coarse, 1=bisect, 2=verify, 3=done
//! - `bisect_open_ranges` (gauge): ranges per set (pending, suspect, candidate)
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels are static strings; offsets never become labels

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_probe(result: &'static str, elapsed: Duration) {
    metrics::counter!("bisect_probes_total", "result" => result).increment(1);
    metrics::histogram!("bisect_probe_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_fault(kind: &'static str) {
    metrics::counter!("bisect_faults_total", "kind" => kind).increment(1);
}

pub fn record_recovery(outcome: &'static str, elapsed: Duration) {
    metrics::counter!("bisect_recoveries_total", "outcome" => outcome).increment(1);
    metrics::histogram!("bisect_recovery_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_phase(phase: u8) {
    metrics::gauge!("bisect_phase").set(phase as f64);
}

pub fn record_open_ranges(pending: usize, suspect: usize, candidates: usize) {
    metrics::gauge!("bisect_open_ranges", "set" => "pending").set(pending as f64);
    metrics::gauge!("bisect_open_ranges", "set" => "suspect").set(suspect as f64);
    metrics::gauge!("bisect_open_ranges", "set" => "candidate").set(candidates as f64);
}
