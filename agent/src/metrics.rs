//! Prometheus metrics for the trace engine

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, Counter, Encoder, Gauge, TextEncoder};

// ── Activity metrics ─────────────────────────────────────────────────────────

pub static ACTIVITIES_LOGGED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("tandem_activities_logged_total", "Activities handed to a trace sink").unwrap()
});

pub static ACTIVITIES_DROPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tandem_activities_dropped_total",
        "Activities dropped by net filtering or timestamp checks"
    )
    .unwrap()
});

pub static UNATTRIBUTED_RECORDS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tandem_unattributed_device_records_total",
        "Device records with no host counterpart"
    )
    .unwrap()
});

pub static PENDING_RECORDS_DROPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tandem_pending_device_records_dropped_total",
        "Device records dropped because the pending queue was full"
    )
    .unwrap()
});

// ── Trace metrics ────────────────────────────────────────────────────────────

pub static TRACES_COMPLETED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("tandem_traces_completed_total", "Traces finalized").unwrap()
});

pub static FLUSH_OVERHEAD_US: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("tandem_flush_overhead_us", "Running mean of backend flush cost").unwrap()
});

pub static SETUP_OVERHEAD_US: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("tandem_setup_overhead_us", "Running mean of backend setup cost").unwrap()
});

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
