//! Lightweight metrics helpers for relaygate.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is installed
//! here; the embedding gateway picks its own recorder.
//!
//! Provided metrics (labels vary by family):
//! * `relaygate_dispatch_total` (counter: route, outcome)
//! * `relaygate_dispatch_duration_seconds` (histogram: route)
//! * `relaygate_circuit_state_changes_total` (counter: route, state)
//! * `relaygate_client_cache_entries` (gauge)
//! * `relaygate_client_cache_lookups_total` (counter: result)
//!
//! [`DispatchTimer`] records its duration on drop, so early returns and
//! cancelled dispatches are measured too.
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const RELAYGATE_DISPATCH_TOTAL: &str = "relaygate_dispatch_total";
pub const RELAYGATE_DISPATCH_DURATION_SECONDS: &str = "relaygate_dispatch_duration_seconds";
pub const RELAYGATE_CIRCUIT_STATE_CHANGES_TOTAL: &str = "relaygate_circuit_state_changes_total";
pub const RELAYGATE_CLIENT_CACHE_ENTRIES: &str = "relaygate_client_cache_entries";
pub const RELAYGATE_CLIENT_CACHE_LOOKUPS_TOTAL: &str = "relaygate_client_cache_lookups_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        RELAYGATE_DISPATCH_TOTAL,
        Unit::Count,
        "Total number of downstream dispatches, by route and outcome."
    );
    describe_histogram!(
        RELAYGATE_DISPATCH_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of downstream dispatches, from resolution to response headers."
    );
    describe_counter!(
        RELAYGATE_CIRCUIT_STATE_CHANGES_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions, by route and new state."
    );
    describe_gauge!(
        RELAYGATE_CLIENT_CACHE_ENTRIES,
        "Number of downstream clients currently held by the client cache."
    );
    describe_counter!(
        RELAYGATE_CLIENT_CACHE_LOOKUPS_TOTAL,
        Unit::Count,
        "Client cache lookups, by result (hit/miss)."
    );
});

/// Count one finished dispatch. `outcome` is `ok` or the error kind.
pub fn increment_dispatch_total(route: &str, outcome: &str) {
    counter!(
        RELAYGATE_DISPATCH_TOTAL,
        "route" => route.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_dispatch_duration(route: &str, duration: std::time::Duration) {
    histogram!(RELAYGATE_DISPATCH_DURATION_SECONDS, "route" => route.to_string())
        .record(duration.as_secs_f64());
}

/// Record a breaker transition.
pub fn record_circuit_state_change(route: &str, state: &'static str) {
    counter!(
        RELAYGATE_CIRCUIT_STATE_CHANGES_TOTAL,
        "route" => route.to_string(),
        "state" => state
    )
    .increment(1);
}

pub fn set_client_cache_entries(count: usize) {
    gauge!(RELAYGATE_CLIENT_CACHE_ENTRIES).set(count as f64);
}

pub fn increment_client_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(RELAYGATE_CLIENT_CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

/// RAII helper measuring a dispatch.
pub struct DispatchTimer {
    start: Instant,
    route: String,
}

impl DispatchTimer {
    pub fn new(route: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
        }
    }
}

impl Drop for DispatchTimer {
    fn drop(&mut self) {
        record_dispatch_duration(&self.route, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing relaygate metrics");
    Lazy::force(&DESCRIBED);
    Ok(())
}
