//! Metrics helpers for apiman.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the
//! embedding application installs whichever recorder it wants.
//!
//! Provided metrics:
//! * `apiman_gateway_requests_total` (counter; `method`, `status`)
//! * `apiman_gateway_request_duration_seconds` (histogram; `method`)
//! * `apiman_function_invocations_total` (counter; `function`, `outcome`)
//! * `apiman_routing_table_apis` (gauge)
//! * `apiman_reconcile_total` (counter; `operation`, `outcome`)
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const APIMAN_GATEWAY_REQUESTS_TOTAL: &str = "apiman_gateway_requests_total";
pub const APIMAN_GATEWAY_REQUEST_DURATION_SECONDS: &str =
    "apiman_gateway_request_duration_seconds";
pub const APIMAN_FUNCTION_INVOCATIONS_TOTAL: &str = "apiman_function_invocations_total";
pub const APIMAN_ROUTING_TABLE_APIS: &str = "apiman_routing_table_apis";
pub const APIMAN_RECONCILE_TOTAL: &str = "apiman_reconcile_total";

/// Registers metric descriptions with the installed recorder on first use.
static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        APIMAN_GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests handled by the local gateway."
    );
    describe_histogram!(
        APIMAN_GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests handled by the local gateway."
    );
    describe_counter!(
        APIMAN_FUNCTION_INVOCATIONS_TOTAL,
        Unit::Count,
        "Function invocations made by the dispatcher, by outcome."
    );
    describe_gauge!(
        APIMAN_ROUTING_TABLE_APIS,
        "Number of API records held by the local routing table."
    );
    describe_counter!(
        APIMAN_RECONCILE_TOTAL,
        Unit::Count,
        "Reconciliation steps run by the controller, by operation and outcome."
    );
});

pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        APIMAN_GATEWAY_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: std::time::Duration) {
    histogram!(
        APIMAN_GATEWAY_REQUEST_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count a function invocation; `outcome` is `ok` or `error`.
pub fn record_function_invocation(function: &str, outcome: &'static str) {
    counter!(
        APIMAN_FUNCTION_INVOCATIONS_TOTAL,
        "function" => function.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_routing_table_apis(count: usize) {
    gauge!(APIMAN_ROUTING_TABLE_APIS).set(count as f64);
}

/// Count a controller step (`add`, `update`, `delete`, `error`).
pub fn record_reconcile(operation: &'static str, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!(
        APIMAN_RECONCILE_TOTAL,
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

/// RAII helper measuring gateway request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIBED);
    tracing::debug!("metric descriptions registered");
    Ok(())
}
