//! Instrumentation for Livewire.
//!
//! Uses the `metrics` facade; installing an exporter is up to the host
//! application.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    pub const RPC_CALLS_TOTAL: &str = "livewire_rpc_calls_total";
    pub const RPC_TIMEOUTS_TOTAL: &str = "livewire_rpc_timeouts_total";
    pub const RPC_REJECTED_TOTAL: &str = "livewire_rpc_rejected_total";
    pub const RPC_LATENCY_SECONDS: &str = "livewire_rpc_latency_seconds";
    pub const PUBLISH_TOTAL: &str = "livewire_publish_total";
    pub const PUBLISH_ERRORS_TOTAL: &str = "livewire_publish_errors_total";
}

/// Register descriptions for every Livewire metric.
pub fn describe_metrics() {
    metrics::describe_counter!(names::RPC_CALLS_TOTAL, "Total number of RPC calls sent");
    metrics::describe_counter!(
        names::RPC_TIMEOUTS_TOTAL,
        "Total number of RPC calls that timed out"
    );
    metrics::describe_counter!(
        names::RPC_REJECTED_TOTAL,
        "Total number of RPC calls rejected before sending"
    );
    metrics::describe_histogram!(
        names::RPC_LATENCY_SECONDS,
        "Time from RPC send to acknowledgment in seconds"
    );
    metrics::describe_counter!(names::PUBLISH_TOTAL, "Total number of server-side publishes");
    metrics::describe_counter!(
        names::PUBLISH_ERRORS_TOTAL,
        "Total number of failed server-side publishes"
    );
}

/// Record an RPC call that was sent.
pub fn record_rpc_call(action: &str) {
    counter!(names::RPC_CALLS_TOTAL, "action" => action.to_string()).increment(1);
}

/// Record an RPC call rejected before any network attempt.
pub fn record_rpc_rejected(reason: &'static str) {
    counter!(names::RPC_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record an RPC timeout.
pub fn record_rpc_timeout(action: &str) {
    counter!(names::RPC_TIMEOUTS_TOTAL, "action" => action.to_string()).increment(1);
}

/// Record the latency of an acknowledged call.
pub fn record_rpc_latency(elapsed: Duration) {
    histogram!(names::RPC_LATENCY_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a server-side publish attempt and its outcome.
pub fn record_publish(event: &str, error: Option<&'static str>) {
    counter!(names::PUBLISH_TOTAL, "event" => event.to_string()).increment(1);
    if let Some(kind) = error {
        counter!(names::PUBLISH_ERRORS_TOTAL, "type" => kind).increment(1);
    }
}
