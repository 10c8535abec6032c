//! Prometheus metric families shared across the process.
//!
//! Registered once in the default registry at first use and never reset;
//! the last-observed caches back the delta computation of the usage-metrics
//! reporter. Tests exercising deltas must use disjoint label sets since the
//! registry is process-wide.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec, TextEncoder};

/// Gauge name for currently-active decisions, as gathered by the reporter.
pub const ACTIVE_DECISIONS_NAME: &str = "active_decisions";
/// Gauge name for requests blocked at the edge.
pub const BLOCKED_REQUESTS_NAME: &str = "blocked_requests";
/// Gauge name for requests seen at the edge.
pub const PROCESSED_REQUESTS_NAME: &str = "processed_requests";

/// API calls made to Cloudflare, labelled by account, success or not.
pub static CLOUDFLARE_API_CALLS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cloudflare_api_calls_total",
        "Number of API calls made to Cloudflare by each account",
        &["account"]
    )
    .expect("register cloudflare_api_calls_total")
});

/// Total KV keys the account's namespace currently carries.
pub static TOTAL_KEYS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "cloudflare_keys_total",
        "Total Workers KV keys by account",
        &["account"]
    )
    .expect("register cloudflare_keys_total")
});

/// Active decisions currently projected into the account's namespace.
pub static ACTIVE_DECISIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        ACTIVE_DECISIONS_NAME,
        "Total number of active decisions",
        &["origin", "ip_type", "scope", "account", "remediation"]
    )
    .expect("register active_decisions")
});

/// Requests blocked at the edge, refreshed from the metrics database.
pub static BLOCKED_REQUESTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        BLOCKED_REQUESTS_NAME,
        "Total number of blocked requests",
        &["origin", "ip_type", "remediation", "account"]
    )
    .expect("register blocked_requests")
});

/// Requests processed at the edge, refreshed from the metrics database.
pub static PROCESSED_REQUESTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        PROCESSED_REQUESTS_NAME,
        "Total number of processed requests",
        &["ip_type", "account"]
    )
    .expect("register processed_requests")
});

static LAST_BLOCKED: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(Mutex::default);
static LAST_PROCESSED: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(Mutex::default);

/// Difference between `value` and the last observation under `key`, which is
/// then replaced. The edge counters only grow, so this is the per-window
/// increment the upstream expects.
pub fn blocked_delta(key: &str, value: f64) -> f64 {
    delta(&LAST_BLOCKED, key, value)
}

/// See [`blocked_delta`].
pub fn processed_delta(key: &str, value: f64) -> f64 {
    delta(&LAST_PROCESSED, key, value)
}

fn delta(cache: &Mutex<HashMap<String, f64>>, key: &str, value: f64) -> f64 {
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = cache.insert(key.to_string(), value).unwrap_or(0.0);
    value - previous
}

/// Encode every registered family in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_track_last_observation() {
        assert_eq!(blocked_delta("test-delta-key", 5.0), 5.0);
        assert_eq!(blocked_delta("test-delta-key", 12.0), 7.0);
        assert_eq!(blocked_delta("test-delta-key", 12.0), 0.0);
        assert_eq!(processed_delta("test-delta-key", 3.0), 3.0);
    }

    #[test]
    fn families_render_in_text_format() {
        CLOUDFLARE_API_CALLS.with_label_values(&["render-test"]).inc();
        let body = render().unwrap();
        assert!(body.contains("cloudflare_api_calls_total"));
    }
}
