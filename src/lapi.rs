//! CrowdSec LAPI client.
//!
//! Fetches the incremental decision stream and pushes aggregated usage
//! metrics back upstream. The client performs no retries of its own; a
//! failed fetch is surfaced and the next tick tries again.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::config::CrowdSecConfig;
use crate::decision::{DecisionBatch, Scope};
use crate::metrics;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one stream fetch.
#[derive(Debug)]
pub enum StreamResponse {
    /// A regular batch of new and deleted decisions.
    Decisions(DecisionBatch),
    /// `204 No Content`: no decisions exist anywhere upstream. The caller
    /// must purge every decision key it manages.
    Empty,
}

/// Client for one LAPI endpoint, optionally with mutual TLS.
pub struct LapiClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    user_agent: String,
    origins: String,
    scenarios_containing: String,
    scenarios_not_containing: String,
}

impl LapiClient {
    pub fn new(config: &CrowdSecConfig, user_agent: String) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if !config.cert_path.is_empty() && !config.key_path.is_empty() {
            let mut pem = std::fs::read(&config.cert_path)
                .with_context(|| format!("reading client certificate {}", config.cert_path))?;
            pem.extend(
                std::fs::read(&config.key_path)
                    .with_context(|| format!("reading client key {}", config.key_path))?,
            );
            builder = builder.identity(
                reqwest::Identity::from_pem(&pem).context("building client identity")?,
            );
        }
        if !config.ca_cert_path.is_empty() {
            let ca = std::fs::read(&config.ca_cert_path)
                .with_context(|| format!("reading CA certificate {}", config.ca_cert_path))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&ca).context("parsing CA certificate")?,
            );
        }

        Ok(Self {
            http: builder.build().context("building LAPI HTTP client")?,
            base: config.lapi_url.trim_end_matches('/').to_string(),
            api_key: config.lapi_key.clone(),
            user_agent,
            origins: config.only_include_decisions_from.join(","),
            scenarios_containing: config.include_scenarios_containing.join(","),
            scenarios_not_containing: config.exclude_scenarios_containing.join(","),
        })
    }

    /// Fetch one stream iteration. `startup` requests the full snapshot and
    /// is only set on the first fetch of the process lifetime.
    pub async fn fetch_decisions(&self, startup: bool) -> anyhow::Result<StreamResponse> {
        let query = stream_query(
            startup,
            &self.origins,
            &self.scenarios_containing,
            &self.scenarios_not_containing,
        );
        let response = self
            .http
            .get(format!("{}/v1/decisions/stream", self.base))
            .header("X-Api-Key", &self.api_key)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&query)
            .send()
            .await
            .context("fetching decision stream")?;

        match response.status() {
            StatusCode::OK => {
                let batch: DecisionBatch = response
                    .json()
                    .await
                    .context("decoding decision stream payload")?;
                Ok(StreamResponse::Decisions(batch))
            }
            StatusCode::NO_CONTENT => {
                debug!("decision stream returned no content");
                Ok(StreamResponse::Empty)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("decision stream returned {status}: {body}")
            }
        }
    }

    /// Push the current usage-metrics document upstream.
    pub async fn push_usage_metrics(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/usage-metrics", self.base))
            .header("X-Api-Key", &self.api_key)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(payload)
            .send()
            .await
            .context("pushing usage metrics")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("usage metrics push returned {status}: {body}");
        }
        Ok(())
    }
}

/// Query parameters of one stream fetch. Empty filters are omitted.
fn stream_query(
    startup: bool,
    origins: &str,
    scenarios_containing: &str,
    scenarios_not_containing: &str,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("startup", startup.to_string()),
        ("scopes", Scope::ALL.to_string()),
    ];
    if !origins.is_empty() {
        query.push(("origins", origins.to_string()));
    }
    if !scenarios_containing.is_empty() {
        query.push(("scenarios_containing", scenarios_containing.to_string()));
    }
    if !scenarios_not_containing.is_empty() {
        query.push((
            "scenarios_not_containing",
            scenarios_not_containing.to_string(),
        ));
    }
    query
}

/// Assemble the usage-metrics document from the gathered Prometheus state.
///
/// Active decisions are reported as absolute values; blocked and processed
/// requests as deltas against the previous report, tracked in the
/// process-wide last-value caches.
pub fn build_usage_payload(
    component_version: &str,
    startup_timestamp: u64,
    window: Duration,
) -> serde_json::Value {
    let mut items = Vec::new();
    for family in prometheus::gather() {
        match family.get_name() {
            metrics::ACTIVE_DECISIONS_NAME => {
                for metric in family.get_metric() {
                    let origin = label_value(metric, "origin");
                    let ip_type = label_value(metric, "ip_type");
                    let account = label_value(metric, "account");
                    let remediation = label_value(metric, "remediation");
                    items.push(json!({
                        "name": "active_decisions",
                        "value": metric.get_gauge().get_value(),
                        "unit": "ip",
                        "labels": {
                            "origin": origin,
                            "ip_type": ip_type,
                            "account": account,
                            "remediation": remediation,
                        },
                    }));
                }
            }
            metrics::BLOCKED_REQUESTS_NAME => {
                for metric in family.get_metric() {
                    let origin = label_value(metric, "origin");
                    let ip_type = label_value(metric, "ip_type");
                    let account = label_value(metric, "account");
                    let remediation = label_value(metric, "remediation");
                    let value = metric.get_gauge().get_value();
                    let key = format!("{origin}{ip_type}{account}{remediation}");
                    items.push(json!({
                        "name": "dropped",
                        "value": metrics::blocked_delta(&key, value),
                        "unit": "request",
                        "labels": {
                            "origin": origin,
                            "ip_type": ip_type,
                            "account": account,
                            "remediation": remediation,
                        },
                    }));
                }
            }
            metrics::PROCESSED_REQUESTS_NAME => {
                for metric in family.get_metric() {
                    let ip_type = label_value(metric, "ip_type");
                    let account = label_value(metric, "account");
                    let value = metric.get_gauge().get_value();
                    let key = format!("{ip_type}{account}");
                    items.push(json!({
                        "name": "processed",
                        "value": metrics::processed_delta(&key, value),
                        "unit": "request",
                        "labels": {
                            "ip_type": ip_type,
                            "account": account,
                        },
                    }));
                }
            }
            _ => {}
        }
    }

    json!({
        "remediation_components": [{
            "name": crate::config::PRODUCT_NAME,
            "type": crate::config::PRODUCT_NAME,
            "version": component_version,
            "utc_startup_timestamp": startup_timestamp,
            "metrics": [{
                "meta": {
                    "utc_now_timestamp": unix_now(),
                    "window_size_seconds": window.as_secs(),
                },
                "items": items,
            }],
        }],
    })
}

fn label_value(metric: &prometheus::proto::Metric, name: &str) -> String {
    metric
        .get_label()
        .iter()
        .find(|label| label.get_name() == name)
        .map(|label| label.get_value().to_string())
        .unwrap_or_default()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
