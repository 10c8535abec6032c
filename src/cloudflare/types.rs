//! Wire types for the Cloudflare v4 API surface the synchronizer touches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reserved KV key holding the aggregated CIDR document.
pub const IP_RANGES_KEY: &str = "IP_RANGES";
/// Reserved KV key holding the HTML body served on ban.
pub const BAN_TEMPLATE_KEY: &str = "BAN_TEMPLATE";
/// Reserved KV key holding the per-domain Turnstile site-key/secret document.
pub const TURNSTILE_CONFIG_KEY: &str = "TURNSTILE_CONFIG";
/// Sentinel key marking that the initial snapshot has been ingested.
pub const WARMED_UP_KEY: &str = "WARMED_UP";
/// Operator-writable sentinel forcing a purge of decision keys.
pub const RESET_KEY: &str = "RESET";

/// Name shared by every Turnstile widget the synchronizer provisions.
pub const WIDGET_NAME: &str = "crowdsec-cloudflare-worker-bouncer-widget";

/// Keys that survive a reset of the namespace.
pub const PRESERVED_KEYS: [&str; 2] = [BAN_TEMPLATE_KEY, TURNSTILE_CONFIG_KEY];

/// Standard Cloudflare v4 response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
    #[serde(default)]
    pub result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultInfo {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub account: Option<Account>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvNamespace {
    pub id: String,
    pub title: String,
}

/// One key/value entry of a bulk KV write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvKey {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRoute {
    pub id: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnstileWidget {
    pub sitekey: String,
    pub secret: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct D1Database {
    pub uuid: String,
    pub name: String,
}

/// One statement result of a D1 query. Rows come back as loose JSON maps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct D1QueryResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub results: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Per-zone action document the worker consults at request time, published
/// under the `ACTIONS_BY_DOMAIN` binding keyed by domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionsForZone {
    pub supported_actions: Vec<String>,
    pub default_action: String,
}

/// Site key and secret of one Turnstile widget, mirrored per-domain under
/// `TURNSTILE_CONFIG`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetTokenConfig {
    pub site_key: String,
    pub secret: String,
}

/// Names of the per-account edge resources. Two accounts never share these
/// strings within the same Cloudflare account.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub script_name: String,
    pub kv_namespace_name: String,
    pub d1_database_name: String,
    /// Extra plain-text bindings for the uploaded worker. The autonomous
    /// variant carries LAPI credentials here so the worker can pull the
    /// decision stream from inside the edge runtime.
    pub extra_bindings: HashMap<String, String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            script_name: "crowdsec-cloudflare-worker-bouncer".into(),
            kv_namespace_name: "CROWDSEC_CF_BOUNCER_NS".into(),
            d1_database_name: "crowdsec-cloudflare-worker-bouncer-metrics".into(),
            extra_bindings: HashMap::new(),
        }
    }
}

/// Everything needed for one worker script upload.
#[derive(Debug, Clone)]
pub struct WorkerUpload {
    pub script_name: String,
    pub script: String,
    pub kv_namespace_id: String,
    /// JSON document mapping domain to [`ActionsForZone`].
    pub actions_by_domain: String,
    /// D1 database id, absent when the account has no metrics access.
    pub d1_database_id: Option<String>,
    /// Extra plain-text bindings (autonomous variant: LAPI url/key/frequency).
    pub extra_vars: HashMap<String, String>,
}
