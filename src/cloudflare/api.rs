//! Capability trait and error taxonomy for the Cloudflare API.
//!
//! The reconciler and the infrastructure lifecycle never talk HTTP directly;
//! they go through [`EdgeApi`] so tests can substitute the deterministic
//! in-memory implementation. The trait is account-scoped: one instance per
//! configured account, authenticated with that account's token.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::Snafu;

use crate::cloudflare::types::{
    Account, D1Database, D1QueryResult, KvNamespace, KvPair, TurnstileWidget, WorkerRoute,
    WorkerUpload, Zone,
};

/// Maximum entries per bulk KV write or delete. Larger inputs are split by
/// the caller.
pub const BULK_WRITE_LIMIT: usize = 10_000;

/// Maximum keys per bulk KV read (`POST …/bulk/get`).
pub const BULK_READ_LIMIT: usize = 100;

/// Errors surfaced by [`EdgeApi`] operations.
///
/// The client never retries; it classifies and lets the caller decide.
#[derive(Debug, Snafu)]
pub enum EdgeApiError {
    /// The resource does not exist. Teardown treats this as success for the
    /// worker script.
    #[snafu(display("{resource} not found"))]
    NotFound {
        /// Human-readable identifier of the missing resource.
        resource: String,
    },

    /// The token was rejected. Not recoverable without operator action.
    #[snafu(display("authentication rejected: {message}"))]
    Auth {
        /// Error detail from the API.
        message: String,
    },

    /// Network failure or 5xx. The next reconciliation tick may succeed.
    #[snafu(display("transient API failure: {message}"))]
    Transient {
        /// Error detail.
        message: String,
    },

    /// Rate or plan limit hit.
    #[snafu(display("quota exceeded: {message}"))]
    Quota {
        /// Error detail from the API.
        message: String,
    },

    /// The payload was rejected. Fatal for the operation that sent it.
    #[snafu(display("request rejected: {message}"))]
    Malformed {
        /// Error detail from the API.
        message: String,
    },
}

impl EdgeApiError {
    /// True when the error means the resource is simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EdgeApiError::NotFound { .. })
    }
}

/// Account-scoped view of the Cloudflare REST surface.
///
/// Bulk operations take caller-sized slices: at most [`BULK_WRITE_LIMIT`]
/// entries for writes and deletes, [`BULK_READ_LIMIT`] keys for reads.
#[async_trait]
pub trait EdgeApi: Send + Sync {
    /// List the accounts visible to the token. Used by config generation.
    async fn list_accounts(&self) -> Result<Vec<Account>, EdgeApiError>;

    /// List the zones visible to the token.
    async fn list_zones(&self) -> Result<Vec<Zone>, EdgeApiError>;

    async fn create_kv_namespace(&self, title: &str) -> Result<String, EdgeApiError>;
    async fn list_kv_namespaces(&self) -> Result<Vec<KvNamespace>, EdgeApiError>;
    async fn delete_kv_namespace(&self, namespace_id: &str) -> Result<(), EdgeApiError>;

    /// Bulk-write up to [`BULK_WRITE_LIMIT`] pairs.
    async fn write_kv_pairs(
        &self,
        namespace_id: &str,
        pairs: &[KvPair],
    ) -> Result<(), EdgeApiError>;

    /// Bulk-delete up to [`BULK_WRITE_LIMIT`] keys.
    async fn delete_kv_keys(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<(), EdgeApiError>;

    /// Bulk-read up to [`BULK_READ_LIMIT`] keys. Keys absent remotely are
    /// absent from the returned map.
    async fn read_kv_values(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, EdgeApiError>;

    /// One page of key names plus the cursor for the next page, if any.
    async fn list_kv_keys(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), EdgeApiError>;

    /// Upload the worker script with its bindings; returns the script id.
    async fn upload_worker(&self, upload: &WorkerUpload) -> Result<String, EdgeApiError>;
    async fn delete_worker(&self, script_name: &str) -> Result<(), EdgeApiError>;

    async fn list_worker_routes(&self, zone_id: &str) -> Result<Vec<WorkerRoute>, EdgeApiError>;

    /// Bind the worker to a route pattern. `fail_open` lets traffic through
    /// when the worker is over quota or erroring.
    async fn create_worker_route(
        &self,
        zone_id: &str,
        pattern: &str,
        script: &str,
        fail_open: bool,
    ) -> Result<(), EdgeApiError>;

    async fn delete_worker_route(&self, zone_id: &str, route_id: &str)
        -> Result<(), EdgeApiError>;

    async fn create_turnstile_widget(
        &self,
        name: &str,
        domains: &[String],
        mode: &str,
    ) -> Result<TurnstileWidget, EdgeApiError>;

    async fn list_turnstile_widgets(&self) -> Result<Vec<TurnstileWidget>, EdgeApiError>;

    /// Rotate the widget secret; the site key never changes. Returns the new
    /// secret.
    async fn rotate_turnstile_widget(
        &self,
        site_key: &str,
        invalidate_immediately: bool,
    ) -> Result<String, EdgeApiError>;

    async fn delete_turnstile_widget(&self, site_key: &str) -> Result<(), EdgeApiError>;

    /// Create the metrics database; returns its uuid.
    async fn create_d1_database(&self, name: &str) -> Result<String, EdgeApiError>;
    async fn list_d1_databases(&self) -> Result<Vec<D1Database>, EdgeApiError>;
    async fn query_d1_database(
        &self,
        database_id: &str,
        sql: &str,
        params: &[String],
    ) -> Result<Vec<D1QueryResult>, EdgeApiError>;
    async fn delete_d1_database(&self, database_id: &str) -> Result<(), EdgeApiError>;
}
