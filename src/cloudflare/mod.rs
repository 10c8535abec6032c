//! Per-account management of Cloudflare edge resources.
//!
//! One [`AccountManager`] exclusively owns an account's in-memory decision
//! index and the remote KV namespace mirroring it. The manager applies
//! decision batches from the stream, provisions and tears down the account's
//! infrastructure, and refreshes the account's edge-side metrics. The
//! Turnstile widget lifecycle runs in a separate [`TurnstileHandler`] so
//! secret rotation can proceed while batches are being applied.

pub mod api;
pub mod inmemory;
pub mod rest;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, ZoneConfig};
use crate::decision::{Decision, Scope};
use crate::metrics;
use api::{EdgeApi, EdgeApiError, BULK_READ_LIMIT, BULK_WRITE_LIMIT};
use types::{
    ActionsForZone, KvPair, WidgetTokenConfig, WorkerSettings, WorkerUpload, BAN_TEMPLATE_KEY,
    IP_RANGES_KEY, PRESERVED_KEYS, RESET_KEY, TURNSTILE_CONFIG_KEY, WARMED_UP_KEY, WIDGET_NAME,
};

/// Embedded enforcement worker bundle, uploaded at provisioning.
const WORKER_SCRIPT: &str = include_str!("../../assets/worker.js");

/// Metrics table DDL. Idempotent, re-run on every provisioning.
const CREATE_METRICS_TABLE_SQL: &str = include_str!("../../assets/metrics.sql");

const DEFAULT_BAN_TEMPLATE: &str = "Access Denied";

/// Manager of one configured account.
///
/// The remote namespace reflects the last successfully committed projection
/// of the in-memory index. When a commit fails the index is the intended
/// state and the operator is advised to restart; the manager never attempts
/// partial recovery in-process.
pub struct AccountManager {
    pub account: AccountConfig,
    api: Arc<dyn EdgeApi>,
    worker: WorkerSettings,
    namespace_id: String,
    database_id: Option<String>,
    /// value → remediation, for the ip/as/country scopes.
    remediation_by_value: HashMap<String, String>,
    /// cidr → remediation. Ordered so the serialized document is canonical.
    action_by_ip_range: BTreeMap<String, String>,
    /// Last committed serialization of the range map.
    ip_ranges_doc: String,
    has_range_doc: bool,
    warmed_up: bool,
    /// Gauge contributions of this account, so a reset can zero them.
    active_by_labels: HashMap<(String, String, String, String), f64>,
}

impl AccountManager {
    /// Build a manager, resolving each configured zone against the zones the
    /// token can actually see. Unknown zone ids are a startup error.
    pub async fn new(
        api: Arc<dyn EdgeApi>,
        mut account: AccountConfig,
        worker: WorkerSettings,
    ) -> anyhow::Result<Self> {
        let zones = api
            .list_zones()
            .await
            .with_context(|| format!("listing zones for account {}", account.name))?;
        for zone_cfg in &mut account.zones {
            match zones.iter().find(|z| z.id == zone_cfg.zone_id) {
                Some(zone) => zone_cfg.domain = zone.name.clone(),
                None => anyhow::bail!(
                    "zone {} not found in account {}",
                    zone_cfg.zone_id,
                    account.id
                ),
            }
        }
        Ok(Self {
            account,
            api,
            worker,
            namespace_id: String::new(),
            database_id: None,
            remediation_by_value: HashMap::new(),
            action_by_ip_range: BTreeMap::new(),
            ip_ranges_doc: "{}".to_string(),
            has_range_doc: false,
            warmed_up: false,
            active_by_labels: HashMap::new(),
        })
    }

    /// Namespace id assigned at provisioning. Empty before [`Self::deploy_infra`].
    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    /// Whether the account got a metrics database at provisioning.
    pub fn has_metrics_db(&self) -> bool {
        self.database_id.is_some()
    }

    pub fn database_id(&self) -> Option<&str> {
        self.database_id.as_deref()
    }

    // ------------------------------------------------------------------
    // Provisioning / teardown
    // ------------------------------------------------------------------

    /// Provision the account's edge resources.
    ///
    /// Order matters: namespace, metrics database (non-fatal when the token
    /// lacks the permission), metrics DDL, ban template, worker upload, route
    /// binds. Any other failure is fatal for startup.
    pub async fn deploy_infra(&mut self) -> anyhow::Result<()> {
        info!(account = %self.account.name, namespace = %self.worker.kv_namespace_name, "creating KV namespace");
        self.namespace_id = self
            .api
            .create_kv_namespace(&self.worker.kv_namespace_name)
            .await
            .context("creating KV namespace")?;

        info!(account = %self.account.name, "creating D1 database for metrics");
        match self
            .api
            .create_d1_database(&self.worker.d1_database_name)
            .await
        {
            Ok(uuid) => self.database_id = Some(uuid),
            Err(err) => {
                warn!(
                    account = %self.account.name,
                    error = %err,
                    "could not create the metrics database; the worker will run without metrics. Make sure the token has the proper permissions"
                );
                self.database_id = None;
            }
        }

        if let Some(database_id) = self.database_id.clone() {
            self.api
                .query_d1_database(&database_id, CREATE_METRICS_TABLE_SQL, &[])
                .await
                .context("creating the metrics table; make sure the token has the proper permissions")?;
        }

        let ban_template = if self.account.ban_template.is_empty() {
            DEFAULT_BAN_TEMPLATE.to_string()
        } else {
            std::fs::read_to_string(&self.account.ban_template).with_context(|| {
                format!("reading ban template at {}", self.account.ban_template)
            })?
        };
        self.api
            .write_kv_pairs(
                &self.namespace_id,
                &[KvPair::new(BAN_TEMPLATE_KEY, ban_template)],
            )
            .await
            .context("writing ban template to KV")?;

        let actions_by_domain: BTreeMap<&str, ActionsForZone> = self
            .account
            .zones
            .iter()
            .map(|z| {
                (
                    z.domain.as_str(),
                    ActionsForZone {
                        supported_actions: z.actions.clone(),
                        default_action: z.default_action.clone(),
                    },
                )
            })
            .collect();

        info!(account = %self.account.name, script = %self.worker.script_name, "uploading worker");
        let script_id = self
            .api
            .upload_worker(&WorkerUpload {
                script_name: self.worker.script_name.clone(),
                script: WORKER_SCRIPT.to_string(),
                kv_namespace_id: self.namespace_id.clone(),
                actions_by_domain: serde_json::to_string(&actions_by_domain)?,
                d1_database_id: self.database_id.clone(),
                extra_vars: self.worker.extra_bindings.clone(),
            })
            .await
            .context("uploading worker script")?;

        let binds = self.account.zones.iter().flat_map(|zone| {
            zone.routes_to_protect.iter().map(|route| {
                let api = self.api.clone();
                let zone_id = zone.zone_id.clone();
                let domain = zone.domain.clone();
                let fail_open = zone.fail_open;
                let pattern = route.clone();
                let script_id = script_id.clone();
                async move {
                    info!(zone = %domain, route = %pattern, "binding worker to route");
                    api.create_worker_route(&zone_id, &pattern, &script_id, fail_open)
                        .await
                        .map_err(|err| {
                            warn!(
                                zone = %domain,
                                route = %pattern,
                                "failed to create worker route; if fail_open is set this may be the cause, as the parameter is not officially supported by the API"
                            );
                            err
                        })
                }
            })
        });
        try_join_all(binds).await.context("binding worker routes")?;
        Ok(())
    }

    /// Delete every edge resource whose name matches this account's
    /// configured names. Runs before provisioning and again at shutdown.
    ///
    /// A missing worker script is expected and silent; every other failure
    /// is surfaced. D1 listing failures are tolerated at startup, where the
    /// token may simply lack the permission.
    pub async fn clean_up_existing_workers(&mut self, startup: bool) -> anyhow::Result<()> {
        info!(account = %self.account.name, "cleaning up existing workers");

        debug!(account = %self.account.name, "listing existing turnstile widgets");
        let widgets = self
            .api
            .list_turnstile_widgets()
            .await
            .context("listing turnstile widgets")?;
        for widget in widgets {
            if widget.name == WIDGET_NAME {
                debug!(site_key = %widget.sitekey, "deleting turnstile widget");
                self.api
                    .delete_turnstile_widget(&widget.sitekey)
                    .await
                    .context("deleting turnstile widget")?;
            }
        }

        for zone in &self.account.zones {
            debug!(zone = %zone.domain, "listing worker routes");
            let routes = self
                .api
                .list_worker_routes(&zone.zone_id)
                .await
                .context("listing worker routes")?;
            for route in routes {
                if route.script.as_deref() == Some(self.worker.script_name.as_str()) {
                    debug!(zone = %zone.domain, route_id = %route.id, "deleting worker route");
                    self.api
                        .delete_worker_route(&zone.zone_id, &route.id)
                        .await
                        .context("deleting worker route")?;
                }
            }
        }

        debug!(script = %self.worker.script_name, "deleting worker script");
        match self.api.delete_worker(&self.worker.script_name).await {
            Ok(()) => debug!(script = %self.worker.script_name, "deleted worker script"),
            Err(err) if err.is_not_found() => {
                debug!(script = %self.worker.script_name, "worker script not present");
            }
            Err(err) => return Err(err).context("deleting worker script"),
        }

        let namespaces = self
            .api
            .list_kv_namespaces()
            .await
            .context("listing KV namespaces")?;
        for namespace in namespaces {
            if namespace.title == self.worker.kv_namespace_name {
                debug!(namespace_id = %namespace.id, "deleting KV namespace");
                self.api
                    .delete_kv_namespace(&namespace.id)
                    .await
                    .context("deleting KV namespace")?;
            }
        }

        if self.database_id.is_some() || startup {
            let databases = match self.api.list_d1_databases().await {
                Ok(databases) => databases,
                Err(err) if startup => {
                    debug!(error = %err, "cannot list D1 databases at startup, skipping");
                    Vec::new()
                }
                Err(err) => {
                    return Err(err)
                        .context("listing D1 databases; make sure the token has the proper permissions")
                }
            };
            for database in databases {
                if database.name == self.worker.d1_database_name {
                    debug!(database_id = %database.uuid, "deleting D1 database");
                    self.api
                        .delete_d1_database(&database.uuid)
                        .await
                        .context("deleting D1 database")?;
                }
            }
        }

        info!(account = %self.account.name, "done cleaning up existing workers");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply one stream cycle: honor a pending reset request, then deletions,
    /// then additions, then the range-document commit, then derived gauges.
    ///
    /// An empty cycle is a strict no-op: no API calls, no state change.
    pub async fn apply_batch(
        &mut self,
        deleted: &[Decision],
        new: &[Decision],
    ) -> anyhow::Result<()> {
        if deleted.is_empty() && new.is_empty() {
            return Ok(());
        }
        self.honor_reset_request().await?;
        self.process_deleted_decisions(deleted).await?;
        self.process_new_decisions(new).await?;
        self.commit_ip_ranges_if_changed().await?;
        self.update_totals();
        Ok(())
    }

    /// Consult the operator-writable reset sentinel and purge when asked.
    async fn honor_reset_request(&mut self) -> anyhow::Result<()> {
        let values = read_values_chunked(
            self.api.as_ref(),
            &self.namespace_id,
            &[RESET_KEY.to_string()],
        )
        .await
        .context("reading reset sentinel")?;
        if values.get(RESET_KEY).map(String::as_str) == Some("true") {
            info!(account = %self.account.name, "reset requested, purging decision keys");
            self.reset_decision_keys().await?;
        }
        Ok(())
    }

    /// Remove deleted decisions from the index and the namespace.
    ///
    /// A deletion only applies when the recorded remediation matches; a
    /// mismatch means the decision was already superseded and is skipped.
    async fn process_deleted_decisions(&mut self, decisions: &[Decision]) -> anyhow::Result<()> {
        let mut keys_to_delete: Vec<String> = Vec::new();
        for decision in decisions {
            match decision.scope {
                Scope::Range => {
                    if self.action_by_ip_range.get(&decision.value)
                        == Some(&decision.remediation)
                    {
                        self.bump_active(decision, -1.0);
                        self.action_by_ip_range.remove(&decision.value);
                    }
                }
                Scope::Ip | Scope::As | Scope::Country => {
                    if self.remediation_by_value.get(&decision.value)
                        == Some(&decision.remediation)
                    {
                        self.bump_active(decision, -1.0);
                        keys_to_delete.push(decision.value.clone());
                    }
                }
            }
        }

        if keys_to_delete.is_empty() {
            debug!(account = %self.account.name, "no keys to delete");
            return Ok(());
        }

        info!(account = %self.account.name, count = keys_to_delete.len(), "deleting decisions");
        let deletes = keys_to_delete.chunks(BULK_WRITE_LIMIT).map(|chunk| {
            let api = self.api.clone();
            let namespace_id = self.namespace_id.clone();
            let chunk = chunk.to_vec();
            async move { api.delete_kv_keys(&namespace_id, &chunk).await }
        });
        try_join_all(deletes).await.context("bulk deleting keys")?;

        for key in &keys_to_delete {
            self.remediation_by_value.remove(key);
        }
        info!(account = %self.account.name, count = keys_to_delete.len(), "deleted decisions");
        Ok(())
    }

    /// Upsert new decisions into the index and the namespace.
    ///
    /// Writes are deduplicated within the batch, last write wins per value.
    /// Range decisions only touch the range map; their KV projection is the
    /// aggregated document committed at the end of the cycle.
    async fn process_new_decisions(&mut self, decisions: &[Decision]) -> anyhow::Result<()> {
        let mut keys_to_write: Vec<KvPair> = Vec::new();
        let mut write_index: HashMap<String, usize> = HashMap::new();
        let mut staged: HashMap<String, String> = HashMap::new();

        for decision in decisions {
            match decision.scope {
                Scope::Range => {
                    if !self.action_by_ip_range.contains_key(&decision.value) {
                        self.bump_active(decision, 1.0);
                    }
                    self.action_by_ip_range
                        .insert(decision.value.clone(), decision.remediation.clone());
                }
                Scope::Ip | Scope::As | Scope::Country => {
                    let current: Option<String> = staged
                        .get(&decision.value)
                        .or_else(|| self.remediation_by_value.get(&decision.value))
                        .cloned();
                    match current {
                        Some(existing) if existing == decision.remediation => {}
                        Some(_) => {
                            if let Some(&index) = write_index.get(&decision.value) {
                                keys_to_write[index].value = decision.remediation.clone();
                            } else {
                                write_index.insert(decision.value.clone(), keys_to_write.len());
                                keys_to_write.push(KvPair::new(
                                    decision.value.clone(),
                                    decision.remediation.clone(),
                                ));
                            }
                            staged.insert(decision.value.clone(), decision.remediation.clone());
                        }
                        None => {
                            write_index.insert(decision.value.clone(), keys_to_write.len());
                            keys_to_write.push(KvPair::new(
                                decision.value.clone(),
                                decision.remediation.clone(),
                            ));
                            staged.insert(decision.value.clone(), decision.remediation.clone());
                            self.bump_active(decision, 1.0);
                        }
                    }
                }
            }
        }

        if keys_to_write.is_empty() && self.warmed_up {
            debug!(account = %self.account.name, "no keys to write");
            return Ok(());
        }

        if !self.warmed_up {
            keys_to_write.push(KvPair::new(WARMED_UP_KEY, "true"));
        }

        info!(account = %self.account.name, count = keys_to_write.len(), "adding decisions");
        let writes = keys_to_write.chunks(BULK_WRITE_LIMIT).map(|chunk| {
            let api = self.api.clone();
            let namespace_id = self.namespace_id.clone();
            let chunk = chunk.to_vec();
            async move { api.write_kv_pairs(&namespace_id, &chunk).await }
        });
        try_join_all(writes).await.context("bulk writing keys")?;

        for (value, remediation) in staged {
            self.remediation_by_value.insert(value, remediation);
        }
        self.warmed_up = true;
        Ok(())
    }

    /// Re-serialize the range map and write the aggregated document, but only
    /// when its content actually changed since the last committed write.
    async fn commit_ip_ranges_if_changed(&mut self) -> anyhow::Result<()> {
        let document = serde_json::to_string(&self.action_by_ip_range)?;
        if document == self.ip_ranges_doc {
            return Ok(());
        }
        debug!(
            account = %self.account.name,
            ranges = self.action_by_ip_range.len(),
            "IP ranges changed, writing new document"
        );
        self.api
            .write_kv_pairs(
                &self.namespace_id,
                &[KvPair::new(IP_RANGES_KEY, document.clone())],
            )
            .await
            .context("writing IP ranges document")?;
        self.ip_ranges_doc = document;
        self.has_range_doc = true;
        Ok(())
    }

    /// Purge every non-preserved key, leaving only the ban template, the
    /// Turnstile document and a cleared reset sentinel. The in-memory index
    /// and the warm-up mark start over.
    pub async fn reset_decision_keys(&mut self) -> anyhow::Result<()> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = self
                .api
                .list_kv_keys(&self.namespace_id, cursor.as_deref())
                .await
                .context("listing keys for reset")?;
            keys.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let doomed: Vec<String> = keys
            .into_iter()
            .filter(|key| !PRESERVED_KEYS.contains(&key.as_str()) && key != RESET_KEY)
            .collect();
        if !doomed.is_empty() {
            info!(account = %self.account.name, count = doomed.len(), "purging decision keys");
            let deletes = doomed.chunks(BULK_WRITE_LIMIT).map(|chunk| {
                let api = self.api.clone();
                let namespace_id = self.namespace_id.clone();
                let chunk = chunk.to_vec();
                async move { api.delete_kv_keys(&namespace_id, &chunk).await }
            });
            try_join_all(deletes).await.context("purging keys")?;
        }

        self.api
            .write_kv_pairs(&self.namespace_id, &[KvPair::new(RESET_KEY, "false")])
            .await
            .context("clearing reset sentinel")?;

        self.remediation_by_value.clear();
        self.action_by_ip_range.clear();
        self.ip_ranges_doc = "{}".to_string();
        self.has_range_doc = false;
        self.warmed_up = false;
        self.clear_active();
        self.update_totals();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    fn bump_active(&mut self, decision: &Decision, delta: f64) {
        let origin = decision.metric_origin();
        let ip_type = decision.ip_type().to_string();
        let scope = decision.scope.to_string();
        metrics::ACTIVE_DECISIONS
            .with_label_values(&[
                &origin,
                &ip_type,
                &scope,
                &self.account.name,
                &decision.remediation,
            ])
            .add(delta);
        *self
            .active_by_labels
            .entry((origin, ip_type, scope, decision.remediation.clone()))
            .or_insert(0.0) += delta;
    }

    fn clear_active(&mut self) {
        for ((origin, ip_type, scope, remediation), count) in self.active_by_labels.drain() {
            metrics::ACTIVE_DECISIONS
                .with_label_values(&[&origin, &ip_type, &scope, &self.account.name, &remediation])
                .sub(count);
        }
    }

    /// Recompute the key-count gauge from the index and the reserved keys.
    fn update_totals(&self) {
        let mut total = 1; // ban template
        if self.account.zones.iter().any(|z| z.turnstile.enabled) {
            total += 1;
        }
        if self.has_range_doc {
            total += 1;
        }
        total += self.remediation_by_value.len();
        metrics::TOTAL_KEYS
            .with_label_values(&[&self.account.name])
            .set(total as f64);
    }

    /// Refresh the blocked/processed gauges from the account's metrics
    /// database. A no-op for accounts provisioned without one.
    pub async fn refresh_usage_metrics(&self) -> anyhow::Result<()> {
        let Some(database_id) = &self.database_id else {
            debug!(account = %self.account.name, "no metrics database, skipping refresh");
            return Ok(());
        };
        let results = self
            .api
            .query_d1_database(database_id, "SELECT * FROM metrics", &[])
            .await
            .context("querying metrics database")?;

        for result in results {
            if !result.success {
                warn!(account = %self.account.name, "metrics query reported failure");
                continue;
            }
            for row in result.results {
                let value = row.get("val").and_then(serde_json::Value::as_f64);
                let ip_type = row.get("ip_type").and_then(serde_json::Value::as_str);
                match row.get("metric_name").and_then(serde_json::Value::as_str) {
                    Some("processed") => {
                        let (Some(value), Some(ip_type)) = (value, ip_type) else {
                            warn!(account = %self.account.name, row = ?row, "invalid processed metric row");
                            continue;
                        };
                        metrics::PROCESSED_REQUESTS
                            .with_label_values(&[ip_type, &self.account.name])
                            .set(value);
                    }
                    Some("dropped") => {
                        let origin = row.get("origin").and_then(serde_json::Value::as_str);
                        let remediation = row
                            .get("remediation_type")
                            .and_then(serde_json::Value::as_str);
                        let (Some(value), Some(ip_type), Some(origin), Some(remediation)) =
                            (value, ip_type, origin, remediation)
                        else {
                            warn!(account = %self.account.name, row = ?row, "invalid dropped metric row");
                            continue;
                        };
                        metrics::BLOCKED_REQUESTS
                            .with_label_values(&[origin, ip_type, remediation, &self.account.name])
                            .set(value);
                    }
                    other => {
                        warn!(account = %self.account.name, metric = ?other, "unknown metric row");
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Turnstile
    // ------------------------------------------------------------------

    /// Handler owning this account's widget lifecycle. Built after
    /// provisioning so it sees the namespace id.
    pub fn turnstile_handler(&self) -> TurnstileHandler {
        TurnstileHandler {
            api: self.api.clone(),
            account_name: self.account.name.clone(),
            namespace_id: self.namespace_id.clone(),
            zones: self
                .account
                .zones
                .iter()
                .filter(|z| z.turnstile.enabled)
                .cloned()
                .collect(),
            tokens: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

/// Bulk-read an arbitrary number of keys, splitting into the client's
/// per-call limit. Keys absent remotely are absent from the result.
pub async fn read_values_chunked(
    api: &dyn EdgeApi,
    namespace_id: &str,
    keys: &[String],
) -> Result<HashMap<String, String>, EdgeApiError> {
    let mut values = HashMap::new();
    for chunk in keys.chunks(BULK_READ_LIMIT) {
        values.extend(api.read_kv_values(namespace_id, chunk).await?);
    }
    Ok(values)
}

/// Widget creation, publication and secret rotation for one account.
///
/// The shared domain → token map is behind a mutex because the per-zone
/// rotators and the publish path both touch it.
#[derive(Clone)]
pub struct TurnstileHandler {
    api: Arc<dyn EdgeApi>,
    account_name: String,
    namespace_id: String,
    zones: Vec<ZoneConfig>,
    tokens: Arc<Mutex<BTreeMap<String, WidgetTokenConfig>>>,
}

impl TurnstileHandler {
    /// Create the widgets, publish the config document, then rotate secrets
    /// on each zone's interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.zones.is_empty() {
            return Ok(());
        }
        self.create_widgets().await?;
        self.publish().await?;

        let rotator_cancel = cancel.child_token();
        let mut rotators = JoinSet::new();
        for zone in &self.zones {
            if !zone.turnstile.rotate_secret_key {
                continue;
            }
            let handler = self.clone();
            let zone = zone.clone();
            let cancel = rotator_cancel.clone();
            rotators.spawn(async move { handler.rotate_zone_loop(zone, cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = rotators.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("rotator panicked: {e}")));
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                    // Stop the sibling rotators; a rotation failure for one
                    // zone drains the whole account handler.
                    rotator_cancel.cancel();
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create one widget per Turnstile-enabled zone, concurrently.
    pub async fn create_widgets(&self) -> anyhow::Result<()> {
        let creations = self.zones.iter().map(|zone| {
            let api = self.api.clone();
            let domain = zone.domain.clone();
            let mode = zone.turnstile.mode.clone();
            async move {
                info!(zone = %domain, "creating turnstile widget");
                let widget = api
                    .create_turnstile_widget(WIDGET_NAME, &[domain.clone()], &mode)
                    .await?;
                info!(zone = %domain, "done creating turnstile widget");
                Ok::<_, EdgeApiError>((
                    domain,
                    WidgetTokenConfig {
                        site_key: widget.sitekey,
                        secret: widget.secret,
                    },
                ))
            }
        });
        let created = try_join_all(creations)
            .await
            .context("creating turnstile widgets")?;
        let mut tokens = self.tokens.lock().await;
        for (domain, config) in created {
            tokens.insert(domain, config);
        }
        Ok(())
    }

    /// Serialize the token map and write it under the Turnstile config key.
    pub async fn publish(&self) -> anyhow::Result<()> {
        let document = {
            let tokens = self.tokens.lock().await;
            serde_json::to_string(&*tokens)?
        };
        info!(account = %self.account_name, "writing turnstile config");
        self.api
            .write_kv_pairs(
                &self.namespace_id,
                &[KvPair::new(TURNSTILE_CONFIG_KEY, document)],
            )
            .await
            .context("writing turnstile config to KV")?;
        Ok(())
    }

    /// One rotation for one domain: new secret, same site key, republish.
    pub async fn rotate_once(&self, domain: &str) -> anyhow::Result<()> {
        let site_key = {
            let tokens = self.tokens.lock().await;
            let Some(config) = tokens.get(domain) else {
                anyhow::bail!("no turnstile widget for zone {domain}");
            };
            config.site_key.clone()
        };
        let secret = self
            .api
            .rotate_turnstile_widget(&site_key, true)
            .await
            .context("rotating turnstile secret")?;
        {
            let mut tokens = self.tokens.lock().await;
            tokens.insert(
                domain.to_string(),
                WidgetTokenConfig { site_key, secret },
            );
        }
        self.publish().await
    }

    /// Current token for a domain, for inspection in tests.
    pub async fn token_for(&self, domain: &str) -> Option<WidgetTokenConfig> {
        self.tokens.lock().await.get(domain).cloned()
    }

    async fn rotate_zone_loop(
        &self,
        zone: ZoneConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(zone = %zone.domain, "starting turnstile rotator");
        let period = zone.turnstile.rotate_secret_key_every;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(zone = %zone.domain, "stopping turnstile rotator");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    info!(zone = %zone.domain, "rotating turnstile secret key");
                    self.rotate_once(&zone.domain).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::inmemory::DeterministicEdgeApi;
    use crate::cloudflare::types::Zone;
    use crate::config::TurnstileConfig;

    fn decision(scope: Scope, remediation: &str, value: &str) -> Decision {
        Decision {
            scope,
            remediation: remediation.into(),
            value: value.into(),
            origin: "crowdsec".into(),
            scenario: "crowdsecurity/http-probing".into(),
            duration: "4h".into(),
            until: None,
        }
    }

    async fn provisioned_manager() -> (Arc<DeterministicEdgeApi>, AccountManager) {
        let api = DeterministicEdgeApi::with_zones(vec![Zone {
            id: "z1".into(),
            name: "example.com".into(),
            account: None,
        }])
        .await;
        let account = AccountConfig {
            id: "acc1".into(),
            token: "tok".into(),
            name: "test-account".into(),
            ban_template: String::new(),
            zones: vec![ZoneConfig {
                zone_id: "z1".into(),
                actions: vec!["ban".into()],
                default_action: "ban".into(),
                routes_to_protect: vec!["*example.com/*".into()],
                turnstile: TurnstileConfig::default(),
                fail_open: false,
                domain: String::new(),
            }],
        };
        let mut manager = AccountManager::new(api.clone(), account, WorkerSettings::default())
            .await
            .unwrap();
        manager.deploy_infra().await.unwrap();
        (api, manager)
    }

    #[tokio::test]
    async fn deletion_of_one_value_leaves_sibling_with_same_remediation() {
        // Two decisions sharing a remediation must stay independent in the
        // index; deleting one never drags the other along.
        let (api, mut manager) = provisioned_manager().await;
        manager
            .apply_batch(
                &[],
                &[
                    decision(Scope::Ip, "ban", "1.1.1.1"),
                    decision(Scope::Ip, "ban", "2.2.2.2"),
                ],
            )
            .await
            .unwrap();
        manager
            .apply_batch(&[decision(Scope::Ip, "ban", "1.1.1.1")], &[])
            .await
            .unwrap();

        let data = api.namespace_data(manager.namespace_id()).await;
        assert!(!data.contains_key("1.1.1.1"));
        assert_eq!(data.get("2.2.2.2").map(String::as_str), Some("ban"));
    }

    #[tokio::test]
    async fn last_write_wins_within_one_batch() {
        let (api, mut manager) = provisioned_manager().await;
        manager
            .apply_batch(
                &[],
                &[
                    decision(Scope::Ip, "ban", "1.1.1.1"),
                    decision(Scope::Ip, "captcha", "1.1.1.1"),
                ],
            )
            .await
            .unwrap();
        let data = api.namespace_data(manager.namespace_id()).await;
        assert_eq!(data.get("1.1.1.1").map(String::as_str), Some("captcha"));
    }

    #[tokio::test]
    async fn range_document_detects_value_only_change() {
        let (api, mut manager) = provisioned_manager().await;
        manager
            .apply_batch(&[], &[decision(Scope::Range, "ban", "10.0.0.0/8")])
            .await
            .unwrap();
        // Same key set, different value: the document must be re-written.
        manager
            .apply_batch(&[], &[decision(Scope::Range, "captcha", "10.0.0.0/8")])
            .await
            .unwrap();
        let data = api.namespace_data(manager.namespace_id()).await;
        assert_eq!(
            data.get(IP_RANGES_KEY).map(String::as_str),
            Some(r#"{"10.0.0.0/8":"captcha"}"#)
        );
    }

    #[tokio::test]
    async fn range_deletion_requires_matching_remediation() {
        let (api, mut manager) = provisioned_manager().await;
        manager
            .apply_batch(&[], &[decision(Scope::Range, "captcha", "10.0.0.0/8")])
            .await
            .unwrap();
        manager
            .apply_batch(&[decision(Scope::Range, "ban", "10.0.0.0/8")], &[])
            .await
            .unwrap();
        let data = api.namespace_data(manager.namespace_id()).await;
        assert_eq!(
            data.get(IP_RANGES_KEY).map(String::as_str),
            Some(r#"{"10.0.0.0/8":"captcha"}"#)
        );
    }

    #[tokio::test]
    async fn failed_bulk_write_aborts_the_cycle_without_committing() {
        let (api, mut manager) = provisioned_manager().await;
        api.set_fail_kv_writes(true).await;
        let result = manager
            .apply_batch(&[], &[decision(Scope::Ip, "ban", "1.1.1.1")])
            .await;
        assert!(result.is_err());

        // The next cycle converges the remote to the intended state.
        api.set_fail_kv_writes(false).await;
        manager
            .apply_batch(&[], &[decision(Scope::Ip, "ban", "1.1.1.1")])
            .await
            .unwrap();
        let data = api.namespace_data(manager.namespace_id()).await;
        assert_eq!(data.get("1.1.1.1").map(String::as_str), Some("ban"));
    }

    #[tokio::test]
    async fn failed_bulk_delete_keeps_the_index_entry() {
        let (api, mut manager) = provisioned_manager().await;
        manager
            .apply_batch(&[], &[decision(Scope::Ip, "ban", "1.1.1.1")])
            .await
            .unwrap();

        api.set_fail_kv_deletes(true).await;
        let result = manager
            .apply_batch(&[decision(Scope::Ip, "ban", "1.1.1.1")], &[])
            .await;
        assert!(result.is_err());

        // The intended state still carries the deletion; the next cycle
        // issues it again and converges.
        api.set_fail_kv_deletes(false).await;
        manager
            .apply_batch(&[decision(Scope::Ip, "ban", "1.1.1.1")], &[])
            .await
            .unwrap();
        let data = api.namespace_data(manager.namespace_id()).await;
        assert!(!data.contains_key("1.1.1.1"));
    }

    #[tokio::test]
    async fn usage_metrics_refresh_reads_the_metrics_database() {
        let (api, manager) = provisioned_manager().await;
        let database_id = manager.database_id().unwrap().to_string();
        let row = |name: &str, origin: &str, remediation: &str, ip_type: &str, val: u64| {
            let mut row = serde_json::Map::new();
            row.insert("metric_name".into(), name.into());
            row.insert("origin".into(), origin.into());
            row.insert("remediation_type".into(), remediation.into());
            row.insert("ip_type".into(), ip_type.into());
            row.insert("val".into(), val.into());
            row
        };
        api.seed_metrics_rows(
            &database_id,
            vec![
                row("processed", "", "", "ipv4", 120),
                row("dropped", "crowdsec", "ban", "ipv4", 7),
            ],
        )
        .await;

        manager.refresh_usage_metrics().await.unwrap();

        let processed = metrics::PROCESSED_REQUESTS
            .with_label_values(&["ipv4", &manager.account.name])
            .get();
        assert_eq!(processed, 120.0);
        let blocked = metrics::BLOCKED_REQUESTS
            .with_label_values(&["crowdsec", "ipv4", "ban", &manager.account.name])
            .get();
        assert_eq!(blocked, 7.0);
    }

    #[tokio::test]
    async fn metrics_db_denial_is_not_fatal() {
        let api = DeterministicEdgeApi::with_zones(vec![Zone {
            id: "z1".into(),
            name: "example.com".into(),
            account: None,
        }])
        .await;
        api.set_deny_d1(true).await;
        let account = AccountConfig {
            id: "acc1".into(),
            token: "tok".into(),
            name: "no-d1".into(),
            ban_template: String::new(),
            zones: Vec::new(),
        };
        let mut manager = AccountManager::new(api.clone(), account, WorkerSettings::default())
            .await
            .unwrap();
        manager.deploy_infra().await.unwrap();
        assert!(!manager.has_metrics_db());
        // And the refresh path quietly does nothing.
        manager.refresh_usage_metrics().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_zone_is_a_startup_error() {
        let api = DeterministicEdgeApi::with_zones(Vec::new()).await;
        let account = AccountConfig {
            id: "acc1".into(),
            token: "tok".into(),
            name: "test".into(),
            ban_template: String::new(),
            zones: vec![ZoneConfig {
                zone_id: "missing".into(),
                ..ZoneConfig::default()
            }],
        };
        let result = AccountManager::new(api, account, WorkerSettings::default()).await;
        assert!(result.is_err());
    }
}
