//! In-memory implementation of [`EdgeApi`] for testing.
//!
//! Deterministic, non-persistent stand-in for the live REST client. It
//! mirrors the remote behavior the reconciler depends on (bulk size
//! enforcement, missing-resource errors, pagination, secret rotation) with
//! no network I/O, and records per-operation call counts so tests can assert
//! on batching arithmetic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cloudflare::api::{EdgeApi, EdgeApiError, BULK_READ_LIMIT, BULK_WRITE_LIMIT};
use crate::cloudflare::types::{
    Account, D1Database, D1QueryResult, KvNamespace, KvPair, TurnstileWidget, WorkerRoute,
    WorkerUpload, Zone,
};

/// Per-operation call counts, snapshot via [`DeterministicEdgeApi::call_counts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub kv_writes: u64,
    pub kv_deletes: u64,
    pub kv_reads: u64,
    pub kv_key_lists: u64,
    pub worker_uploads: u64,
    pub route_creates: u64,
    pub widget_creates: u64,
    pub widget_rotations: u64,
    pub d1_queries: u64,
}

#[derive(Debug, Default)]
struct NamespaceRecord {
    id: String,
    title: String,
    data: HashMap<String, String>,
}

#[derive(Debug)]
struct RouteRecord {
    id: String,
    pattern: String,
    script: String,
    #[allow(dead_code)]
    fail_open: bool,
}

#[derive(Debug)]
struct WidgetRecord {
    site_key: String,
    name: String,
    domains: Vec<String>,
    mode: String,
    secret: String,
    rotations: u64,
}

#[derive(Debug, Default)]
struct DatabaseRecord {
    uuid: String,
    name: String,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Default)]
struct EdgeState {
    accounts: Vec<Account>,
    zones: Vec<Zone>,
    namespaces: Vec<NamespaceRecord>,
    workers: HashMap<String, String>,
    routes: HashMap<String, Vec<RouteRecord>>,
    widgets: Vec<WidgetRecord>,
    databases: Vec<DatabaseRecord>,
    counts: CallCounts,
    next_id: u64,
    fail_kv_writes: bool,
    fail_kv_deletes: bool,
    deny_d1: bool,
    key_page_size: usize,
}

/// Deterministic in-memory Cloudflare.
#[derive(Clone, Default)]
pub struct DeterministicEdgeApi {
    state: Arc<Mutex<EdgeState>>,
}

impl DeterministicEdgeApi {
    /// Fake with the given zones already visible to the token.
    pub async fn with_zones(zones: Vec<Zone>) -> Arc<Self> {
        let api = Arc::new(Self::default());
        api.state.lock().await.zones = zones;
        api
    }

    /// Force subsequent bulk writes to fail with a transient error.
    pub async fn set_fail_kv_writes(&self, fail: bool) {
        self.state.lock().await.fail_kv_writes = fail;
    }

    /// Force subsequent bulk deletes to fail with a transient error.
    pub async fn set_fail_kv_deletes(&self, fail: bool) {
        self.state.lock().await.fail_kv_deletes = fail;
    }

    /// Reject D1 database creation, as a token without D1 permission would.
    pub async fn set_deny_d1(&self, deny: bool) {
        self.state.lock().await.deny_d1 = deny;
    }

    /// Page size used by key listing, for pagination tests.
    pub async fn set_key_page_size(&self, size: usize) {
        self.state.lock().await.key_page_size = size.max(1);
    }

    pub async fn call_counts(&self) -> CallCounts {
        self.state.lock().await.counts
    }

    /// Snapshot of a namespace's contents.
    pub async fn namespace_data(&self, namespace_id: &str) -> HashMap<String, String> {
        let state = self.state.lock().await;
        state
            .namespaces
            .iter()
            .find(|ns| ns.id == namespace_id)
            .map(|ns| ns.data.clone())
            .unwrap_or_default()
    }

    /// Current secret of a widget, for rotation tests.
    pub async fn widget_secret(&self, site_key: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .widgets
            .iter()
            .find(|w| w.site_key == site_key)
            .map(|w| w.secret.clone())
    }

    /// Seed rows into a metrics database, as the edge worker would.
    pub async fn seed_metrics_rows(
        &self,
        database_id: &str,
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(db) = state.databases.iter_mut().find(|db| db.uuid == database_id) {
            db.rows = rows;
        }
    }

    pub async fn worker_exists(&self, script_name: &str) -> bool {
        self.state.lock().await.workers.contains_key(script_name)
    }

    pub async fn namespace_count(&self) -> usize {
        self.state.lock().await.namespaces.len()
    }

    pub async fn widget_count(&self) -> usize {
        self.state.lock().await.widgets.len()
    }

    pub async fn database_count(&self) -> usize {
        self.state.lock().await.databases.len()
    }

    pub async fn route_count(&self) -> usize {
        self.state.lock().await.routes.values().map(Vec::len).sum()
    }
}

fn next_id(state: &mut EdgeState, prefix: &str) -> String {
    state.next_id += 1;
    format!("{prefix}-{}", state.next_id)
}

#[async_trait]
impl EdgeApi for DeterministicEdgeApi {
    async fn list_accounts(&self) -> Result<Vec<Account>, EdgeApiError> {
        Ok(self.state.lock().await.accounts.clone())
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, EdgeApiError> {
        Ok(self.state.lock().await.zones.clone())
    }

    async fn create_kv_namespace(&self, title: &str) -> Result<String, EdgeApiError> {
        let mut state = self.state.lock().await;
        let id = next_id(&mut state, "ns");
        state.namespaces.push(NamespaceRecord {
            id: id.clone(),
            title: title.to_string(),
            data: HashMap::new(),
        });
        Ok(id)
    }

    async fn list_kv_namespaces(&self) -> Result<Vec<KvNamespace>, EdgeApiError> {
        let state = self.state.lock().await;
        Ok(state
            .namespaces
            .iter()
            .map(|ns| KvNamespace {
                id: ns.id.clone(),
                title: ns.title.clone(),
            })
            .collect())
    }

    async fn delete_kv_namespace(&self, namespace_id: &str) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        let before = state.namespaces.len();
        state.namespaces.retain(|ns| ns.id != namespace_id);
        if state.namespaces.len() == before {
            return Err(EdgeApiError::NotFound {
                resource: format!("kv namespace {namespace_id}"),
            });
        }
        Ok(())
    }

    async fn write_kv_pairs(
        &self,
        namespace_id: &str,
        pairs: &[KvPair],
    ) -> Result<(), EdgeApiError> {
        if pairs.len() > BULK_WRITE_LIMIT {
            return Err(EdgeApiError::Malformed {
                message: format!("bulk write of {} entries exceeds the limit", pairs.len()),
            });
        }
        let mut state = self.state.lock().await;
        state.counts.kv_writes += 1;
        if state.fail_kv_writes {
            return Err(EdgeApiError::Transient {
                message: "injected bulk write failure".into(),
            });
        }
        let namespace = state
            .namespaces
            .iter_mut()
            .find(|ns| ns.id == namespace_id)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("kv namespace {namespace_id}"),
            })?;
        for pair in pairs {
            namespace.data.insert(pair.key.clone(), pair.value.clone());
        }
        Ok(())
    }

    async fn delete_kv_keys(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<(), EdgeApiError> {
        if keys.len() > BULK_WRITE_LIMIT {
            return Err(EdgeApiError::Malformed {
                message: format!("bulk delete of {} keys exceeds the limit", keys.len()),
            });
        }
        let mut state = self.state.lock().await;
        state.counts.kv_deletes += 1;
        if state.fail_kv_deletes {
            return Err(EdgeApiError::Transient {
                message: "injected bulk delete failure".into(),
            });
        }
        let namespace = state
            .namespaces
            .iter_mut()
            .find(|ns| ns.id == namespace_id)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("kv namespace {namespace_id}"),
            })?;
        for key in keys {
            namespace.data.remove(key);
        }
        Ok(())
    }

    async fn read_kv_values(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, EdgeApiError> {
        if keys.len() > BULK_READ_LIMIT {
            return Err(EdgeApiError::Malformed {
                message: format!("bulk read of {} keys exceeds the limit", keys.len()),
            });
        }
        let mut state = self.state.lock().await;
        state.counts.kv_reads += 1;
        let namespace = state
            .namespaces
            .iter()
            .find(|ns| ns.id == namespace_id)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("kv namespace {namespace_id}"),
            })?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                namespace
                    .data
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect())
    }

    async fn list_kv_keys(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.kv_key_lists += 1;
        // An unconfigured page size means the production default.
        let page_size = if state.key_page_size == 0 { 1000 } else { state.key_page_size };
        let namespace = state
            .namespaces
            .iter()
            .find(|ns| ns.id == namespace_id)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("kv namespace {namespace_id}"),
            })?;
        let mut keys: Vec<String> = namespace.data.keys().cloned().collect();
        keys.sort();
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page: Vec<String> = keys.iter().skip(offset).take(page_size).cloned().collect();
        let next = if offset + page.len() < keys.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok((page, next))
    }

    async fn upload_worker(&self, upload: &WorkerUpload) -> Result<String, EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.worker_uploads += 1;
        state
            .workers
            .insert(upload.script_name.clone(), upload.script.clone());
        Ok(upload.script_name.clone())
    }

    async fn delete_worker(&self, script_name: &str) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        if state.workers.remove(script_name).is_none() {
            return Err(EdgeApiError::NotFound {
                resource: format!("worker script {script_name}"),
            });
        }
        Ok(())
    }

    async fn list_worker_routes(&self, zone_id: &str) -> Result<Vec<WorkerRoute>, EdgeApiError> {
        let state = self.state.lock().await;
        Ok(state
            .routes
            .get(zone_id)
            .map(|routes| {
                routes
                    .iter()
                    .map(|r| WorkerRoute {
                        id: r.id.clone(),
                        pattern: r.pattern.clone(),
                        script: Some(r.script.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_worker_route(
        &self,
        zone_id: &str,
        pattern: &str,
        script: &str,
        fail_open: bool,
    ) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.route_creates += 1;
        let id = next_id(&mut state, "route");
        state.routes.entry(zone_id.to_string()).or_default().push(RouteRecord {
            id,
            pattern: pattern.to_string(),
            script: script.to_string(),
            fail_open,
        });
        Ok(())
    }

    async fn delete_worker_route(
        &self,
        zone_id: &str,
        route_id: &str,
    ) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        let routes = state.routes.get_mut(zone_id).ok_or_else(|| EdgeApiError::NotFound {
            resource: format!("zone {zone_id}"),
        })?;
        let before = routes.len();
        routes.retain(|r| r.id != route_id);
        if routes.len() == before {
            return Err(EdgeApiError::NotFound {
                resource: format!("worker route {route_id}"),
            });
        }
        Ok(())
    }

    async fn create_turnstile_widget(
        &self,
        name: &str,
        domains: &[String],
        mode: &str,
    ) -> Result<TurnstileWidget, EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.widget_creates += 1;
        let site_key = next_id(&mut state, "sitekey");
        let secret = format!("{site_key}-secret-0");
        state.widgets.push(WidgetRecord {
            site_key: site_key.clone(),
            name: name.to_string(),
            domains: domains.to_vec(),
            mode: mode.to_string(),
            secret: secret.clone(),
            rotations: 0,
        });
        Ok(TurnstileWidget {
            sitekey: site_key,
            secret,
            name: name.to_string(),
            domains: domains.to_vec(),
            mode: mode.to_string(),
        })
    }

    async fn list_turnstile_widgets(&self) -> Result<Vec<TurnstileWidget>, EdgeApiError> {
        let state = self.state.lock().await;
        Ok(state
            .widgets
            .iter()
            .map(|w| TurnstileWidget {
                sitekey: w.site_key.clone(),
                secret: w.secret.clone(),
                name: w.name.clone(),
                domains: w.domains.clone(),
                mode: w.mode.clone(),
            })
            .collect())
    }

    async fn rotate_turnstile_widget(
        &self,
        site_key: &str,
        _invalidate_immediately: bool,
    ) -> Result<String, EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.widget_rotations += 1;
        let widget = state
            .widgets
            .iter_mut()
            .find(|w| w.site_key == site_key)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("turnstile widget {site_key}"),
            })?;
        widget.rotations += 1;
        widget.secret = format!("{site_key}-secret-{}", widget.rotations);
        Ok(widget.secret.clone())
    }

    async fn delete_turnstile_widget(&self, site_key: &str) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        let before = state.widgets.len();
        state.widgets.retain(|w| w.site_key != site_key);
        if state.widgets.len() == before {
            return Err(EdgeApiError::NotFound {
                resource: format!("turnstile widget {site_key}"),
            });
        }
        Ok(())
    }

    async fn create_d1_database(&self, name: &str) -> Result<String, EdgeApiError> {
        let mut state = self.state.lock().await;
        if state.deny_d1 {
            return Err(EdgeApiError::Auth {
                message: "token lacks D1 permission".into(),
            });
        }
        let uuid = next_id(&mut state, "db");
        state.databases.push(DatabaseRecord {
            uuid: uuid.clone(),
            name: name.to_string(),
            rows: Vec::new(),
        });
        Ok(uuid)
    }

    async fn list_d1_databases(&self) -> Result<Vec<D1Database>, EdgeApiError> {
        let state = self.state.lock().await;
        if state.deny_d1 {
            return Err(EdgeApiError::Auth {
                message: "token lacks D1 permission".into(),
            });
        }
        Ok(state
            .databases
            .iter()
            .map(|db| D1Database {
                uuid: db.uuid.clone(),
                name: db.name.clone(),
            })
            .collect())
    }

    async fn query_d1_database(
        &self,
        database_id: &str,
        sql: &str,
        _params: &[String],
    ) -> Result<Vec<D1QueryResult>, EdgeApiError> {
        let mut state = self.state.lock().await;
        state.counts.d1_queries += 1;
        let database = state
            .databases
            .iter()
            .find(|db| db.uuid == database_id)
            .ok_or_else(|| EdgeApiError::NotFound {
                resource: format!("d1 database {database_id}"),
            })?;
        if sql.trim_start().to_lowercase().starts_with("select") {
            Ok(vec![D1QueryResult {
                success: true,
                results: database.rows.clone(),
            }])
        } else {
            Ok(vec![D1QueryResult {
                success: true,
                results: Vec::new(),
            }])
        }
    }

    async fn delete_d1_database(&self, database_id: &str) -> Result<(), EdgeApiError> {
        let mut state = self.state.lock().await;
        let before = state.databases.len();
        state.databases.retain(|db| db.uuid != database_id);
        if state.databases.len() == before {
            return Err(EdgeApiError::NotFound {
                resource: format!("d1 database {database_id}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bulk_limits_are_enforced() {
        let api = DeterministicEdgeApi::default();
        let ns = api.create_kv_namespace("test").await.unwrap();

        let oversized: Vec<KvPair> = (0..=BULK_WRITE_LIMIT)
            .map(|i| KvPair::new(i.to_string(), "ban"))
            .collect();
        assert!(api.write_kv_pairs(&ns, &oversized).await.is_err());

        let oversized_read: Vec<String> = (0..=BULK_READ_LIMIT).map(|i| i.to_string()).collect();
        assert!(api.read_kv_values(&ns, &oversized_read).await.is_err());
    }

    #[tokio::test]
    async fn key_listing_paginates_in_sorted_order() {
        let api = DeterministicEdgeApi::default();
        api.set_key_page_size(2).await;
        let ns = api.create_kv_namespace("test").await.unwrap();
        let pairs: Vec<KvPair> = ["c", "a", "b", "d", "e"]
            .iter()
            .map(|k| KvPair::new(*k, "ban"))
            .collect();
        api.write_kv_pairs(&ns, &pairs).await.unwrap();

        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = api.list_kv_keys(&ns, cursor.as_deref()).await.unwrap();
            all.extend(page);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(all, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn rotation_changes_secret_and_keeps_site_key() {
        let api = DeterministicEdgeApi::default();
        let widget = api
            .create_turnstile_widget("w", &["example.com".into()], "managed")
            .await
            .unwrap();
        let s1 = api.rotate_turnstile_widget(&widget.sitekey, true).await.unwrap();
        let s2 = api.rotate_turnstile_widget(&widget.sitekey, true).await.unwrap();
        assert_ne!(widget.secret, s1);
        assert_ne!(s1, s2);
        assert_eq!(api.widget_secret(&widget.sitekey).await.unwrap(), s2);
    }

    #[tokio::test]
    async fn missing_resources_surface_not_found() {
        let api = DeterministicEdgeApi::default();
        assert!(api.delete_worker("absent").await.unwrap_err().is_not_found());
        assert!(api
            .delete_kv_namespace("absent")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
