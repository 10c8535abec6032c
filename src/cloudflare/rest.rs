//! Live implementation of [`EdgeApi`] against the Cloudflare v4 REST API.
//!
//! Every request carries `Authorization: Bearer <token>` and increments the
//! per-account API-call counter regardless of outcome. Status codes are
//! classified into the [`EdgeApiError`] taxonomy; nothing is retried here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::trace;

use crate::cloudflare::api::{EdgeApi, EdgeApiError};
use crate::cloudflare::types::{
    Account, ApiEnvelope, D1Database, D1QueryResult, KvKey, KvNamespace, KvPair, TurnstileWidget,
    WorkerRoute, WorkerUpload, Zone,
};
use crate::metrics;

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Account-scoped REST client.
pub struct RestEdgeApi {
    http: reqwest::Client,
    base: String,
    token: String,
    account_id: String,
    account_name: String,
}

impl RestEdgeApi {
    pub fn new(
        token: impl Into<String>,
        account_id: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Result<Self, EdgeApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token, account_id, account_name)
    }

    /// Client bound to a token only, for account/zone discovery before any
    /// account is configured.
    pub fn for_token(token: impl Into<String>) -> Result<Self, EdgeApiError> {
        Self::new(token, "", "")
    }

    pub fn with_base_url(
        base: impl Into<String>,
        token: impl Into<String>,
        account_id: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Result<Self, EdgeApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EdgeApiError::Transient {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            account_id: account_id.into(),
            account_name: account_name.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn account_url(&self, suffix: &str) -> String {
        format!("{}/accounts/{}{}", self.base, self.account_id, suffix)
    }

    /// Send a prepared request. The API-call counter covers every attempt,
    /// including ones that fail in transport.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<(StatusCode, String), EdgeApiError> {
        metrics::CLOUDFLARE_API_CALLS
            .with_label_values(&[&self.account_name])
            .inc();
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| EdgeApiError::Transient {
                message: format!("{resource}: {e}"),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| EdgeApiError::Transient {
            message: format!("{resource}: reading response body: {e}"),
        })?;
        trace!(resource, status = %status, "api call completed");
        if status.is_success() {
            return Ok((status, body));
        }
        Err(classify(status, resource, &body))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<T, EdgeApiError> {
        let (_, body) = self.send(request, resource).await?;
        parse_envelope(&body, resource)
    }

    /// Like [`Self::call`] but keeps the pagination cursor.
    async fn call_with_cursor<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<(T, Option<String>), EdgeApiError> {
        let (_, body) = self.send(request, resource).await?;
        let envelope: ApiEnvelope<T> =
            serde_json::from_str(&body).map_err(|e| EdgeApiError::Malformed {
                message: format!("{resource}: undecodable response: {e}"),
            })?;
        let result = envelope_result(envelope.success, envelope.result, &envelope.errors, resource)?;
        let cursor = envelope
            .result_info
            .and_then(|info| info.cursor)
            .filter(|cursor| !cursor.is_empty());
        Ok((result, cursor))
    }
}

fn classify(status: StatusCode, resource: &str, body: &str) -> EdgeApiError {
    let message = format!("{resource}: {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EdgeApiError::Auth { message },
        StatusCode::NOT_FOUND => EdgeApiError::NotFound {
            resource: resource.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => EdgeApiError::Quota { message },
        status if status.is_client_error() => EdgeApiError::Malformed { message },
        _ => EdgeApiError::Transient { message },
    }
}

fn parse_envelope<T: DeserializeOwned>(body: &str, resource: &str) -> Result<T, EdgeApiError> {
    let envelope: ApiEnvelope<T> =
        serde_json::from_str(body).map_err(|e| EdgeApiError::Malformed {
            message: format!("{resource}: undecodable response: {e}"),
        })?;
    envelope_result(envelope.success, envelope.result, &envelope.errors, resource)
}

fn envelope_result<T>(
    success: bool,
    result: Option<T>,
    errors: &[crate::cloudflare::types::ApiMessage],
    resource: &str,
) -> Result<T, EdgeApiError> {
    if !success {
        let detail = errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EdgeApiError::Malformed {
            message: format!("{resource}: API reported failure: {detail}"),
        });
    }
    result.ok_or_else(|| EdgeApiError::Malformed {
        message: format!("{resource}: API success without a result"),
    })
}

#[async_trait]
impl EdgeApi for RestEdgeApi {
    async fn list_accounts(&self) -> Result<Vec<Account>, EdgeApiError> {
        self.call(self.http.get(self.url("/accounts")), "accounts")
            .await
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, EdgeApiError> {
        let mut zones: Vec<Zone> = Vec::new();
        let mut page = 1u32;
        loop {
            let request = self
                .http
                .get(self.url("/zones"))
                .query(&[("page", page.to_string()), ("per_page", "50".to_string())]);
            let batch: Vec<Zone> = self.call(request, "zones").await?;
            let done = batch.len() < 50;
            zones.extend(batch);
            if done {
                return Ok(zones);
            }
            page += 1;
        }
    }

    async fn create_kv_namespace(&self, title: &str) -> Result<String, EdgeApiError> {
        let namespace: KvNamespace = self
            .call(
                self.http
                    .post(self.account_url("/storage/kv/namespaces"))
                    .json(&json!({ "title": title })),
                "kv namespace",
            )
            .await?;
        Ok(namespace.id)
    }

    async fn list_kv_namespaces(&self) -> Result<Vec<KvNamespace>, EdgeApiError> {
        self.call(
            self.http.get(self.account_url("/storage/kv/namespaces")),
            "kv namespaces",
        )
        .await
    }

    async fn delete_kv_namespace(&self, namespace_id: &str) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.account_url(&format!("/storage/kv/namespaces/{namespace_id}"))),
            "kv namespace",
        )
        .await?;
        Ok(())
    }

    async fn write_kv_pairs(
        &self,
        namespace_id: &str,
        pairs: &[KvPair],
    ) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .put(self.account_url(&format!("/storage/kv/namespaces/{namespace_id}/bulk")))
                .json(pairs),
            "kv bulk write",
        )
        .await?;
        Ok(())
    }

    async fn delete_kv_keys(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.account_url(&format!("/storage/kv/namespaces/{namespace_id}/bulk")))
                .json(keys),
            "kv bulk delete",
        )
        .await?;
        Ok(())
    }

    async fn read_kv_values(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, EdgeApiError> {
        #[derive(serde::Deserialize)]
        struct BulkGetResult {
            #[serde(default)]
            values: HashMap<String, String>,
        }
        let result: BulkGetResult = self
            .call(
                self.http
                    .post(self.account_url(&format!(
                        "/storage/kv/namespaces/{namespace_id}/bulk/get"
                    )))
                    .json(&json!({ "keys": keys })),
                "kv bulk read",
            )
            .await?;
        Ok(result.values)
    }

    async fn list_kv_keys(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), EdgeApiError> {
        let mut request = self
            .http
            .get(self.account_url(&format!("/storage/kv/namespaces/{namespace_id}/keys")));
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let (keys, next): (Vec<KvKey>, Option<String>) =
            self.call_with_cursor(request, "kv keys").await?;
        Ok((keys.into_iter().map(|k| k.name).collect(), next))
    }

    async fn upload_worker(&self, upload: &WorkerUpload) -> Result<String, EdgeApiError> {
        let mut bindings = vec![
            json!({
                "type": "kv_namespace",
                "name": "KV_NAMESPACE",
                "namespace_id": upload.kv_namespace_id,
            }),
            json!({
                "type": "plain_text",
                "name": "ACTIONS_BY_DOMAIN",
                "text": upload.actions_by_domain,
            }),
        ];
        if let Some(database_id) = &upload.d1_database_id {
            bindings.push(json!({
                "type": "d1",
                "name": "METRICS_DB",
                "id": database_id,
            }));
        }
        for (name, text) in &upload.extra_vars {
            bindings.push(json!({ "type": "plain_text", "name": name, "text": text }));
        }
        let metadata = json!({
            "main_module": "worker.js",
            "bindings": bindings,
            "compatibility_date": "2024-01-01",
        });

        let form = multipart::Form::new()
            .part(
                "metadata",
                multipart::Part::text(metadata.to_string()).mime_str("application/json").map_err(
                    |e| EdgeApiError::Malformed {
                        message: format!("worker metadata: {e}"),
                    },
                )?,
            )
            .part(
                "worker.js",
                multipart::Part::text(upload.script.clone())
                    .file_name("worker.js")
                    .mime_str("application/javascript+module")
                    .map_err(|e| EdgeApiError::Malformed {
                        message: format!("worker script: {e}"),
                    })?,
            );

        #[derive(serde::Deserialize)]
        struct UploadedWorker {
            #[serde(default)]
            id: Option<String>,
        }
        let uploaded: UploadedWorker = self
            .call(
                self.http
                    .put(self.account_url(&format!("/workers/scripts/{}", upload.script_name)))
                    .multipart(form),
                "worker upload",
            )
            .await?;
        Ok(uploaded.id.unwrap_or_else(|| upload.script_name.clone()))
    }

    async fn delete_worker(&self, script_name: &str) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.account_url(&format!("/workers/scripts/{script_name}"))),
            "worker script",
        )
        .await?;
        Ok(())
    }

    async fn list_worker_routes(&self, zone_id: &str) -> Result<Vec<WorkerRoute>, EdgeApiError> {
        self.call(
            self.http
                .get(self.url(&format!("/zones/{zone_id}/workers/routes"))),
            "worker routes",
        )
        .await
    }

    async fn create_worker_route(
        &self,
        zone_id: &str,
        pattern: &str,
        script: &str,
        fail_open: bool,
    ) -> Result<(), EdgeApiError> {
        // request_limit_fail_open is carried on the raw payload; upstream
        // SDKs mostly do not expose it.
        let mut payload = json!({ "pattern": pattern, "script": script });
        if fail_open {
            payload["request_limit_fail_open"] = json!(true);
        }
        self.send(
            self.http
                .post(self.url(&format!("/zones/{zone_id}/workers/routes")))
                .json(&payload),
            "worker route",
        )
        .await?;
        Ok(())
    }

    async fn delete_worker_route(
        &self,
        zone_id: &str,
        route_id: &str,
    ) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.url(&format!("/zones/{zone_id}/workers/routes/{route_id}"))),
            "worker route",
        )
        .await?;
        Ok(())
    }

    async fn create_turnstile_widget(
        &self,
        name: &str,
        domains: &[String],
        mode: &str,
    ) -> Result<TurnstileWidget, EdgeApiError> {
        self.call(
            self.http
                .post(self.account_url("/challenges/widgets"))
                .json(&json!({ "name": name, "domains": domains, "mode": mode })),
            "turnstile widget",
        )
        .await
    }

    async fn list_turnstile_widgets(&self) -> Result<Vec<TurnstileWidget>, EdgeApiError> {
        self.call(
            self.http.get(self.account_url("/challenges/widgets")),
            "turnstile widgets",
        )
        .await
    }

    async fn rotate_turnstile_widget(
        &self,
        site_key: &str,
        invalidate_immediately: bool,
    ) -> Result<String, EdgeApiError> {
        #[derive(serde::Deserialize)]
        struct Rotated {
            secret: String,
        }
        let rotated: Rotated = self
            .call(
                self.http
                    .post(self.account_url(&format!(
                        "/challenges/widgets/{site_key}/rotate_secret"
                    )))
                    .json(&json!({ "invalidate_immediately": invalidate_immediately })),
                "turnstile rotation",
            )
            .await?;
        Ok(rotated.secret)
    }

    async fn delete_turnstile_widget(&self, site_key: &str) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.account_url(&format!("/challenges/widgets/{site_key}"))),
            "turnstile widget",
        )
        .await?;
        Ok(())
    }

    async fn create_d1_database(&self, name: &str) -> Result<String, EdgeApiError> {
        let database: D1Database = self
            .call(
                self.http
                    .post(self.account_url("/d1/database"))
                    .json(&json!({ "name": name })),
                "d1 database",
            )
            .await?;
        Ok(database.uuid)
    }

    async fn list_d1_databases(&self) -> Result<Vec<D1Database>, EdgeApiError> {
        self.call(self.http.get(self.account_url("/d1/database")), "d1 databases")
            .await
    }

    async fn query_d1_database(
        &self,
        database_id: &str,
        sql: &str,
        params: &[String],
    ) -> Result<Vec<D1QueryResult>, EdgeApiError> {
        self.call(
            self.http
                .post(self.account_url(&format!("/d1/database/{database_id}/query")))
                .json(&json!({ "sql": sql, "params": params })),
            "d1 query",
        )
        .await
    }

    async fn delete_d1_database(&self, database_id: &str) -> Result<(), EdgeApiError> {
        self.send(
            self.http
                .delete(self.account_url(&format!("/d1/database/{database_id}"))),
            "d1 database",
        )
        .await?;
        Ok(())
    }
}
