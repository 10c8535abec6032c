//! Top-level orchestration.
//!
//! Drives the account managers through their lifecycle: teardown of stale
//! resources, fresh provisioning, the long-lived reconciliation loop fed by
//! the LAPI stream, Turnstile handling, metrics reporting and the optional
//! Prometheus endpoint. A single cancellation token roots every child task;
//! teardown itself runs after cancellation so a shutdown signal cannot
//! interrupt cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cloudflare::rest::RestEdgeApi;
use crate::cloudflare::types::WorkerSettings;
use crate::cloudflare::AccountManager;
use crate::config::{BouncerConfig, PRODUCT_NAME};
use crate::decision::{self, DecisionBatch};
use crate::lapi::{self, LapiClient, StreamResponse};
use crate::metrics;

/// Crate version, reported in user agents and usage metrics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often edge metrics are refreshed and pushed upstream.
const METRICS_PUSH_INTERVAL: Duration = Duration::from_secs(900);

/// Operating mode selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Provision and run the reconciliation loop until cancelled.
    Daemon,
    /// Provision the infrastructure and exit.
    SetupOnly,
    /// Provision for the autonomous edge variant and exit.
    SetupAutonomous,
    /// Tear down everything previously provisioned and exit.
    DeleteOnly,
}

/// Worker settings for the selected mode. The autonomous variant binds the
/// LAPI credentials into the worker so it can pull decisions itself.
pub fn worker_settings(config: &BouncerConfig, mode: RunMode) -> WorkerSettings {
    let mut settings = WorkerSettings::default();
    if mode == RunMode::SetupAutonomous {
        settings.extra_bindings.insert(
            "LAPI_URL".to_string(),
            config.crowdsec_config.lapi_url.clone(),
        );
        settings.extra_bindings.insert(
            "LAPI_KEY".to_string(),
            config.crowdsec_config.lapi_key.clone(),
        );
        settings.extra_bindings.insert(
            "UPDATE_FREQUENCY_SECONDS".to_string(),
            config.crowdsec_config.update_frequency.as_secs().to_string(),
        );
    }
    settings
}

/// Build one manager per configured account, each with its own
/// account-scoped REST client.
async fn build_managers(
    config: &BouncerConfig,
    settings: &WorkerSettings,
) -> anyhow::Result<Vec<AccountManager>> {
    let mut managers = Vec::with_capacity(config.cloudflare_config.accounts.len());
    for account in &config.cloudflare_config.accounts {
        let api = Arc::new(
            RestEdgeApi::new(&account.token, &account.id, &account.name)
                .with_context(|| format!("building API client for account {}", account.name))?,
        );
        let manager = AccountManager::new(api, account.clone(), settings.clone())
            .await
            .with_context(|| format!("unable to create manager for account {}", account.name))?;
        managers.push(manager);
    }
    Ok(managers)
}

/// Entry point for every mode past config validation.
pub async fn run(config: BouncerConfig, mode: RunMode) -> anyhow::Result<()> {
    let settings = worker_settings(&config, mode);
    let managers = build_managers(&config, &settings).await?;
    let managers = provision_all(managers, mode).await?;

    if mode == RunMode::DeleteOnly {
        info!("deleted all provisioned infrastructure");
        return Ok(());
    }
    info!("successfully deployed infra for all accounts");
    if matches!(mode, RunMode::SetupOnly | RunMode::SetupAutonomous) {
        return Ok(());
    }

    run_daemon(config, managers).await
}

/// Per-account startup lifecycle, concurrently: purge whatever a previous
/// run left behind, then provision fresh (unless we are only deleting).
async fn provision_all(
    managers: Vec<AccountManager>,
    mode: RunMode,
) -> anyhow::Result<Vec<AccountManager>> {
    let mut tasks = JoinSet::new();
    for mut manager in managers {
        let delete_only = mode == RunMode::DeleteOnly;
        tasks.spawn(async move {
            let account = manager.account.name.clone();
            manager
                .clean_up_existing_workers(true)
                .await
                .with_context(|| format!("unable to clean up existing workers for account {account}"))?;
            if !delete_only {
                manager
                    .deploy_infra()
                    .await
                    .with_context(|| format!("unable to deploy infra for account {account}"))?;
                info!(account = %account, "successfully deployed infra");
            }
            Ok::<_, anyhow::Error>(manager)
        });
    }

    let mut provisioned = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        provisioned.push(joined.context("provisioning task panicked")??);
    }
    Ok(provisioned)
}

async fn run_daemon(config: BouncerConfig, managers: Vec<AccountManager>) -> anyhow::Result<()> {
    let lapi = Arc::new(LapiClient::new(
        &config.crowdsec_config,
        format!("{PRODUCT_NAME}/v{VERSION}"),
    )?);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut side_tasks = JoinSet::new();

    // Turnstile handlers are built before the managers go behind their
    // locks; they share the API client but own their widget state.
    for manager in &managers {
        let handler = manager.turnstile_handler();
        let account = manager.account.name.clone();
        let cancel = cancel.clone();
        side_tasks.spawn(async move {
            if let Err(err) = handler.run(cancel).await {
                error!(account = %account, error = %err, "unable to handle turnstile");
            }
        });
    }

    let managers: Vec<Arc<Mutex<AccountManager>>> = managers
        .into_iter()
        .map(|manager| Arc::new(Mutex::new(manager)))
        .collect();

    side_tasks.spawn(metrics_reporter(
        lapi.clone(),
        managers.clone(),
        cancel.clone(),
    ));

    if config.prometheus.enabled {
        let addr: SocketAddr = format!(
            "{}:{}",
            config.prometheus.listen_addr, config.prometheus.listen_port
        )
        .parse()
        .context("invalid prometheus listen address")?;
        side_tasks.spawn(serve_metrics(addr, managers.clone(), cancel.clone()));
    }

    let result = stream_loop(&config, &lapi, &managers, &cancel).await;

    // Drain children, then tear down on a fresh scope so cancellation
    // cannot interfere with cleanup.
    cancel.cancel();
    while side_tasks.join_next().await.is_some() {}
    teardown(&managers).await;
    result
}

/// Consume the decision stream until cancelled. The first fetch requests the
/// full snapshot; every later one is an incremental diff, and that never
/// reverts. Fetch errors wait for the next tick; there is no extra backoff.
async fn stream_loop(
    config: &BouncerConfig,
    lapi: &LapiClient,
    managers: &[Arc<Mutex<AccountManager>>],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(config.crowdsec_config.update_frequency);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut startup = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("cancellation received, stopping the decision stream");
                return Ok(());
            }
            _ = ticker.tick() => {
                match lapi.fetch_decisions(startup).await {
                    Ok(StreamResponse::Decisions(batch)) => {
                        startup = false;
                        dispatch(managers, batch).await;
                    }
                    Ok(StreamResponse::Empty) => {
                        startup = false;
                        info!("no decisions exist upstream, purging decision keys everywhere");
                        reset_all(managers).await;
                    }
                    Err(err) => {
                        error!(error = %err, "unable to fetch the decision stream");
                    }
                }
            }
        }
    }
}

/// Normalize one batch and fan it out to every account in parallel. A
/// failing account is logged and advised to restart; its peers proceed.
async fn dispatch(managers: &[Arc<Mutex<AccountManager>>], batch: DecisionBatch) {
    let deleted = Arc::new(decision::normalize(&batch.deleted));
    let new = Arc::new(decision::normalize(&batch.new));
    if !deleted.is_empty() {
        info!(count = deleted.len(), "received deleted decisions");
    }
    if !new.is_empty() {
        info!(count = new.len(), "received new decisions");
    }
    if deleted.is_empty() && new.is_empty() {
        return;
    }

    let mut tasks = JoinSet::new();
    for manager in managers {
        let manager = manager.clone();
        let deleted = deleted.clone();
        let new = new.clone();
        tasks.spawn(async move {
            let mut manager = manager.lock().await;
            if let Err(err) = manager.apply_batch(&deleted, &new).await {
                error!(
                    account = %manager.account.name,
                    error = %err,
                    "unable to process decisions; the in-memory cache is now likely out of sync and the bouncer needs a restart"
                );
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// The 204 path: purge every account's decision keys, keeping templates.
async fn reset_all(managers: &[Arc<Mutex<AccountManager>>]) {
    let mut tasks = JoinSet::new();
    for manager in managers {
        let manager = manager.clone();
        tasks.spawn(async move {
            let mut manager = manager.lock().await;
            if let Err(err) = manager.reset_decision_keys().await {
                error!(
                    account = %manager.account.name,
                    error = %err,
                    "unable to purge decision keys; the in-memory cache is now likely out of sync and the bouncer needs a restart"
                );
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Best-effort teardown of every account's resources, in parallel.
async fn teardown(managers: &[Arc<Mutex<AccountManager>>]) {
    info!("tearing down provisioned infrastructure");
    let mut tasks = JoinSet::new();
    for manager in managers {
        let manager = manager.clone();
        tasks.spawn(async move {
            let mut manager = manager.lock().await;
            if let Err(err) = manager.clean_up_existing_workers(false).await {
                error!(account = %manager.account.name, error = %err, "teardown failed");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Periodically refresh the edge-side gauges and push the usage document
/// upstream.
async fn metrics_reporter(
    lapi: Arc<LapiClient>,
    managers: Vec<Arc<Mutex<AccountManager>>>,
    cancel: CancellationToken,
) {
    let startup_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + METRICS_PUSH_INTERVAL,
        METRICS_PUSH_INTERVAL,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stopping the metrics reporter");
                return;
            }
            _ = ticker.tick() => {
                refresh_all(&managers).await;
                let payload = lapi::build_usage_payload(VERSION, startup_timestamp, METRICS_PUSH_INTERVAL);
                if let Err(err) = lapi.push_usage_metrics(&payload).await {
                    error!(error = %err, "unable to push usage metrics");
                }
            }
        }
    }
}

async fn refresh_all(managers: &[Arc<Mutex<AccountManager>>]) {
    for manager in managers {
        let manager = manager.lock().await;
        if let Err(err) = manager.refresh_usage_metrics().await {
            error!(account = %manager.account.name, error = %err, "unable to refresh usage metrics");
        }
    }
}

/// Prometheus exposition endpoint. Gauges backed by the metrics database are
/// refreshed on every scrape.
async fn serve_metrics(
    addr: SocketAddr,
    managers: Vec<Arc<Mutex<AccountManager>>>,
    cancel: CancellationToken,
) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(managers);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "unable to bind the metrics endpoint");
            return;
        }
    };
    info!(addr = %addr, "serving prometheus metrics");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        error!(error = %err, "metrics endpoint failed");
    }
}

async fn metrics_handler(
    State(managers): State<Vec<Arc<Mutex<AccountManager>>>>,
) -> axum::response::Response {
    refresh_all(&managers).await;
    match metrics::render() {
        Ok(body) => (axum::http::StatusCode::OK, body).into_response(),
        Err(err) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
            .into_response(),
    }
}

/// Cancel the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(err) => {
                        error!(error = %err, "unable to install the SIGTERM handler");
                        if tokio::signal::ctrl_c().await.is_ok() {
                            warn!("received SIGINT");
                        }
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => warn!("received SIGINT"),
                _ = term.recv() => warn!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received SIGINT");
            }
        }
        cancel.cancel();
    });
}
