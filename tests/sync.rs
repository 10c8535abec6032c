//! End-to-end reconciliation scenarios over the deterministic in-memory
//! Cloudflare implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crowdsec_cloudflare_worker_bouncer::cloudflare::api::EdgeApi;
use crowdsec_cloudflare_worker_bouncer::cloudflare::inmemory::DeterministicEdgeApi;
use crowdsec_cloudflare_worker_bouncer::cloudflare::types::{
    KvPair, WorkerSettings, Zone, BAN_TEMPLATE_KEY, IP_RANGES_KEY, RESET_KEY,
    TURNSTILE_CONFIG_KEY, WARMED_UP_KEY,
};
use crowdsec_cloudflare_worker_bouncer::cloudflare::{read_values_chunked, AccountManager};
use crowdsec_cloudflare_worker_bouncer::config::{AccountConfig, TurnstileConfig, ZoneConfig};
use crowdsec_cloudflare_worker_bouncer::decision::{normalize, RawDecision};

fn raw(scope: &str, remediation: &str, value: &str) -> RawDecision {
    RawDecision {
        origin: Some("crowdsec".into()),
        scenario: Some("crowdsecurity/http-probing".into()),
        scope: Some(scope.into()),
        remediation: Some(remediation.into()),
        value: Some(value.into()),
        duration: Some("4h".into()),
        until: None,
    }
}

fn zone_config(turnstile: bool) -> ZoneConfig {
    ZoneConfig {
        zone_id: "z1".into(),
        actions: if turnstile {
            vec!["ban".into(), "captcha".into()]
        } else {
            vec!["ban".into()]
        },
        default_action: "ban".into(),
        routes_to_protect: vec!["*example.com/*".into()],
        turnstile: TurnstileConfig {
            enabled: turnstile,
            rotate_secret_key: turnstile,
            rotate_secret_key_every: Duration::from_secs(60),
            mode: "managed".into(),
        },
        fail_open: false,
        domain: String::new(),
    }
}

async fn provisioned(turnstile: bool) -> (Arc<DeterministicEdgeApi>, AccountManager) {
    let api = DeterministicEdgeApi::with_zones(vec![Zone {
        id: "z1".into(),
        name: "example.com".into(),
        account: None,
    }])
    .await;
    let account = AccountConfig {
        id: "acc1".into(),
        token: "tok".into(),
        name: format!("sync-{}", rand_suffix()),
        ban_template: String::new(),
        zones: vec![zone_config(turnstile)],
    };
    let mut manager = AccountManager::new(api.clone(), account, WorkerSettings::default())
        .await
        .unwrap();
    manager.deploy_infra().await.unwrap();
    (api, manager)
}

/// Distinct account label per test; the Prometheus registry is process-wide.
fn rand_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed).to_string()
}

async fn apply(
    manager: &mut AccountManager,
    deleted: &[RawDecision],
    new: &[RawDecision],
) -> anyhow::Result<()> {
    manager.apply_batch(&normalize(deleted), &normalize(new)).await
}

#[tokio::test]
async fn first_sync_projects_every_scope() {
    let (api, mut manager) = provisioned(false).await;
    apply(
        &mut manager,
        &[],
        &[
            raw("ip", "ban", "1.2.3.4"),
            raw("range", "captcha", "10.0.0.0/8"),
            raw("as", "ban", "64500"),
            raw("country", "captcha", "CN"),
        ],
    )
    .await
    .unwrap();

    let data = api.namespace_data(manager.namespace_id()).await;
    assert_eq!(data.get("1.2.3.4").map(String::as_str), Some("ban"));
    assert_eq!(data.get("64500").map(String::as_str), Some("ban"));
    assert_eq!(data.get("cn").map(String::as_str), Some("captcha"));
    assert_eq!(
        data.get(IP_RANGES_KEY).map(String::as_str),
        Some(r#"{"10.0.0.0/8":"captcha"}"#)
    );
    assert_eq!(data.get(WARMED_UP_KEY).map(String::as_str), Some("true"));
    // Provisioning left the ban template in place.
    assert_eq!(
        data.get(BAN_TEMPLATE_KEY).map(String::as_str),
        Some("Access Denied")
    );
}

#[tokio::test]
async fn churn_on_the_same_ip_ends_with_the_addition() {
    let (api, mut manager) = provisioned(false).await;
    apply(&mut manager, &[], &[raw("ip", "ban", "1.2.3.4")])
        .await
        .unwrap();
    apply(
        &mut manager,
        &[raw("ip", "ban", "1.2.3.4")],
        &[raw("ip", "captcha", "1.2.3.4")],
    )
    .await
    .unwrap();
    let data = api.namespace_data(manager.namespace_id()).await;
    assert_eq!(data.get("1.2.3.4").map(String::as_str), Some("captcha"));
}

#[tokio::test]
async fn deletion_of_a_stale_remediation_is_skipped() {
    let (api, mut manager) = provisioned(false).await;
    apply(&mut manager, &[], &[raw("ip", "captcha", "1.2.3.4")])
        .await
        .unwrap();

    let before = api.call_counts().await;
    apply(&mut manager, &[raw("ip", "ban", "1.2.3.4")], &[])
        .await
        .unwrap();
    let after = api.call_counts().await;

    let data = api.namespace_data(manager.namespace_id()).await;
    assert_eq!(data.get("1.2.3.4").map(String::as_str), Some("captcha"));
    assert_eq!(before.kv_deletes, after.kv_deletes, "no delete call issued");
}

#[tokio::test]
async fn identical_range_document_is_not_rewritten() {
    let (api, mut manager) = provisioned(false).await;
    apply(&mut manager, &[], &[raw("range", "ban", "10.0.0.0/8")])
        .await
        .unwrap();

    let before = api.call_counts().await;
    apply(&mut manager, &[], &[raw("range", "ban", "10.0.0.0/8")])
        .await
        .unwrap();
    let after = api.call_counts().await;
    assert_eq!(before.kv_writes, after.kv_writes, "no write issued at all");
}

#[tokio::test]
async fn reset_preserves_templates_and_clears_the_sentinel() {
    let (api, mut manager) = provisioned(false).await;
    apply(
        &mut manager,
        &[],
        &[raw("ip", "ban", "1.2.3.4"), raw("range", "ban", "10.0.0.0/8")],
    )
    .await
    .unwrap();
    // The rotator would normally have published this document.
    api.write_kv_pairs(
        manager.namespace_id(),
        &[KvPair::new(TURNSTILE_CONFIG_KEY, "{}")],
    )
    .await
    .unwrap();

    manager.reset_decision_keys().await.unwrap();

    let data = api.namespace_data(manager.namespace_id()).await;
    let mut keys: Vec<_> = data.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![BAN_TEMPLATE_KEY, RESET_KEY, TURNSTILE_CONFIG_KEY]);
    assert_eq!(data.get(RESET_KEY).map(String::as_str), Some("false"));
}

#[tokio::test]
async fn operator_reset_sentinel_purges_on_the_next_cycle() {
    let (api, mut manager) = provisioned(false).await;
    apply(&mut manager, &[], &[raw("ip", "ban", "1.2.3.4")])
        .await
        .unwrap();
    api.write_kv_pairs(manager.namespace_id(), &[KvPair::new(RESET_KEY, "true")])
        .await
        .unwrap();

    apply(&mut manager, &[], &[raw("ip", "captcha", "5.6.7.8")])
        .await
        .unwrap();

    let data = api.namespace_data(manager.namespace_id()).await;
    assert!(!data.contains_key("1.2.3.4"), "purged before the new batch");
    assert_eq!(data.get("5.6.7.8").map(String::as_str), Some("captcha"));
    assert_eq!(data.get(RESET_KEY).map(String::as_str), Some("false"));
    // The warm-up mark is re-written by the applying cycle.
    assert_eq!(data.get(WARMED_UP_KEY).map(String::as_str), Some("true"));
}

#[tokio::test]
async fn empty_batch_is_a_strict_noop() {
    let (api, mut manager) = provisioned(false).await;
    apply(&mut manager, &[], &[raw("ip", "ban", "1.2.3.4")])
        .await
        .unwrap();
    let before = api.call_counts().await;
    apply(&mut manager, &[], &[]).await.unwrap();
    assert_eq!(before, api.call_counts().await, "no API calls at all");
}

#[tokio::test]
async fn applying_the_same_batch_twice_is_idempotent() {
    let (api, mut manager) = provisioned(false).await;
    let batch = vec![
        raw("ip", "ban", "1.2.3.4"),
        raw("range", "captcha", "10.0.0.0/8"),
        raw("country", "ban", "FR"),
    ];
    apply(&mut manager, &[], &batch).await.unwrap();
    let state = api.namespace_data(manager.namespace_id()).await;

    let before = api.call_counts().await;
    apply(&mut manager, &[], &batch).await.unwrap();
    let after = api.call_counts().await;

    assert_eq!(state, api.namespace_data(manager.namespace_id()).await);
    assert_eq!(before.kv_writes, after.kv_writes);
    assert_eq!(before.kv_deletes, after.kv_deletes);
}

#[tokio::test]
async fn adding_then_deleting_returns_to_the_initial_state() {
    let (api, mut manager) = provisioned(false).await;
    // Warm up first so the sentinel write does not blur the comparison.
    apply(&mut manager, &[], &[raw("ip", "ban", "9.9.9.9")])
        .await
        .unwrap();
    let initial = api.namespace_data(manager.namespace_id()).await;

    apply(&mut manager, &[], &[raw("ip", "captcha", "1.2.3.4")])
        .await
        .unwrap();
    apply(&mut manager, &[raw("ip", "captcha", "1.2.3.4")], &[])
        .await
        .unwrap();

    assert_eq!(initial, api.namespace_data(manager.namespace_id()).await);
}

#[tokio::test]
async fn a_full_write_batch_is_one_call_and_one_more_splits() {
    let (api, mut manager) = provisioned(false).await;
    // Warm up so the sentinel does not count against the batch arithmetic.
    apply(&mut manager, &[], &[raw("ip", "ban", "warm.up")])
        .await
        .unwrap();

    let before = api.call_counts().await;
    let batch: Vec<RawDecision> = (0..10_000)
        .map(|i| raw("as", "ban", &format!("as-{i}")))
        .collect();
    apply(&mut manager, &[], &batch).await.unwrap();
    assert_eq!(api.call_counts().await.kv_writes - before.kv_writes, 1);

    let before = api.call_counts().await;
    let batch: Vec<RawDecision> = (0..10_001)
        .map(|i| raw("as", "ban", &format!("more-{i}")))
        .collect();
    apply(&mut manager, &[], &batch).await.unwrap();
    assert_eq!(api.call_counts().await.kv_writes - before.kv_writes, 2);
}

#[tokio::test]
async fn a_full_delete_batch_is_one_call_and_one_more_splits() {
    let (api, mut manager) = provisioned(false).await;
    let batch: Vec<RawDecision> = (0..10_001)
        .map(|i| raw("as", "ban", &format!("as-{i}")))
        .collect();
    apply(&mut manager, &[], &batch).await.unwrap();

    let before = api.call_counts().await;
    let first_page: Vec<RawDecision> = (0..10_000)
        .map(|i| raw("as", "ban", &format!("as-{i}")))
        .collect();
    apply(&mut manager, &first_page, &[]).await.unwrap();
    assert_eq!(api.call_counts().await.kv_deletes - before.kv_deletes, 1);

    // Re-add, then delete all 10 001 in one cycle: two calls.
    apply(&mut manager, &[], &first_page).await.unwrap();
    let before = api.call_counts().await;
    apply(&mut manager, &batch, &[]).await.unwrap();
    assert_eq!(api.call_counts().await.kv_deletes - before.kv_deletes, 2);
}

#[tokio::test]
async fn a_full_read_set_is_one_call_and_one_more_splits() {
    let api = DeterministicEdgeApi::with_zones(Vec::new()).await;
    let ns = api.create_kv_namespace("reads").await.unwrap();
    let pairs: Vec<KvPair> = (0..101).map(|i| KvPair::new(format!("k{i}"), "ban")).collect();
    api.write_kv_pairs(&ns, &pairs).await.unwrap();

    let keys: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
    let before = api.call_counts().await;
    let values = read_values_chunked(api.as_ref(), &ns, &keys).await.unwrap();
    assert_eq!(values.len(), 100);
    assert_eq!(api.call_counts().await.kv_reads - before.kv_reads, 1);

    let keys: Vec<String> = (0..101).map(|i| format!("k{i}")).collect();
    let before = api.call_counts().await;
    let values = read_values_chunked(api.as_ref(), &ns, &keys).await.unwrap();
    assert_eq!(values.len(), 101);
    assert_eq!(api.call_counts().await.kv_reads - before.kv_reads, 2);
}

#[tokio::test]
async fn rotation_keeps_the_site_key_and_replaces_the_secret() {
    let (api, manager) = provisioned(true).await;
    let handler = manager.turnstile_handler();
    handler.create_widgets().await.unwrap();
    handler.publish().await.unwrap();

    let initial = handler.token_for("example.com").await.unwrap();

    handler.rotate_once("example.com").await.unwrap();
    let after_first = handler.token_for("example.com").await.unwrap();
    handler.rotate_once("example.com").await.unwrap();
    let after_second = handler.token_for("example.com").await.unwrap();

    assert_eq!(initial.site_key, after_first.site_key);
    assert_eq!(initial.site_key, after_second.site_key);
    assert_ne!(initial.secret, after_first.secret);
    assert_ne!(after_first.secret, after_second.secret);

    // Every rotation republished the config document.
    let data = api.namespace_data(manager.namespace_id()).await;
    let document = data.get(TURNSTILE_CONFIG_KEY).unwrap();
    assert!(document.contains(&after_second.secret));
    assert!(!document.contains(&after_first.secret));
}

#[tokio::test(start_paused = true)]
async fn rotator_loop_ticks_on_its_interval_and_stops_on_cancel() {
    let (api, manager) = provisioned(true).await;
    let handler = manager.turnstile_handler();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(handler.clone().run(cancel.clone()));

    // Let the widget creation settle, then advance past two rotation ticks.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let initial = handler.token_for("example.com").await.unwrap();
    tokio::time::sleep(Duration::from_secs(125)).await;

    let rotated = handler.token_for("example.com").await.unwrap();
    assert_eq!(initial.site_key, rotated.site_key);
    assert_ne!(initial.secret, rotated.secret);
    assert!(api.call_counts().await.widget_rotations >= 2);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn teardown_removes_everything_it_provisioned() {
    let (api, mut manager) = provisioned(true).await;
    let handler = manager.turnstile_handler();
    handler.create_widgets().await.unwrap();
    assert_eq!(api.namespace_count().await, 1);
    assert_eq!(api.widget_count().await, 1);
    assert!(api.route_count().await >= 1);
    assert_eq!(api.database_count().await, 1);

    manager.clean_up_existing_workers(false).await.unwrap();

    assert_eq!(api.namespace_count().await, 0);
    assert_eq!(api.widget_count().await, 0);
    assert_eq!(api.route_count().await, 0);
    assert_eq!(api.database_count().await, 0);
    assert!(!api.worker_exists("crowdsec-cloudflare-worker-bouncer").await);
}

#[tokio::test]
async fn teardown_twice_tolerates_the_missing_worker_script() {
    let (_api, mut manager) = provisioned(false).await;
    manager.clean_up_existing_workers(false).await.unwrap();
    // Nothing left to delete; the missing script must stay silent.
    manager.clean_up_existing_workers(false).await.unwrap();
}
