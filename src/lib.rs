//! Remediation-decision synchronizer bridging a CrowdSec Local API with
//! Cloudflare's edge.
//!
//! The LAPI continuously emits security decisions: ban or captcha against
//! IPs, CIDR ranges, autonomous systems and countries. For every configured
//! Cloudflare account this crate provisions an enforcement worker, the KV
//! namespace it consults on each request, Turnstile widgets and a metrics
//! database, then runs a long-lived reconciliation loop keeping each
//! namespace in step with the incremental stream. The Cloudflare surface is
//! behind the [`cloudflare::api::EdgeApi`] trait so the whole control plane
//! can be exercised against the deterministic in-memory implementation.

/// Per-account Cloudflare management: reconciler, lifecycle, Turnstile.
pub mod cloudflare;
/// YAML configuration document, validation and generation.
pub mod config;
/// Decision model and stream normalization.
pub mod decision;
/// CrowdSec LAPI client: decision stream and usage-metrics push.
pub mod lapi;
/// Prometheus metric families shared across the process.
pub mod metrics;
/// Fan-out driver, cancellation and teardown.
pub mod orchestrator;

pub use cloudflare::{AccountManager, TurnstileHandler};
pub use config::BouncerConfig;
pub use decision::{Decision, DecisionBatch, Scope};
