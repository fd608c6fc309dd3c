//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger gateway health and call latency
//! - Order lifecycle progress
//! - Auction and bid activity
//! - Claims, refunds, and atomicity breaches

use crate::error::RelayerResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramTimer, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Ledger metrics
    pub static ref LEDGER_CONNECTED: GaugeVec = register_gauge_vec!(
        "fusion_ledger_connected",
        "Ledger connection status (1=connected, 0=disconnected)",
        &["ledger"]
    ).unwrap();

    pub static ref GATEWAY_CALL_SECONDS: HistogramVec = register_histogram_vec!(
        "fusion_gateway_call_seconds",
        "Gateway submission latency by action",
        &["ledger", "action"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref GATEWAY_SUBMISSIONS: CounterVec = register_counter_vec!(
        "fusion_gateway_submissions_total",
        "Total gateway submissions by action and outcome",
        &["ledger", "action", "outcome"]
    ).unwrap();

    pub static ref GATEWAY_RETRIES: CounterVec = register_counter_vec!(
        "fusion_gateway_retries_total",
        "Total gateway call retries",
        &["ledger"]
    ).unwrap();

    pub static ref RATE_LIMIT_HITS: CounterVec = register_counter_vec!(
        "fusion_rate_limit_hits_total",
        "Total rate-limit responses from a ledger",
        &["ledger"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "fusion_events_received_total",
        "Total ledger events received by type",
        &["ledger", "event_type"]
    ).unwrap();

    pub static ref WATCHER_CURSOR: GaugeVec = register_gauge_vec!(
        "fusion_watcher_cursor",
        "Last processed event cursor per ledger",
        &["ledger"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS_DETECTED: CounterVec = register_counter_vec!(
        "fusion_orders_detected_total",
        "Total swap orders detected",
        &[]
    ).unwrap();

    pub static ref ORDERS_REJECTED: CounterVec = register_counter_vec!(
        "fusion_orders_rejected_total",
        "Total swap intents rejected at intake",
        &["reason"]
    ).unwrap();

    pub static ref ORDERS_ACTIVE: GaugeVec = register_gauge_vec!(
        "fusion_orders_active",
        "Orders currently owned by a driver task",
        &[]
    ).unwrap();

    pub static ref ORDER_TRANSITIONS: CounterVec = register_counter_vec!(
        "fusion_order_transitions_total",
        "Total order status transitions by target status",
        &["status"]
    ).unwrap();

    // Auction metrics
    pub static ref AUCTIONS_OPENED: CounterVec = register_counter_vec!(
        "fusion_auctions_opened_total",
        "Total auctions opened",
        &[]
    ).unwrap();

    pub static ref AUCTION_WINS: CounterVec = register_counter_vec!(
        "fusion_auction_wins_total",
        "Total auctions won per resolver",
        &["resolver"]
    ).unwrap();

    pub static ref BIDS_SUBMITTED: CounterVec = register_counter_vec!(
        "fusion_bids_submitted_total",
        "Total bids accepted per resolver",
        &["resolver"]
    ).unwrap();

    pub static ref BIDS_REJECTED: CounterVec = register_counter_vec!(
        "fusion_bids_rejected_total",
        "Total bids rejected by reason",
        &["reason"]
    ).unwrap();

    // Settlement metrics
    pub static ref ESCROWS_CREATED: CounterVec = register_counter_vec!(
        "fusion_escrows_created_total",
        "Total escrows funded",
        &["ledger"]
    ).unwrap();

    pub static ref CLAIMS: CounterVec = register_counter_vec!(
        "fusion_claims_total",
        "Total escrow claims submitted by this relayer",
        &["ledger"]
    ).unwrap();

    pub static ref REFUNDS: CounterVec = register_counter_vec!(
        "fusion_refunds_total",
        "Total escrow refunds submitted by this relayer",
        &["ledger"]
    ).unwrap();

    pub static ref ATOMICITY_BREACHES: CounterVec = register_counter_vec!(
        "fusion_atomicity_breaches_total",
        "Total swaps left one-sided after a secret reveal",
        &[]
    ).unwrap();

    pub static ref INVALID_SECRETS: CounterVec = register_counter_vec!(
        "fusion_invalid_secrets_total",
        "Total claim events carrying a preimage that does not match",
        &[]
    ).unwrap();

    pub static ref SETTLEMENT_SECONDS: HistogramVec = register_histogram_vec!(
        "fusion_settlement_seconds",
        "Wall-clock time from order detection to settlement",
        &[],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "fusion_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "fusion_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn set_ledger_health(ledger: &str, healthy: bool) {
    LEDGER_CONNECTED
        .with_label_values(&[ledger])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn gateway_call_timer(ledger: &str, action: &str) -> HistogramTimer {
    GATEWAY_CALL_SECONDS
        .with_label_values(&[ledger, action])
        .start_timer()
}

pub fn record_gateway_submission(ledger: &str, action: &str, ok: bool) {
    GATEWAY_SUBMISSIONS
        .with_label_values(&[ledger, action, if ok { "ok" } else { "err" }])
        .inc();
}

pub fn record_gateway_retry(ledger: &str) {
    GATEWAY_RETRIES.with_label_values(&[ledger]).inc();
}

pub fn record_rate_limit(ledger: &str) {
    RATE_LIMIT_HITS.with_label_values(&[ledger]).inc();
}

pub fn record_event(ledger: &str, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[ledger, event_type])
        .inc();
}

pub fn set_watcher_cursor(ledger: &str, cursor: u64) {
    WATCHER_CURSOR.with_label_values(&[ledger]).set(cursor as f64);
}

pub fn record_order_detected() {
    ORDERS_DETECTED.with_label_values(&[]).inc();
}

pub fn record_order_rejected(reason: &str) {
    ORDERS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn set_orders_active(count: i64) {
    ORDERS_ACTIVE.with_label_values(&[]).set(count as f64);
}

pub fn record_order_status(status: &str) {
    ORDER_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_auction_opened() {
    AUCTIONS_OPENED.with_label_values(&[]).inc();
}

pub fn record_auction_winner(resolver: &str) {
    AUCTION_WINS.with_label_values(&[resolver]).inc();
}

pub fn record_bid_submitted(resolver: &str) {
    BIDS_SUBMITTED.with_label_values(&[resolver]).inc();
}

pub fn record_bid_rejected(reason: &str) {
    BIDS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_escrow_created(ledger: &str) {
    ESCROWS_CREATED.with_label_values(&[ledger]).inc();
}

pub fn record_claim(ledger: &str) {
    CLAIMS.with_label_values(&[ledger]).inc();
}

pub fn record_refund(ledger: &str) {
    REFUNDS.with_label_values(&[ledger]).inc();
}

pub fn record_breach() {
    ATOMICITY_BREACHES.with_label_values(&[]).inc();
}

pub fn record_invalid_secret() {
    INVALID_SECRETS.with_label_values(&[]).inc();
}

pub fn observe_settlement(elapsed_secs: f64) {
    SETTLEMENT_SECONDS.with_label_values(&[]).observe(elapsed_secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
