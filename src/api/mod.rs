//! HTTP API for order intake, monitoring, and operator control
//!
//! Orders normally arrive through the source-ledger watcher; POST /orders
//! is the operator's direct intake for the same intent payload. The claim
//! endpoint stands in for the recipient's own wallet in simulation
//! deployments; the engine reacts to the resulting claim event exactly as
//! it would to one observed on a real ledger.

use crate::config::ApiConfig;
use crate::coordination::{SecretCoordinator, SwapEngine, TimeoutMonitor};
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::{LedgerAction, LedgerPair};
use crate::state::{Alert, SwapStats, SwapStore};
use crate::types::{
    Escrow, Hashlock, LedgerSide, Order, OrderId, OrderIntent, PartialFillPolicy, Secret,
};

use alloy_primitives::U256;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
    pub store: Arc<dyn SwapStore>,
    pub engine: Arc<SwapEngine>,
    pub monitor: Arc<TimeoutMonitor>,
    pub pair: Arc<LedgerPair>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/orders", post(submit_order))
        .route("/orders/:id", get(get_order).delete(cancel_order))
        .route("/orders/:id/claim", post(claim_order))
        .route("/escrows/open", get(open_escrows))
        .route("/refund-scan", post(trigger_refund_scan))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        instance: state.instance_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and both ledgers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();
    let ledger_health = state.pair.health_check().await;
    let ledgers_ok = ledger_health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready: database && ledgers_ok,
        database,
        ledgers: ledger_health
            .into_iter()
            .map(|(ledger, healthy)| LedgerHealth { ledger, healthy })
            .collect(),
    };
    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let ledger_health = state.pair.health_check().await;
    let stats = state.store.stats().await?;
    let recent_alerts = state.store.recent_alerts(20).await?;

    Ok(Json(StatusResponse {
        instance: state.instance_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        ledgers: ledger_health
            .into_iter()
            .map(|(ledger, healthy)| LedgerHealth { ledger, healthy })
            .collect(),
        stats,
        recent_alerts,
    }))
}

/// Get swap statistics
async fn get_stats(State(state): State<AppState>) -> Result<Json<SwapStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// Submit a swap intent directly, bypassing the source-ledger watcher
async fn submit_order(
    State(state): State<AppState>,
    Json(submission): Json<OrderSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let intent = submission.into_intent()?;
    let order = state.engine.submit_order(intent).await?;
    Ok((StatusCode::CREATED, Json(OrderResponse::from(&order))))
}

/// Get one order with its escrows
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderDetailResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or(RelayerError::OrderNotFound { order_id: id })?;
    let escrows = state.store.escrows_for(&order_id).await?;

    Ok(Json(OrderDetailResponse {
        order: OrderResponse::from(&order),
        escrows: escrows.iter().map(EscrowResponse::from).collect(),
    }))
}

/// Operator cancel. Refused from bid selection onward.
async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let order_id = parse_order_id(&id)?;
    state.engine.cancel_order(&order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Claim the destination escrow with the swap secret. The settlement that
/// follows is driven by the observed claim event, not by this handler.
async fn claim_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id = parse_order_id(&id)?;
    let secret = Secret::from_hex(&request.secret)
        .map_err(|e| RelayerError::InvalidOrder(format!("secret: {}", e)))?;
    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or_else(|| RelayerError::OrderNotFound {
            order_id: id.clone(),
        })?;
    SecretCoordinator::verify(&order, &secret)?;

    let escrow = state
        .store
        .escrows_for(&order_id)
        .await?
        .into_iter()
        .find(|escrow| escrow.side == LedgerSide::Destination)
        .ok_or(RelayerError::EscrowNotFound {
            order_id: id,
            side: LedgerSide::Destination,
        })?;

    let receipt = state
        .pair
        .submit_and_confirm(
            LedgerSide::Destination,
            &LedgerAction::Claim {
                order_id,
                escrow_address: escrow.address,
                secret,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ClaimResponse {
            tx_id: receipt.tx_id.to_string(),
        }),
    ))
}

/// All escrows still holding funds, across orders
async fn open_escrows(
    State(state): State<AppState>,
) -> Result<Json<Vec<EscrowResponse>>, ApiError> {
    let escrows = state.store.open_escrows().await?;
    Ok(Json(escrows.iter().map(EscrowResponse::from).collect()))
}

/// Run a refund sweep now instead of waiting for the next interval
async fn trigger_refund_scan(
    State(state): State<AppState>,
) -> Result<Json<RefundScanResponse>, ApiError> {
    let handled = state.monitor.scan_now().await?;
    Ok(Json(RefundScanResponse { handled }))
}

fn parse_order_id(raw: &str) -> Result<OrderId, RelayerError> {
    OrderId::from_hex(raw).map_err(|e| RelayerError::InvalidOrder(format!("order id: {}", e)))
}

fn parse_amount(raw: &str, field: &str) -> Result<U256, RelayerError> {
    raw.parse::<U256>()
        .map_err(|e| RelayerError::InvalidOrder(format!("{}: {}", field, e)))
}

fn error_status(error: &RelayerError) -> StatusCode {
    match error {
        RelayerError::OrderNotFound { .. } | RelayerError::EscrowNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        RelayerError::InvalidOrder(_)
        | RelayerError::TimelockOrdering(_)
        | RelayerError::InvalidSecret { .. } => StatusCode::BAD_REQUEST,
        RelayerError::InvalidStateTransition { .. } | RelayerError::Rejected { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error wrapper so handlers can use `?` on store and engine calls.
struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(error: RelayerError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = error_status(&self.0);
        (
            code,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Request types

#[derive(Debug, Deserialize)]
pub struct OrderSubmission {
    pub maker_asset: String,
    pub taker_asset: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub maker_address: String,
    pub dst_address: String,
    pub deadline: DateTime<Utc>,
    pub timelock: DateTime<Utc>,
    pub hashlock: String,
    #[serde(default)]
    pub partial_fill: Option<PartialFillSubmission>,
}

#[derive(Debug, Deserialize)]
pub struct PartialFillSubmission {
    pub allowed: bool,
    pub min_fill: String,
}

impl OrderSubmission {
    fn into_intent(self) -> RelayerResult<OrderIntent> {
        let maker_amount = parse_amount(&self.maker_amount, "maker_amount")?;
        let taker_amount = parse_amount(&self.taker_amount, "taker_amount")?;
        let hashlock = Hashlock::from_hex(&self.hashlock)
            .map_err(|e| RelayerError::InvalidOrder(format!("hashlock: {}", e)))?;
        let partial_fill = match self.partial_fill {
            Some(partial) => PartialFillPolicy {
                allowed: partial.allowed,
                min_fill: parse_amount(&partial.min_fill, "min_fill")?,
            },
            None => PartialFillPolicy::full_only(),
        };

        Ok(OrderIntent {
            maker_asset: self.maker_asset,
            taker_asset: self.taker_asset,
            maker_amount,
            taker_amount,
            maker_address: self.maker_address,
            dst_address: self.dst_address,
            deadline: self.deadline,
            hashlock,
            timelock: self.timelock,
            partial_fill,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    secret: String,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    instance: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    ledgers: Vec<LedgerHealth>,
}

#[derive(Serialize)]
struct LedgerHealth {
    ledger: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    instance: String,
    version: String,
    uptime_seconds: u64,
    ledgers: Vec<LedgerHealth>,
    stats: SwapStats,
    recent_alerts: Vec<Alert>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Order view with amounts as decimal strings. The revealed preimage never
/// leaves the relayer.
#[derive(Serialize)]
struct OrderResponse {
    id: String,
    maker_asset: String,
    taker_asset: String,
    maker_amount: String,
    taker_amount: String,
    maker_address: String,
    dst_address: String,
    deadline: DateTime<Utc>,
    hashlock: String,
    timelock: DateTime<Utc>,
    status: &'static str,
    remaining_amount: String,
    auction_start: Option<DateTime<Utc>>,
    winning_bid: Option<WinningBidResponse>,
    cancel_reason: Option<&'static str>,
    created_at: DateTime<Utc>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        OrderResponse {
            id: order.id.to_string(),
            maker_asset: order.maker_asset.clone(),
            taker_asset: order.taker_asset.clone(),
            maker_amount: order.maker_amount.to_string(),
            taker_amount: order.taker_amount.to_string(),
            maker_address: order.maker_address.clone(),
            dst_address: order.dst_address.clone(),
            deadline: order.deadline,
            hashlock: order.hashlock.to_string(),
            timelock: order.timelock,
            status: order.status.as_str(),
            remaining_amount: order.remaining_amount.to_string(),
            auction_start: order.auction_start,
            winning_bid: order.winning_bid.as_ref().map(|winning| WinningBidResponse {
                resolver: winning.resolver.clone(),
                input_amount: winning.input_amount.to_string(),
                output_amount: winning.output_amount.to_string(),
            }),
            cancel_reason: order.cancel_reason.map(|reason| reason.as_str()),
            created_at: order.created_at,
        }
    }
}

#[derive(Serialize)]
struct WinningBidResponse {
    resolver: String,
    input_amount: String,
    output_amount: String,
}

#[derive(Serialize)]
struct OrderDetailResponse {
    order: OrderResponse,
    escrows: Vec<EscrowResponse>,
}

#[derive(Serialize)]
struct EscrowResponse {
    order_id: String,
    side: &'static str,
    address: String,
    amount: String,
    hashlock: String,
    timelock: DateTime<Utc>,
    claimed: bool,
    refunded: bool,
    deposit_tx: String,
    claim_tx: Option<String>,
    refund_tx: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&Escrow> for EscrowResponse {
    fn from(escrow: &Escrow) -> Self {
        EscrowResponse {
            order_id: escrow.order_id.to_string(),
            side: escrow.side.as_str(),
            address: escrow.address.clone(),
            amount: escrow.amount.to_string(),
            hashlock: escrow.hashlock.to_string(),
            timelock: escrow.timelock,
            claimed: escrow.claimed,
            refunded: escrow.refunded,
            deposit_tx: escrow.deposit_tx.to_string(),
            claim_tx: escrow.claim_tx.as_ref().map(|tx| tx.to_string()),
            refund_tx: escrow.refund_tx.as_ref().map(|tx| tx.to_string()),
            created_at: escrow.created_at,
        }
    }
}

#[derive(Serialize)]
struct ClaimResponse {
    tx_id: String,
}

#[derive(Serialize)]
struct RefundScanResponse {
    handled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> OrderSubmission {
        OrderSubmission {
            maker_asset: "ETH".to_string(),
            taker_asset: "XLM".to_string(),
            maker_amount: "1000000000000000000".to_string(),
            taker_amount: "95000".to_string(),
            maker_address: "0xmaker".to_string(),
            dst_address: "GDEST".to_string(),
            deadline: Utc::now() + chrono::Duration::minutes(5),
            timelock: Utc::now() + chrono::Duration::hours(2),
            hashlock: Secret::from_bytes([9u8; 32]).hashlock().to_string(),
            partial_fill: None,
        }
    }

    #[test]
    fn test_submission_parses_into_intent() {
        let mut raw = submission();
        raw.partial_fill = Some(PartialFillSubmission {
            allowed: true,
            min_fill: "500000000000000000".to_string(),
        });
        let intent = raw.into_intent().unwrap();

        assert_eq!(
            intent.maker_amount,
            U256::from(1_000_000_000_000_000_000u64)
        );
        assert_eq!(intent.taker_amount, U256::from(95_000u64));
        assert_eq!(intent.hashlock, Secret::from_bytes([9u8; 32]).hashlock());
        assert!(intent.partial_fill.allowed);
        assert_eq!(
            intent.partial_fill.min_fill,
            U256::from(500_000_000_000_000_000u64)
        );

        let full = submission().into_intent().unwrap();
        assert!(!full.partial_fill.allowed);
    }

    #[test]
    fn test_submission_rejects_malformed_fields() {
        let mut bad_amount = submission();
        bad_amount.maker_amount = "12x".to_string();
        assert!(matches!(
            bad_amount.into_intent().unwrap_err(),
            RelayerError::InvalidOrder(_)
        ));

        let mut bad_hashlock = submission();
        bad_hashlock.hashlock = "abcd".to_string();
        assert!(matches!(
            bad_hashlock.into_intent().unwrap_err(),
            RelayerError::InvalidOrder(_)
        ));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&RelayerError::OrderNotFound {
                order_id: "ab".to_string()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&RelayerError::InvalidOrder("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&RelayerError::InvalidStateTransition {
                from: "settled".to_string(),
                to: "cancelled".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&RelayerError::Internal("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
