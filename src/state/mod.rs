//! Persistence layer
//!
//! Everything the relayer must survive a restart with goes through the
//! `SwapStore` trait: orders, escrows, watcher checkpoints, the event
//! journal, and operator alerts. Bids are deliberately not here; an
//! auction interrupted by a crash restarts from its persisted start time
//! and resolvers simply bid again.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgSwapStore;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RelayerResult;
use crate::events::LedgerEvent;
use crate::types::{
    CancelReason, Escrow, LedgerSide, Order, OrderId, OrderStatus, Secret, TxId, WinningBid,
};

#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Insert or fully refresh an order row.
    async fn upsert_order(&self, order: &Order) -> RelayerResult<()>;

    async fn set_order_status(
        &self,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<CancelReason>,
    ) -> RelayerResult<()>;

    async fn set_auction_start(
        &self,
        order_id: &OrderId,
        start: DateTime<Utc>,
    ) -> RelayerResult<()>;

    async fn set_winning_bid(&self, order_id: &OrderId, bid: &WinningBid) -> RelayerResult<()>;

    /// Persist the revealed preimage the moment it is first observed, before
    /// any propagation attempt. Recovery depends on this ordering.
    async fn set_revealed_secret(&self, order_id: &OrderId, secret: &Secret) -> RelayerResult<()>;

    async fn update_remaining(&self, order_id: &OrderId, remaining: U256) -> RelayerResult<()>;

    async fn get_order(&self, order_id: &OrderId) -> RelayerResult<Option<Order>>;

    /// Orders in a non-terminal status, oldest first. Recovery reads this
    /// once at startup.
    async fn open_orders(&self) -> RelayerResult<Vec<Order>>;

    async fn record_escrow(&self, escrow: &Escrow) -> RelayerResult<()>;

    /// `tx` is `None` when reconciling a flag the ledger reports as already
    /// set; an existing transaction reference is then left untouched.
    async fn set_escrow_claimed(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()>;

    async fn set_escrow_refunded(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()>;

    async fn escrows_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Escrow>>;

    /// Escrows that are neither claimed nor refunded, across all orders.
    async fn open_escrows(&self) -> RelayerResult<Vec<Escrow>>;

    async fn get_checkpoint(&self, ledger: LedgerSide) -> RelayerResult<u64>;

    async fn save_checkpoint(&self, ledger: LedgerSide, cursor: u64) -> RelayerResult<()>;

    /// Append to the event journal.
    async fn store_event(&self, event: &LedgerEvent) -> RelayerResult<()>;

    /// Preimages carried by journaled claim events for an order, oldest
    /// first. Recovery reads these when the live claim broadcast was
    /// missed; callers verify each candidate against the hashlock.
    async fn claim_secrets_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Secret>>;

    /// Record an operator-facing alert (atomicity breaches, funding gaps).
    async fn record_alert(
        &self,
        order_id: Option<&OrderId>,
        kind: &str,
        detail: &str,
    ) -> RelayerResult<()>;

    /// Most recent alerts, newest first.
    async fn recent_alerts(&self, limit: u32) -> RelayerResult<Vec<Alert>>;

    async fn stats(&self) -> RelayerResult<SwapStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// An operator-facing alert row. These demand manual follow-up; the
/// relayer never retries its way out of one.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub order_id: Option<OrderId>,
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SwapStats {
    pub orders_open: u64,
    pub orders_settled: u64,
    pub orders_refunded: u64,
    pub orders_cancelled: u64,
    pub escrows_open: u64,
    pub alerts_total: u64,
}
