//! In-memory store, used in simulation mode and by the test suites.
//! Same contract as the Postgres store, minus durability.

use std::collections::HashMap;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{RelayerError, RelayerResult};
use crate::events::LedgerEvent;
use crate::state::{Alert, SwapStats, SwapStore};
use crate::types::{
    CancelReason, Escrow, LedgerSide, Order, OrderId, OrderStatus, Secret, TxId, WinningBid,
};

#[derive(Default)]
pub struct MemoryStore {
    orders: RwLock<HashMap<OrderId, Order>>,
    escrows: RwLock<HashMap<(OrderId, LedgerSide), Escrow>>,
    checkpoints: RwLock<HashMap<LedgerSide, u64>>,
    events: RwLock<Vec<LedgerEvent>>,
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts of a given kind. Test hook.
    #[cfg(test)]
    pub async fn alerts_of_kind(&self, kind: &str) -> usize {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|alert| alert.kind == kind)
            .count()
    }

    #[cfg(test)]
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    async fn with_order<F>(&self, order_id: &OrderId, apply: F) -> RelayerResult<()>
    where
        F: FnOnce(&mut Order),
    {
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(order) => {
                apply(order);
                Ok(())
            }
            None => Err(RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            }),
        }
    }

    async fn with_escrow<F>(&self, order_id: &OrderId, side: LedgerSide, apply: F) -> RelayerResult<()>
    where
        F: FnOnce(&mut Escrow),
    {
        let mut escrows = self.escrows.write().await;
        match escrows.get_mut(&(*order_id, side)) {
            Some(escrow) => {
                apply(escrow);
                Ok(())
            }
            None => Err(RelayerError::EscrowNotFound {
                order_id: order_id.to_string(),
                side,
            }),
        }
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn upsert_order(&self, order: &Order) -> RelayerResult<()> {
        self.orders.write().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn set_order_status(
        &self,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<CancelReason>,
    ) -> RelayerResult<()> {
        self.with_order(order_id, |order| {
            order.status = status;
            if reason.is_some() {
                order.cancel_reason = reason;
            }
        })
        .await
    }

    async fn set_auction_start(
        &self,
        order_id: &OrderId,
        start: DateTime<Utc>,
    ) -> RelayerResult<()> {
        self.with_order(order_id, |order| order.auction_start = Some(start))
            .await
    }

    async fn set_winning_bid(&self, order_id: &OrderId, bid: &WinningBid) -> RelayerResult<()> {
        let bid = bid.clone();
        self.with_order(order_id, move |order| order.winning_bid = Some(bid))
            .await
    }

    async fn set_revealed_secret(&self, order_id: &OrderId, secret: &Secret) -> RelayerResult<()> {
        let secret = *secret;
        self.with_order(order_id, move |order| {
            order.revealed_secret = Some(secret)
        })
        .await
    }

    async fn update_remaining(&self, order_id: &OrderId, remaining: U256) -> RelayerResult<()> {
        self.with_order(order_id, |order| order.remaining_amount = remaining)
            .await
    }

    async fn get_order(&self, order_id: &OrderId) -> RelayerResult<Option<Order>> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn open_orders(&self) -> RelayerResult<Vec<Order>> {
        let mut open: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| !order.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|order| order.created_at);
        Ok(open)
    }

    async fn record_escrow(&self, escrow: &Escrow) -> RelayerResult<()> {
        self.escrows
            .write()
            .await
            .insert((escrow.order_id, escrow.side), escrow.clone());
        Ok(())
    }

    async fn set_escrow_claimed(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()> {
        let tx = tx.cloned();
        self.with_escrow(order_id, side, move |escrow| {
            escrow.claimed = true;
            if tx.is_some() {
                escrow.claim_tx = tx;
            }
        })
        .await
    }

    async fn set_escrow_refunded(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()> {
        let tx = tx.cloned();
        self.with_escrow(order_id, side, move |escrow| {
            escrow.refunded = true;
            if tx.is_some() {
                escrow.refund_tx = tx;
            }
        })
        .await
    }

    async fn escrows_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Escrow>> {
        let mut escrows: Vec<Escrow> = self
            .escrows
            .read()
            .await
            .values()
            .filter(|escrow| escrow.order_id == *order_id)
            .cloned()
            .collect();
        escrows.sort_by_key(|escrow| escrow.side.as_str());
        Ok(escrows)
    }

    async fn open_escrows(&self) -> RelayerResult<Vec<Escrow>> {
        Ok(self
            .escrows
            .read()
            .await
            .values()
            .filter(|escrow| escrow.is_open())
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, ledger: LedgerSide) -> RelayerResult<u64> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&ledger)
            .copied()
            .unwrap_or(0))
    }

    async fn save_checkpoint(&self, ledger: LedgerSide, cursor: u64) -> RelayerResult<()> {
        self.checkpoints.write().await.insert(ledger, cursor);
        Ok(())
    }

    async fn store_event(&self, event: &LedgerEvent) -> RelayerResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn claim_secrets_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Secret>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::EscrowClaimed { order_id: id, secret, .. } if id == order_id => {
                    Some(*secret)
                }
                _ => None,
            })
            .collect())
    }

    async fn record_alert(
        &self,
        order_id: Option<&OrderId>,
        kind: &str,
        detail: &str,
    ) -> RelayerResult<()> {
        self.alerts.write().await.push(Alert {
            order_id: order_id.copied(),
            kind: kind.to_string(),
            detail: detail.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_alerts(&self, limit: u32) -> RelayerResult<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let orders = self.orders.read().await;
        let mut stats = SwapStats {
            orders_open: 0,
            orders_settled: 0,
            orders_refunded: 0,
            orders_cancelled: 0,
            escrows_open: 0,
            alerts_total: self.alerts.read().await.len() as u64,
        };
        for order in orders.values() {
            match order.status {
                OrderStatus::Settled => stats.orders_settled += 1,
                OrderStatus::ExpiredRefunded => stats.orders_refunded += 1,
                OrderStatus::Cancelled => stats.orders_cancelled += 1,
                _ => stats.orders_open += 1,
            }
        }
        stats.escrows_open = self
            .escrows
            .read()
            .await
            .values()
            .filter(|escrow| escrow.is_open())
            .count() as u64;
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[tokio::test]
    async fn test_order_round_trip_and_status() {
        let store = MemoryStore::new();
        let order = testkit::order(3, 1_000, 950);
        store.upsert_order(&order).await.unwrap();

        store
            .set_order_status(&order.id, OrderStatus::AuctionActive, None)
            .await
            .unwrap();
        let bid = WinningBid {
            resolver: "res-1".to_string(),
            input_amount: U256::from(1_000u64),
            output_amount: U256::from(940u64),
        };
        store.set_winning_bid(&order.id, &bid).await.unwrap();

        let loaded = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::AuctionActive);
        assert_eq!(loaded.winning_bid, Some(bid));
        assert_eq!(store.open_orders().await.unwrap().len(), 1);

        store
            .set_order_status(
                &order.id,
                OrderStatus::Cancelled,
                Some(CancelReason::Operator),
            )
            .await
            .unwrap();
        assert!(store.open_orders().await.unwrap().is_empty());
        let cancelled = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(cancelled.cancel_reason, Some(CancelReason::Operator));
    }

    #[tokio::test]
    async fn test_escrow_flags_and_open_scan() {
        let store = MemoryStore::new();
        let order = testkit::order(4, 1_000, 950);
        store.upsert_order(&order).await.unwrap();

        let escrow = Escrow {
            order_id: order.id,
            side: LedgerSide::Source,
            address: "escrow-a".to_string(),
            amount: U256::from(1_000u64),
            hashlock: order.hashlock,
            timelock: order.timelock,
            claimed: false,
            refunded: false,
            deposit_tx: TxId("tx-1".to_string()),
            claim_tx: None,
            refund_tx: None,
            created_at: Utc::now(),
        };
        store.record_escrow(&escrow).await.unwrap();
        assert_eq!(store.open_escrows().await.unwrap().len(), 1);

        store
            .set_escrow_claimed(&order.id, LedgerSide::Source, Some(&TxId("tx-2".to_string())))
            .await
            .unwrap();
        assert!(store.open_escrows().await.unwrap().is_empty());

        let stored = store.escrows_for(&order.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].claimed);
        assert_eq!(stored[0].claim_tx, Some(TxId("tx-2".to_string())));

        // Reconciling without a tx keeps the recorded reference
        store
            .set_escrow_claimed(&order.id, LedgerSide::Source, None)
            .await
            .unwrap();
        let stored = store.escrows_for(&order.id).await.unwrap();
        assert_eq!(stored[0].claim_tx, Some(TxId("tx-2".to_string())));

        let missing = store
            .set_escrow_claimed(&order.id, LedgerSide::Destination, Some(&TxId("x".to_string())))
            .await;
        assert!(matches!(missing, Err(RelayerError::EscrowNotFound { .. })));
    }

    #[tokio::test]
    async fn test_checkpoints_default_to_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get_checkpoint(LedgerSide::Source).await.unwrap(), 0);
        store
            .save_checkpoint(LedgerSide::Source, 42)
            .await
            .unwrap();
        assert_eq!(store.get_checkpoint(LedgerSide::Source).await.unwrap(), 42);
        assert_eq!(
            store.get_checkpoint(LedgerSide::Destination).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_stats_buckets() {
        let store = MemoryStore::new();
        let mut settled = testkit::order(5, 10, 9);
        settled.status = OrderStatus::Settled;
        let open = testkit::order(6, 10, 9);
        store.upsert_order(&settled).await.unwrap();
        store.upsert_order(&open).await.unwrap();
        store
            .record_alert(Some(&open.id), "atomicity_breach", "test")
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.orders_open, 1);
        assert_eq!(stats.orders_settled, 1);
        assert_eq!(stats.alerts_total, 1);
        assert_eq!(store.alerts_of_kind("atomicity_breach").await, 1);
    }

    #[tokio::test]
    async fn test_journal_surfaces_claim_preimages() {
        let store = MemoryStore::new();
        let order = testkit::order(7, 10, 9);
        let other = testkit::order(8, 10, 9);
        let secret = testkit::secret(7);

        store
            .store_event(&LedgerEvent::EscrowFunded {
                ledger: LedgerSide::Destination,
                order_id: order.id,
                address: "escrow-b".to_string(),
                amount: U256::from(9u64),
                hashlock: order.hashlock,
                timelock: order.timelock,
                cursor: 1,
                tx_id: TxId("tx-3".to_string()),
            })
            .await
            .unwrap();
        store
            .store_event(&LedgerEvent::EscrowClaimed {
                ledger: LedgerSide::Destination,
                order_id: other.id,
                address: "escrow-c".to_string(),
                secret: testkit::secret(8),
                cursor: 2,
                tx_id: TxId("tx-4".to_string()),
            })
            .await
            .unwrap();
        store
            .store_event(&LedgerEvent::EscrowClaimed {
                ledger: LedgerSide::Destination,
                order_id: order.id,
                address: "escrow-b".to_string(),
                secret,
                cursor: 3,
                tx_id: TxId("tx-5".to_string()),
            })
            .await
            .unwrap();

        // Only claim events, only for the asked-for order.
        assert_eq!(
            store.claim_secrets_for(&order.id).await.unwrap(),
            vec![secret]
        );
        assert!(store
            .claim_secrets_for(&testkit::order(9, 10, 9).id)
            .await
            .unwrap()
            .is_empty());
    }
}
