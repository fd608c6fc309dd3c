//! Timeout monitor
//!
//! Periodic sweep over open escrows whose timelocks have passed. An escrow
//! whose order still has a live driver gets a refund-due nudge and the
//! driver does the work; a stranded escrow (cancelled order with a funded
//! leg, or an order whose driver died) is refunded directly from here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RelayerConfig;
use crate::coordination::engine::SwapEngine;
use crate::error::{RejectReason, RelayerError, RelayerResult};
use crate::gateway::{LedgerAction, LedgerPair};
use crate::state::SwapStore;
use crate::types::{Escrow, Order, OrderStatus};

pub struct TimeoutMonitor {
    pair: Arc<LedgerPair>,
    store: Arc<dyn SwapStore>,
    engine: Arc<SwapEngine>,
    scan_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl TimeoutMonitor {
    pub fn new(
        config: &RelayerConfig,
        pair: Arc<LedgerPair>,
        store: Arc<dyn SwapStore>,
        engine: Arc<SwapEngine>,
    ) -> Self {
        TimeoutMonitor {
            pair,
            store,
            engine,
            scan_interval: Duration::from_secs(config.refund_scan_interval_secs),
            running: Arc::new(RwLock::new(true)),
        }
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Main scan loop
    pub async fn run(&self) {
        info!(
            "Timeout monitor started, scanning every {}s",
            self.scan_interval.as_secs()
        );

        loop {
            if !*self.running.read().await {
                break;
            }

            match self.scan_now().await {
                Ok(0) => {}
                Ok(handled) => info!("Refund scan handled {} due escrows", handled),
                Err(e) => warn!("Refund scan failed: {}", e),
            }

            tokio::time::sleep(self.scan_interval).await;
        }
        debug!("Timeout monitor stopped");
    }

    /// One sweep over the open escrows. Returns how many due escrows were
    /// acted on.
    pub async fn scan_now(&self) -> RelayerResult<usize> {
        let now = Utc::now();
        let due: Vec<Escrow> = self
            .store
            .open_escrows()
            .await?
            .into_iter()
            .filter(|escrow| escrow.is_due(now))
            .collect();

        let mut handled = 0;
        for escrow in due {
            let order = match self.store.get_order(&escrow.order_id).await? {
                Some(order) => order,
                None => {
                    warn!(
                        "Open {} escrow {} has no order row, skipping",
                        escrow.side, escrow.address
                    );
                    continue;
                }
            };

            // A settling order is still pushing the revealed preimage onto
            // its open legs; the claim keeps priority until the ledger
            // itself refuses it.
            if order.status == OrderStatus::Settling {
                debug!(
                    "Order {} is settling, leaving the {} escrow to its claim",
                    order.id, escrow.side
                );
                continue;
            }

            // A claimed sibling leg means the preimage is public and the
            // remaining leg belongs to the settlement path, not a refund.
            let siblings = self.store.escrows_for(&order.id).await?;
            if siblings
                .iter()
                .any(|sibling| sibling.side != escrow.side && sibling.claimed)
            {
                debug!(
                    "Order {} {} escrow left alone, the other leg is claimed",
                    order.id, escrow.side
                );
                continue;
            }

            if self.engine.notify_refund_due(&order.id, escrow.side) {
                handled += 1;
                continue;
            }

            match self.refund_stranded(&order, &escrow).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Stranded refund of {} escrow for order {} failed: {}",
                    escrow.side, order.id, e
                ),
            }
        }
        Ok(handled)
    }

    /// Refund an escrow no driver is looking after. Returns true when a
    /// refund actually landed.
    async fn refund_stranded(&self, order: &Order, escrow: &Escrow) -> RelayerResult<bool> {
        let action = LedgerAction::Refund {
            order_id: order.id,
            escrow_address: escrow.address.clone(),
        };
        match self.pair.submit_and_confirm(escrow.side, &action).await {
            Ok(receipt) => {
                self.store
                    .set_escrow_refunded(&order.id, escrow.side, Some(&receipt.tx_id))
                    .await?;
                crate::metrics::record_refund(escrow.side.as_str());
                info!(
                    "Refunded stranded {} escrow for order {} in {}",
                    escrow.side, order.id, receipt.tx_id
                );
                self.close_expired(order).await?;
                Ok(true)
            }
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyRefunded,
                ..
            }) => {
                // Missed refund event; adopt the ledger's answer.
                self.store
                    .set_escrow_refunded(&order.id, escrow.side, None)
                    .await?;
                debug!(
                    "{} escrow for order {} was already refunded, record updated",
                    escrow.side, order.id
                );
                self.close_expired(order).await?;
                Ok(false)
            }
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyClaimed,
                ..
            }) => {
                // Missed claim event; adopt the ledger's answer and leave
                // the order to the settlement path.
                self.store
                    .set_escrow_claimed(&order.id, escrow.side, None)
                    .await?;
                debug!(
                    "{} escrow for order {} was already claimed, record updated",
                    escrow.side, order.id
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The order itself closes out once no leg is left open.
    async fn close_expired(&self, order: &Order) -> RelayerResult<()> {
        let all_refunded = self
            .store
            .escrows_for(&order.id)
            .await?
            .iter()
            .all(|escrow| escrow.refunded);
        if all_refunded
            && !order.status.is_terminal()
            && order.status.can_transition_to(OrderStatus::ExpiredRefunded)
        {
            self.store
                .set_order_status(&order.id, OrderStatus::ExpiredRefunded, None)
                .await?;
            crate::metrics::record_order_status(OrderStatus::ExpiredRefunded.as_str());
            info!("Order {} expired, all escrows refunded", order.id);
        }
        Ok(())
    }
}
