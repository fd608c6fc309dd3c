//! Swap engine
//!
//! Owns the order lifecycle. Every tracked order gets a driver task that
//! walks it through auction, escrow funding, settlement or refund; the
//! engine's run loop consumes the event bus and routes observed claims and
//! refunds to the right driver. One task per order means one writer per
//! order: ledger submissions for an order never race each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::auction::AuctionSchedule;
use crate::bids::BidRegistry;
use crate::config::{AuctionConfig, RelayerConfig, Settings, TimelockConfig};
use crate::coordination::secret::{PropagationOutcome, SecretCoordinator};
use crate::error::{RejectReason, RelayerError, RelayerResult};
use crate::events::LedgerEvent;
use crate::gateway::{LedgerAction, LedgerPair, TxReceipt};
use crate::state::SwapStore;
use crate::types::{
    CancelReason, Escrow, LedgerSide, Order, OrderId, OrderIntent, OrderStatus, Secret, TxId,
    WinningBid,
};

const COMMAND_CHANNEL_SIZE: usize = 16;
const SHUTDOWN_POLL_MS: u64 = 250;

/// Messages routed to an order's driver task.
#[derive(Debug, Clone)]
pub enum OrderCommand {
    ClaimObserved {
        side: LedgerSide,
        secret: Secret,
        tx: TxId,
    },
    RefundObserved {
        side: LedgerSide,
        tx: TxId,
    },
    RefundDue {
        side: LedgerSide,
    },
    Cancel {
        reason: CancelReason,
    },
}

impl OrderCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OrderCommand::ClaimObserved { .. } => "claim_observed",
            OrderCommand::RefundObserved { .. } => "refund_observed",
            OrderCommand::RefundDue { .. } => "refund_due",
            OrderCommand::Cancel { .. } => "cancel",
        }
    }
}

struct OrderHandle {
    cmd_tx: mpsc::Sender<OrderCommand>,
}

pub struct SwapEngine {
    pair: Arc<LedgerPair>,
    store: Arc<dyn SwapStore>,
    registry: Arc<BidRegistry>,
    secrets: SecretCoordinator,
    relayer: RelayerConfig,
    auction: AuctionConfig,
    timelocks: TimelockConfig,
    resolver_addresses: HashMap<String, String>,
    active: DashMap<OrderId, OrderHandle>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapEngine {
    pub fn new(
        settings: &Settings,
        pair: Arc<LedgerPair>,
        store: Arc<dyn SwapStore>,
        registry: Arc<BidRegistry>,
    ) -> Self {
        let resolver_addresses = settings
            .resolvers
            .iter()
            .map(|resolver| (resolver.id.clone(), resolver.address.clone()))
            .collect();

        SwapEngine {
            secrets: SecretCoordinator::new(pair.clone(), store.clone()),
            pair,
            store,
            registry,
            relayer: settings.relayer.clone(),
            auction: settings.auction.clone(),
            timelocks: settings.timelocks.clone(),
            resolver_addresses,
            active: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Event-bus loop. Runs until `stop()`.
    pub async fn run(self: Arc<Self>) {
        *self.shutdown.write().await = false;
        let mut events = self.pair.subscribe();
        info!("Swap engine started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event bus lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)) => {
                    if *self.shutdown.read().await {
                        break;
                    }
                }
            }
        }

        info!("Swap engine stopped");
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Swap engine shutdown initiated");
    }

    /// Validate and track a new swap intent. Idempotent on the derived order
    /// id: a duplicate returns the order already tracked.
    pub async fn submit_order(self: &Arc<Self>, intent: OrderIntent) -> RelayerResult<Order> {
        let order_id = intent.derive_id();
        if let Some(existing) = self.store.get_order(&order_id).await? {
            debug!("Order {} already tracked", order_id);
            return Ok(existing);
        }

        self.validate_intent(&intent, Utc::now())?;

        let order = Order::from_intent(intent, Utc::now());
        self.store.upsert_order(&order).await?;
        crate::metrics::record_order_detected();
        info!(
            "Order {} detected: {} {} for {} {}, deadline {}",
            order.id,
            order.maker_amount,
            order.maker_asset,
            order.taker_amount,
            order.taker_asset,
            order.deadline
        );

        self.spawn_driver(order.clone());
        Ok(order)
    }

    /// Restart drivers for every non-terminal order after a crash or deploy.
    pub async fn resume_open_orders(self: &Arc<Self>) -> RelayerResult<usize> {
        let open = self.store.open_orders().await?;
        let count = open.len();
        for order in open {
            info!("Resuming order {} in {}", order.id, order.status);
            self.spawn_driver(order);
        }
        if count > 0 {
            info!("Resumed {} open orders", count);
        }
        Ok(count)
    }

    /// Operator-requested cancel. Only accepted before a winner is locked
    /// in; from bid selection onward escrow funding may already be in
    /// flight, and the refund path is the only way out.
    pub async fn cancel_order(&self, order_id: &OrderId) -> RelayerResult<()> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        if !matches!(
            order.status,
            OrderStatus::Detected | OrderStatus::AuctionActive
        ) {
            return Err(RelayerError::InvalidStateTransition {
                from: order.status.as_str().to_string(),
                to: OrderStatus::Cancelled.as_str().to_string(),
            });
        }

        if self.route_command(
            order_id,
            OrderCommand::Cancel {
                reason: CancelReason::Operator,
            },
        ) {
            return Ok(());
        }

        // No live driver; cancel in place.
        self.store
            .set_order_status(order_id, OrderStatus::Cancelled, Some(CancelReason::Operator))
            .await?;
        info!("Order {} cancelled by operator", order_id);
        Ok(())
    }

    /// Hand a due refund to the order's driver. Returns false when no driver
    /// is alive to take it.
    pub fn notify_refund_due(&self, order_id: &OrderId, side: LedgerSide) -> bool {
        self.route_command(order_id, OrderCommand::RefundDue { side })
    }

    async fn handle_event(self: &Arc<Self>, event: LedgerEvent) {
        match event {
            LedgerEvent::OrderCreated { ledger, intent, .. } => {
                if ledger != LedgerSide::Source {
                    debug!("Ignoring order intent observed on {}", ledger);
                    return;
                }
                match self.submit_order(intent).await {
                    Ok(order) => debug!("Tracking order {}", order.id),
                    Err(e) => {
                        warn!("Order intake rejected: {}", e);
                        crate::metrics::record_order_rejected(reject_label(&e));
                    }
                }
            }
            LedgerEvent::EscrowClaimed {
                ledger,
                order_id,
                secret,
                tx_id,
                ..
            } => {
                let order = match self.store.get_order(&order_id).await {
                    Ok(Some(order)) => order,
                    Ok(None) => {
                        debug!("Claim on {} for unknown order {}", ledger, order_id);
                        return;
                    }
                    Err(e) => {
                        error!("Order lookup for claim on {} failed: {}", order_id, e);
                        return;
                    }
                };
                if SecretCoordinator::verify(&order, &secret).is_err() {
                    warn!(
                        "Claim event on {} for order {} carries a non-matching preimage, ignoring",
                        ledger, order_id
                    );
                    crate::metrics::record_invalid_secret();
                    return;
                }
                if let Err(e) = self
                    .store
                    .set_escrow_claimed(&order_id, ledger, Some(&tx_id))
                    .await
                {
                    if !matches!(e, RelayerError::EscrowNotFound { .. }) {
                        warn!(
                            "Failed to record {} claim for order {}: {}",
                            ledger, order_id, e
                        );
                    }
                }
                if !self.route_command(
                    &order_id,
                    OrderCommand::ClaimObserved {
                        side: ledger,
                        secret,
                        tx: tx_id,
                    },
                ) {
                    debug!("Claim on {} for order {} has no live driver", ledger, order_id);
                }
            }
            LedgerEvent::EscrowRefunded {
                ledger,
                order_id,
                tx_id,
                ..
            } => {
                if let Err(e) = self
                    .store
                    .set_escrow_refunded(&order_id, ledger, Some(&tx_id))
                    .await
                {
                    if !matches!(e, RelayerError::EscrowNotFound { .. }) {
                        warn!(
                            "Failed to record {} refund for order {}: {}",
                            ledger, order_id, e
                        );
                    }
                }
                if !self.route_command(
                    &order_id,
                    OrderCommand::RefundObserved {
                        side: ledger,
                        tx: tx_id,
                    },
                ) {
                    debug!(
                        "Refund on {} for order {} has no live driver",
                        ledger, order_id
                    );
                }
            }
            LedgerEvent::EscrowFunded {
                ledger, order_id, ..
            } => {
                debug!("Escrow funding confirmed on {} for order {}", ledger, order_id);
            }
        }
    }

    fn route_command(&self, order_id: &OrderId, command: OrderCommand) -> bool {
        let tx = match self.active.get(order_id) {
            Some(handle) => handle.cmd_tx.clone(),
            None => return false,
        };
        match tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(
                    "Driver for order {} backlogged, dropped {}",
                    order_id,
                    command.name()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn spawn_driver(self: &Arc<Self>, order: Order) {
        if self.active.contains_key(&order.id) {
            debug!("Order {} already has a driver", order.id);
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        self.active.insert(order.id, OrderHandle { cmd_tx });
        crate::metrics::set_orders_active(self.active.len() as i64);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drive_order(order, cmd_rx).await;
        });
    }

    async fn drive_order(
        self: Arc<Self>,
        mut order: Order,
        mut cmd_rx: mpsc::Receiver<OrderCommand>,
    ) {
        let order_id = order.id;
        match self.run_lifecycle(&mut order, &mut cmd_rx).await {
            Ok(status) => info!("Order {} driver finished in {}", order_id, status),
            Err(e) => {
                error!("Order {} driver stopped: {}", order_id, e);
                if e.should_alert() {
                    if let Err(store_err) = self
                        .store
                        .record_alert(Some(&order_id), alert_kind(&e), &e.to_string())
                        .await
                    {
                        error!("Failed to record alert for order {}: {}", order_id, store_err);
                    }
                }
            }
        }
        self.registry.close(&order_id);
        self.active.remove(&order_id);
        crate::metrics::set_orders_active(self.active.len() as i64);
    }

    async fn run_lifecycle(
        &self,
        order: &mut Order,
        cmd_rx: &mut mpsc::Receiver<OrderCommand>,
    ) -> RelayerResult<OrderStatus> {
        loop {
            match order.status {
                OrderStatus::Detected => self.begin_auction(order).await?,
                OrderStatus::AuctionActive => self.run_auction(order, cmd_rx).await?,
                OrderStatus::BidsLocked => self.create_source_escrow(order).await?,
                OrderStatus::SrcEscrowCreated => self.create_destination_escrow(order).await?,
                OrderStatus::DstEscrowCreated => self.await_claim(order, cmd_rx).await?,
                OrderStatus::Settling => self.settle(order).await?,
                status => return Ok(status),
            }
        }
    }

    async fn begin_auction(&self, order: &mut Order) -> RelayerResult<()> {
        let now = Utc::now();
        if now >= order.deadline {
            return self.cancel(order, CancelReason::DeadlinePassed).await;
        }

        // Reuse a persisted start on resume so the price curve is stable
        // across restarts.
        let start = order.auction_start.unwrap_or(now);
        if order.auction_start.is_none() {
            self.store.set_auction_start(&order.id, start).await?;
            order.auction_start = Some(start);
        }
        self.transition(order, OrderStatus::AuctionActive, None).await
    }

    async fn run_auction(
        &self,
        order: &mut Order,
        cmd_rx: &mut mpsc::Receiver<OrderCommand>,
    ) -> RelayerResult<()> {
        let start = match order.auction_start {
            Some(start) => start,
            None => {
                return Err(RelayerError::Internal(format!(
                    "order {} entered auction without a start time",
                    order.id
                )))
            }
        };

        let schedule = AuctionSchedule::for_order(order.taker_amount, start, &self.auction);
        self.registry.open_auction(order, schedule);
        crate::metrics::record_auction_opened();
        info!(
            "Auction open for order {}: {} -> {} over {}s",
            order.id, schedule.start_price, schedule.floor_price, schedule.duration_secs
        );

        let close_at = schedule.end().min(order.deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(duration_until(close_at)) => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(OrderCommand::Cancel { reason }) => {
                        self.registry.close(&order.id);
                        return self.cancel(order, reason).await;
                    }
                    Some(other) => {
                        debug!("Order {} ignoring {} during auction", order.id, other.name());
                    }
                    None => {
                        return Err(RelayerError::Internal(
                            "driver command channel closed".to_string(),
                        ))
                    }
                },
            }
        }

        if Utc::now() >= order.deadline {
            self.registry.close(&order.id);
            return self.cancel(order, CancelReason::DeadlinePassed).await;
        }

        let winner = self.registry.select_winner(&order.id).await;
        self.registry.close(&order.id);

        match winner {
            Some(bid) => {
                let winning = WinningBid::from(&bid);
                self.store.set_winning_bid(&order.id, &winning).await?;
                crate::metrics::record_auction_winner(&winning.resolver);
                info!(
                    "Order {} won by {}: {} in for {} out",
                    order.id, winning.resolver, winning.input_amount, winning.output_amount
                );
                order.winning_bid = Some(winning);
                self.transition(order, OrderStatus::BidsLocked, None).await
            }
            None => self.cancel(order, CancelReason::NoBids).await,
        }
    }

    async fn create_source_escrow(&self, order: &mut Order) -> RelayerResult<()> {
        let winning = match order.winning_bid.clone() {
            Some(winning) => winning,
            None => {
                return Err(RelayerError::Internal(format!(
                    "order {} locked without a winning bid",
                    order.id
                )))
            }
        };
        let beneficiary = match self.resolver_addresses.get(&winning.resolver) {
            Some(address) => address.clone(),
            None => {
                warn!(
                    "Order {} winner {} has no configured address",
                    order.id, winning.resolver
                );
                return self.cancel(order, CancelReason::EscrowFailed).await;
            }
        };

        let action = LedgerAction::CreateEscrow {
            order_id: order.id,
            depositor: order.maker_address.clone(),
            beneficiary,
            amount: winning.input_amount,
            hashlock: order.hashlock,
            timelock: order.timelock,
        };

        match self.fund_escrow(LedgerSide::Source, &action).await {
            Ok(receipt) => {
                self.record_new_escrow(
                    order,
                    LedgerSide::Source,
                    winning.input_amount,
                    order.timelock,
                    receipt.tx_id,
                )
                .await?;
                self.transition(order, OrderStatus::SrcEscrowCreated, None).await
            }
            Err(e) => {
                warn!("Source escrow for order {} failed: {}", order.id, e);
                self.store
                    .record_alert(
                        Some(&order.id),
                        "escrow_failure",
                        &format!("source escrow retries exhausted: {}", e),
                    )
                    .await?;
                self.cancel(order, CancelReason::EscrowFailed).await
            }
        }
    }

    async fn create_destination_escrow(&self, order: &mut Order) -> RelayerResult<()> {
        let winning = match order.winning_bid.clone() {
            Some(winning) => winning,
            None => {
                return Err(RelayerError::Internal(format!(
                    "order {} escrowed without a winning bid",
                    order.id
                )))
            }
        };
        let depositor = match self.resolver_addresses.get(&winning.resolver) {
            Some(address) => address.clone(),
            None => {
                warn!(
                    "Order {} winner {} has no configured address",
                    order.id, winning.resolver
                );
                return self.cancel(order, CancelReason::EscrowFailed).await;
            }
        };

        // The destination leg must expire first so the resolver can always
        // claim the source leg after its payout is taken.
        let dst_timelock =
            order.timelock - ChronoDuration::seconds(self.timelocks.safety_margin_secs as i64);
        let action = LedgerAction::CreateEscrow {
            order_id: order.id,
            depositor,
            beneficiary: order.dst_address.clone(),
            amount: winning.output_amount,
            hashlock: order.hashlock,
            timelock: dst_timelock,
        };

        match self.fund_escrow(LedgerSide::Destination, &action).await {
            Ok(receipt) => {
                self.record_new_escrow(
                    order,
                    LedgerSide::Destination,
                    winning.output_amount,
                    dst_timelock,
                    receipt.tx_id,
                )
                .await?;
                self.transition(order, OrderStatus::DstEscrowCreated, None).await
            }
            Err(e) => {
                warn!(
                    "Destination escrow for order {} failed, source funds locked until {}: {}",
                    order.id, order.timelock, e
                );
                self.store
                    .record_alert(
                        Some(&order.id),
                        "escrow_failure",
                        &format!("destination escrow failed after source funding: {}", e),
                    )
                    .await?;
                self.cancel(order, CancelReason::EscrowFailed).await
            }
        }
    }

    /// Bounded escrow funding attempts on top of the pair's own retries.
    async fn fund_escrow(
        &self,
        side: LedgerSide,
        action: &LedgerAction,
    ) -> RelayerResult<TxReceipt> {
        let attempts = self.relayer.escrow_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.pair.submit_and_confirm(side, action).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "{} escrow attempt {}/{} failed: {}",
                        side, attempt, attempts, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_new_escrow(
        &self,
        order: &Order,
        side: LedgerSide,
        amount: U256,
        timelock: DateTime<Utc>,
        deposit_tx: TxId,
    ) -> RelayerResult<()> {
        let escrow = Escrow {
            order_id: order.id,
            side,
            address: self.pair.gateway(side).escrow_address(&order.id),
            amount,
            hashlock: order.hashlock,
            timelock,
            claimed: false,
            refunded: false,
            deposit_tx,
            claim_tx: None,
            refund_tx: None,
            created_at: Utc::now(),
        };
        self.store.record_escrow(&escrow).await?;
        crate::metrics::record_escrow_created(side.as_str());
        info!(
            "{} escrow {} funded for order {} ({})",
            side, escrow.address, order.id, escrow.deposit_tx
        );
        Ok(())
    }

    /// Hold both escrows until a claim reveals the preimage or the timelocks
    /// run out. The destination leg expires first by construction.
    async fn await_claim(
        &self,
        order: &mut Order,
        cmd_rx: &mut mpsc::Receiver<OrderCommand>,
    ) -> RelayerResult<()> {
        let escrows = self.store.escrows_for(&order.id).await?;
        let mut source = escrows
            .iter()
            .find(|escrow| escrow.side == LedgerSide::Source)
            .cloned()
            .ok_or_else(|| {
                RelayerError::Internal(format!("order {} missing source escrow record", order.id))
            })?;
        let mut destination = escrows
            .iter()
            .find(|escrow| escrow.side == LedgerSide::Destination)
            .cloned()
            .ok_or_else(|| {
                RelayerError::Internal(format!(
                    "order {} missing destination escrow record",
                    order.id
                ))
            })?;

        loop {
            // Event intake and the monitor write flags straight to the
            // store; pick those up before deciding anything.
            for row in self.store.escrows_for(&order.id).await? {
                let leg = match row.side {
                    LedgerSide::Source => &mut source,
                    LedgerSide::Destination => &mut destination,
                };
                leg.claimed = leg.claimed || row.claimed;
                leg.refunded = leg.refunded || row.refunded;
            }

            if source.refunded && destination.refunded {
                return self.transition(order, OrderStatus::ExpiredRefunded, None).await;
            }

            // A preimage persisted before a crash settles the order without
            // waiting for the claim event again.
            if order.revealed_secret.is_some() {
                return self.transition(order, OrderStatus::Settling, None).await;
            }

            // A claimed leg without the preimage in hand means the live claim
            // broadcast was missed; recover the secret from the journal.
            if source.claimed || destination.claimed {
                if let Some(secret) = self.recover_claim_secret(order).await? {
                    self.store.set_revealed_secret(&order.id, &secret).await?;
                    order.revealed_secret = Some(secret);
                    return self.transition(order, OrderStatus::Settling, None).await;
                }
            }

            let next_due = [&source, &destination]
                .into_iter()
                .filter(|escrow| escrow.is_open())
                .map(|escrow| escrow.timelock)
                .min();
            let sleep_for = if source.claimed || destination.claimed {
                // A claimed leg means the preimage is already public; poll
                // the journal on the retry cadence.
                Duration::from_millis(self.relayer.retry_delay_ms)
            } else {
                // Capped so flag changes the command channel missed are
                // still picked up promptly.
                match next_due {
                    Some(due) => duration_until(due).min(Duration::from_secs(60)),
                    None => Duration::from_secs(60),
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(OrderCommand::ClaimObserved { side, secret, tx }) => {
                        info!(
                            "Order {} preimage revealed by claim on {} ({})",
                            order.id, side, tx
                        );
                        // Persisted before any propagation attempt so a
                        // restart can resume settling.
                        self.store.set_revealed_secret(&order.id, &secret).await?;
                        order.revealed_secret = Some(secret);
                        match side {
                            LedgerSide::Source => source.claimed = true,
                            LedgerSide::Destination => destination.claimed = true,
                        }
                        return self.transition(order, OrderStatus::Settling, None).await;
                    }
                    Some(OrderCommand::RefundObserved { side, .. }) => {
                        debug!("Order {} {} escrow refunded externally", order.id, side);
                        match side {
                            LedgerSide::Source => source.refunded = true,
                            LedgerSide::Destination => destination.refunded = true,
                        }
                    }
                    Some(OrderCommand::RefundDue { side }) => {
                        // The source deposit stays locked until the
                        // destination leg is conclusively closed.
                        let allowed = match side {
                            LedgerSide::Source => destination.refunded,
                            LedgerSide::Destination => !source.claimed,
                        };
                        let escrow = match side {
                            LedgerSide::Source => &mut source,
                            LedgerSide::Destination => &mut destination,
                        };
                        if allowed && escrow.is_open() && escrow.is_due(Utc::now()) {
                            self.refund_leg(order, escrow).await;
                        }
                    }
                    Some(OrderCommand::Cancel { .. }) => {
                        warn!("Order {} holds escrows, cancel refused", order.id);
                    }
                    None => {
                        return Err(RelayerError::Internal(
                            "driver command channel closed".to_string(),
                        ))
                    }
                },
                _ = tokio::time::sleep(sleep_for) => {
                    // A claimed counterpart means the preimage is public and
                    // the open leg belongs to the settlement path. The source
                    // deposit only goes back once the destination leg is
                    // conclusively closed.
                    let now = Utc::now();
                    if destination.is_open() && destination.is_due(now) && !source.claimed {
                        self.refund_leg(order, &mut destination).await;
                    }
                    if source.is_open() && source.is_due(now) && destination.refunded {
                        self.refund_leg(order, &mut source).await;
                    }
                }
            }
        }
    }

    /// Recover a preimage from the journaled claim events for an order whose
    /// live claim broadcast was missed. Every candidate is checked against
    /// the order's hashlock before it is trusted.
    async fn recover_claim_secret(&self, order: &Order) -> RelayerResult<Option<Secret>> {
        let candidates = self.store.claim_secrets_for(&order.id).await?;
        if candidates.is_empty() {
            debug!(
                "Order {} has a claimed leg but no journaled claim yet",
                order.id
            );
            return Ok(None);
        }
        for secret in candidates {
            if SecretCoordinator::verify(order, &secret).is_ok() {
                info!(
                    "Order {} preimage recovered from the event journal",
                    order.id
                );
                return Ok(Some(secret));
            }
            crate::metrics::record_invalid_secret();
            warn!(
                "Journaled claim for order {} carries a non-matching preimage, skipping",
                order.id
            );
        }
        Ok(None)
    }

    async fn refund_leg(&self, order: &Order, escrow: &mut Escrow) {
        let action = LedgerAction::Refund {
            order_id: order.id,
            escrow_address: escrow.address.clone(),
        };
        match self.pair.submit_and_confirm(escrow.side, &action).await {
            Ok(receipt) => {
                escrow.refunded = true;
                escrow.refund_tx = Some(receipt.tx_id.clone());
                if let Err(e) = self
                    .store
                    .set_escrow_refunded(&order.id, escrow.side, Some(&receipt.tx_id))
                    .await
                {
                    error!(
                        "Failed to record {} refund for order {}: {}",
                        escrow.side, order.id, e
                    );
                }
                crate::metrics::record_refund(escrow.side.as_str());
                info!(
                    "Refunded {} escrow for order {} in {}",
                    escrow.side, order.id, receipt.tx_id
                );
            }
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyClaimed,
                ..
            }) => {
                // The claim landed first; the preimage follows from the
                // journal or the live event.
                escrow.claimed = true;
                if let Err(e) = self
                    .store
                    .set_escrow_claimed(&order.id, escrow.side, None)
                    .await
                {
                    error!(
                        "Failed to record {} claim for order {}: {}",
                        escrow.side, order.id, e
                    );
                }
                debug!(
                    "Order {} {} escrow was claimed before the refund",
                    order.id, escrow.side
                );
            }
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyRefunded,
                ..
            }) => {
                escrow.refunded = true;
                if let Err(e) = self
                    .store
                    .set_escrow_refunded(&order.id, escrow.side, None)
                    .await
                {
                    error!(
                        "Failed to record {} refund for order {}: {}",
                        escrow.side, order.id, e
                    );
                }
                debug!("Order {} {} escrow already refunded", order.id, escrow.side);
            }
            Err(e) => {
                warn!(
                    "Refund of {} escrow for order {} failed: {}",
                    escrow.side, order.id, e
                );
                tokio::time::sleep(Duration::from_millis(self.relayer.retry_delay_ms)).await;
            }
        }
    }

    /// Push the revealed preimage onto every remaining open leg, then close
    /// out the order. Claims are retried until the leg's timelock makes them
    /// impossible, which surfaces as an atomicity breach.
    async fn settle(&self, order: &mut Order) -> RelayerResult<()> {
        let secret = match order.revealed_secret {
            Some(secret) => secret,
            None => {
                return Err(RelayerError::Internal(format!(
                    "order {} settling without a revealed secret",
                    order.id
                )))
            }
        };

        let mut resolved: HashSet<LedgerSide> = HashSet::new();
        loop {
            let escrows = self.store.escrows_for(&order.id).await?;
            let pending: Vec<Escrow> = escrows
                .into_iter()
                .filter(|escrow| escrow.is_open() && !resolved.contains(&escrow.side))
                .collect();
            if pending.is_empty() {
                break;
            }

            for escrow in pending {
                match self.secrets.claim_leg(order, escrow.side, &secret).await {
                    Ok(PropagationOutcome::Claimed(_)) => {
                        resolved.insert(escrow.side);
                    }
                    Ok(PropagationOutcome::AlreadyClaimed) => {
                        resolved.insert(escrow.side);
                    }
                    Ok(PropagationOutcome::Breach(detail)) => {
                        crate::metrics::record_breach();
                        return Err(RelayerError::AtomicityBreach {
                            order_id: order.id.to_string(),
                            detail,
                        });
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            "Claim of {} escrow for order {} failed, retrying: {}",
                            escrow.side, order.id, e
                        );
                        tokio::time::sleep(Duration::from_millis(self.relayer.retry_delay_ms))
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Partial fills settle the filled slice; the remainder stays with
        // the originator.
        if let Some(winning) = &order.winning_bid {
            let remaining = order.remaining_amount.saturating_sub(winning.input_amount);
            self.store.update_remaining(&order.id, remaining).await?;
            order.remaining_amount = remaining;
        }

        self.transition(order, OrderStatus::Settled, None).await?;
        let elapsed = (Utc::now() - order.created_at).num_milliseconds() as f64 / 1000.0;
        crate::metrics::observe_settlement(elapsed);
        info!("Order {} settled, both legs claimed", order.id);
        Ok(())
    }

    async fn cancel(&self, order: &mut Order, reason: CancelReason) -> RelayerResult<()> {
        info!("Order {} cancelled: {}", order.id, reason.as_str());
        self.transition(order, OrderStatus::Cancelled, Some(reason)).await
    }

    async fn transition(
        &self,
        order: &mut Order,
        next: OrderStatus,
        reason: Option<CancelReason>,
    ) -> RelayerResult<()> {
        if !order.status.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: order.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.store.set_order_status(&order.id, next, reason).await?;
        debug!("Order {} {} -> {}", order.id, order.status, next);
        order.status = next;
        if reason.is_some() {
            order.cancel_reason = reason;
        }
        crate::metrics::record_order_status(next.as_str());
        Ok(())
    }

    fn validate_intent(&self, intent: &OrderIntent, now: DateTime<Utc>) -> RelayerResult<()> {
        if intent.maker_amount.is_zero() || intent.taker_amount.is_zero() {
            return Err(RelayerError::InvalidOrder(
                "maker and taker amounts must be non-zero".to_string(),
            ));
        }
        if intent.partial_fill.allowed
            && (intent.partial_fill.min_fill.is_zero()
                || intent.partial_fill.min_fill > intent.maker_amount)
        {
            return Err(RelayerError::InvalidOrder(format!(
                "partial fill minimum {} outside (0, {}]",
                intent.partial_fill.min_fill, intent.maker_amount
            )));
        }
        if intent.deadline >= intent.timelock {
            return Err(RelayerError::InvalidOrder(
                "auction deadline must precede the refund timelock".to_string(),
            ));
        }

        let source = self.pair.ledger_config(LedgerSide::Source);
        let window = (intent.timelock - now).num_seconds();
        if window < source.min_timelock_secs as i64 {
            return Err(RelayerError::TimelockOrdering(format!(
                "source window {}s below the {}s minimum on {}",
                window,
                source.min_timelock_secs,
                self.pair.ledger_name(LedgerSide::Source)
            )));
        }
        if window > source.max_timelock_secs as i64 {
            return Err(RelayerError::TimelockOrdering(format!(
                "source window {}s exceeds the {}s maximum on {}",
                window,
                source.max_timelock_secs,
                self.pair.ledger_name(LedgerSide::Source)
            )));
        }

        let destination = self.pair.ledger_config(LedgerSide::Destination);
        let margin = self.timelocks.safety_margin_secs as i64;
        let dst_window = window - margin;
        let floor = destination
            .min_timelock_secs
            .max(self.timelocks.min_destination_window_secs) as i64;
        if dst_window < floor {
            return Err(RelayerError::TimelockOrdering(format!(
                "destination window {}s after the {}s safety margin is below the {}s floor",
                dst_window, margin, floor
            )));
        }
        if dst_window > destination.max_timelock_secs as i64 {
            return Err(RelayerError::TimelockOrdering(format!(
                "destination window {}s exceeds the {}s maximum on {}",
                dst_window,
                destination.max_timelock_secs,
                self.pair.ledger_name(LedgerSide::Destination)
            )));
        }
        Ok(())
    }
}

fn duration_until(when: DateTime<Utc>) -> Duration {
    (when - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn reject_label(error: &RelayerError) -> &'static str {
    match error {
        RelayerError::TimelockOrdering(_) => "timelock",
        RelayerError::InvalidOrder(_) => "invalid",
        RelayerError::Database(_) => "database",
        _ => "other",
    }
}

fn alert_kind(error: &RelayerError) -> &'static str {
    match error {
        RelayerError::AtomicityBreach { .. } => "atomicity_breach",
        RelayerError::InsufficientFunds { .. } => "insufficient_funds",
        _ => "driver_failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sim::SimFailure;
    use crate::gateway::LedgerGateway;
    use crate::state::MemoryStore;
    use crate::testkit;
    use crate::types::Bid;
    use crate::watcher::LedgerWatcher;
    use alloy_primitives::U256;

    struct Stack {
        harness: testkit::SimHarness,
        store: Arc<MemoryStore>,
        registry: Arc<BidRegistry>,
        engine: Arc<SwapEngine>,
    }

    /// Watchers on both sides plus the engine loop, over a fresh store.
    async fn start_stack() -> Stack {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let settings = testkit::settings();
        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn.clone(),
            registry.clone(),
        ));

        // Engine first so the watchers' first poll finds a subscriber.
        tokio::spawn(engine.clone().run());
        for side in [LedgerSide::Source, LedgerSide::Destination] {
            let watcher = LedgerWatcher::new(harness.pair.clone(), store_dyn.clone(), side)
                .await
                .unwrap();
            tokio::spawn(async move { watcher.run().await });
        }

        Stack {
            harness,
            store,
            registry,
            engine,
        }
    }

    async fn bid_when_open(stack: &Stack, order_id: OrderId, input: u64, output: u64) {
        let registry = stack.registry.clone();
        let opened = testkit::wait_until(
            || {
                let registry = registry.clone();
                async move {
                    registry
                        .open_auctions()
                        .await
                        .iter()
                        .any(|view| view.order_id == order_id)
                }
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(opened, "auction never opened");

        let resolver = testkit::resolver("res-1", testkit::RESOLVER_ONE);
        let bid = Bid::new(
            order_id,
            "res-1",
            U256::from(input),
            U256::from(output),
            90_000,
            Utc::now(),
        );
        stack.registry.submit_bid(&resolver, bid).await.unwrap();
    }

    async fn wait_for_status(
        store: &Arc<MemoryStore>,
        order_id: OrderId,
        status: OrderStatus,
        secs: u64,
    ) -> bool {
        let store = store.clone();
        testkit::wait_until(
            move || {
                let store = store.clone();
                async move {
                    match store.get_order(&order_id).await {
                        Ok(Some(order)) => order.status == status,
                        _ => false,
                    }
                }
            },
            Duration::from_secs(secs),
        )
        .await
    }

    /// An order parked mid-swap: both legs funded on the sim ledgers and
    /// recorded in the store, the way a restarted relayer finds them.
    async fn park_funded_order(
        harness: &testkit::SimHarness,
        store: &Arc<MemoryStore>,
        tag: u8,
        status: OrderStatus,
        src_timelock: DateTime<Utc>,
    ) -> Order {
        let now = Utc::now();
        let mut order = Order::from_intent(
            testkit::intent(
                tag,
                1_000,
                950,
                now + ChronoDuration::seconds(30),
                src_timelock,
            ),
            now,
        );
        order.status = status;
        order.winning_bid = Some(WinningBid {
            resolver: "res-1".to_string(),
            input_amount: U256::from(1_000u64),
            output_amount: U256::from(940u64),
        });
        store.upsert_order(&order).await.unwrap();

        let legs = [
            (
                LedgerSide::Source,
                order.maker_address.clone(),
                testkit::RESOLVER_ONE.to_string(),
                U256::from(1_000u64),
                src_timelock,
            ),
            (
                LedgerSide::Destination,
                testkit::RESOLVER_ONE.to_string(),
                order.dst_address.clone(),
                U256::from(940u64),
                src_timelock - ChronoDuration::seconds(1),
            ),
        ];
        for (side, depositor, beneficiary, amount, timelock) in legs {
            let gateway = harness.pair.gateway(side);
            let tx = gateway
                .submit(LedgerAction::CreateEscrow {
                    order_id: order.id,
                    depositor,
                    beneficiary,
                    amount,
                    hashlock: order.hashlock,
                    timelock,
                })
                .await
                .unwrap();
            store
                .record_escrow(&Escrow {
                    order_id: order.id,
                    side,
                    address: gateway.escrow_address(&order.id),
                    amount,
                    hashlock: order.hashlock,
                    timelock,
                    claimed: false,
                    refunded: false,
                    deposit_tx: tx,
                    claim_tx: None,
                    refund_tx: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }
        order
    }

    #[tokio::test]
    async fn test_order_settles_end_to_end() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            70,
            1_000,
            950,
            now + ChronoDuration::seconds(10),
            now + ChronoDuration::seconds(3_600),
        );
        let secret = testkit::secret(70);
        let order_id = stack.harness.source.announce_order(intent);

        bid_when_open(&stack, order_id, 1_000, 940).await;
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::DstEscrowCreated, 4).await);

        let escrows = stack.store.escrows_for(&order_id).await.unwrap();
        assert_eq!(escrows.len(), 2);
        let src = escrows
            .iter()
            .find(|escrow| escrow.side == LedgerSide::Source)
            .unwrap()
            .clone();
        let dst = escrows
            .iter()
            .find(|escrow| escrow.side == LedgerSide::Destination)
            .unwrap()
            .clone();
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(dst.timelock, order.timelock - ChronoDuration::seconds(1));
        assert!(dst.timelock < src.timelock);
        assert!(src.created_at <= dst.created_at);
        assert_eq!(order.winning_bid.as_ref().unwrap().resolver, "res-1");

        // The recipient claims the destination leg, revealing the preimage.
        stack
            .harness
            .destination
            .submit(LedgerAction::Claim {
                order_id,
                escrow_address: dst.address.clone(),
                secret,
            })
            .await
            .unwrap();

        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Settled, 5).await);

        assert!(stack.harness.source.escrow(&src.address).unwrap().claimed);
        assert!(stack.harness.source.preimage_used(&secret));
        assert!(stack.harness.destination.preimage_used(&secret));
        let settled = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(settled.remaining_amount, U256::ZERO);
        assert!(settled.revealed_secret.is_some());
    }

    #[tokio::test]
    async fn test_auction_without_bids_cancels() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            71,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);

        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Cancelled, 5).await);
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.cancel_reason, Some(CancelReason::NoBids));
        assert!(stack.store.escrows_for(&order_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_cancels_on_intake() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            72,
            1_000,
            950,
            now - ChronoDuration::seconds(1),
            now + ChronoDuration::seconds(3_600),
        );

        // Tracked for audit, then cancelled by its driver.
        let order = stack.engine.submit_order(intent).await.unwrap();
        assert!(wait_for_status(&stack.store, order.id, OrderStatus::Cancelled, 3).await);
        let stored = stack.store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.cancel_reason, Some(CancelReason::DeadlinePassed));
    }

    #[tokio::test]
    async fn test_intake_rejects_malformed_intents() {
        let stack = start_stack().await;
        let now = Utc::now();

        let short = testkit::intent(
            73,
            1_000,
            950,
            now + ChronoDuration::milliseconds(500),
            now + ChronoDuration::seconds(1),
        );
        assert!(matches!(
            stack.engine.submit_order(short).await.unwrap_err(),
            RelayerError::TimelockOrdering(_)
        ));

        let long = testkit::intent(
            74,
            1_000,
            950,
            now + ChronoDuration::seconds(10),
            now + ChronoDuration::seconds(200_000),
        );
        assert!(matches!(
            stack.engine.submit_order(long).await.unwrap_err(),
            RelayerError::TimelockOrdering(_)
        ));

        let inverted = testkit::intent(
            75,
            1_000,
            950,
            now + ChronoDuration::seconds(7_200),
            now + ChronoDuration::seconds(3_600),
        );
        assert!(matches!(
            stack.engine.submit_order(inverted).await.unwrap_err(),
            RelayerError::InvalidOrder(_)
        ));

        let mut zero = testkit::intent(
            76,
            1,
            950,
            now + ChronoDuration::seconds(10),
            now + ChronoDuration::seconds(3_600),
        );
        zero.maker_amount = U256::ZERO;
        assert!(matches!(
            stack.engine.submit_order(zero).await.unwrap_err(),
            RelayerError::InvalidOrder(_)
        ));

        // Rejected intents are never persisted.
        assert!(stack.store.open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_source_escrow_failure_cancels_order() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            77,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);
        bid_when_open(&stack, order_id, 1_000, 940).await;
        stack
            .harness
            .source
            .fail_next(SimFailure::Rejected(RejectReason::Other(
                "allowance revoked".to_string(),
            )));

        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Cancelled, 5).await);
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.cancel_reason, Some(CancelReason::EscrowFailed));
        let address = stack.harness.source.escrow_address(&order_id);
        assert!(stack.harness.source.escrow(&address).is_none());
        assert!(stack.store.escrows_for(&order_id).await.unwrap().is_empty());
        assert_eq!(stack.store.alerts_of_kind("escrow_failure").await, 1);
    }

    #[tokio::test]
    async fn test_destination_escrow_failure_alerts_and_strands_source() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            78,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);
        bid_when_open(&stack, order_id, 1_000, 940).await;
        stack
            .harness
            .destination
            .fail_next(SimFailure::Rejected(RejectReason::Other(
                "depositor unknown".to_string(),
            )));

        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Cancelled, 5).await);
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.cancel_reason, Some(CancelReason::EscrowFailed));

        // The source escrow is stranded until its timelock.
        let escrows = stack.store.escrows_for(&order_id).await.unwrap();
        assert_eq!(escrows.len(), 1);
        assert_eq!(escrows[0].side, LedgerSide::Source);
        assert!(escrows[0].is_open());
        assert_eq!(stack.store.alerts_of_kind("escrow_failure").await, 1);
    }

    #[tokio::test]
    async fn test_unclaimed_escrows_refund_after_expiry() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            79,
            1_000,
            950,
            now + ChronoDuration::seconds(2),
            now + ChronoDuration::seconds(3),
        );
        let order_id = stack.harness.source.announce_order(intent);
        bid_when_open(&stack, order_id, 1_000, 930).await;

        assert!(wait_for_status(&stack.store, order_id, OrderStatus::ExpiredRefunded, 8).await);

        let escrows = stack.store.escrows_for(&order_id).await.unwrap();
        assert_eq!(escrows.len(), 2);
        assert!(escrows.iter().all(|escrow| escrow.refunded));

        let src_addr = stack.harness.source.escrow_address(&order_id);
        let dst_addr = stack.harness.destination.escrow_address(&order_id);
        assert_eq!(stack.harness.source.refund_submissions(&src_addr), 1);
        assert_eq!(stack.harness.destination.refund_submissions(&dst_addr), 1);
        assert_eq!(stack.harness.source.claim_submissions(&src_addr), 0);

        // Resolver capital came back.
        let funding = stack
            .harness
            .pair
            .balance(LedgerSide::Destination, testkit::RESOLVER_ONE)
            .await
            .unwrap();
        assert_eq!(funding, U256::from(1_000_000u64));
    }

    #[tokio::test]
    async fn test_forged_claim_event_is_ignored() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            80,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);
        bid_when_open(&stack, order_id, 1_000, 940).await;
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::DstEscrowCreated, 4).await);

        let dst_addr = stack.harness.destination.escrow_address(&order_id);
        stack
            .engine
            .handle_event(LedgerEvent::EscrowClaimed {
                ledger: LedgerSide::Destination,
                order_id,
                address: dst_addr.clone(),
                secret: testkit::secret(81),
                cursor: 999,
                tx_id: TxId("forged-1".to_string()),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::DstEscrowCreated);
        assert!(order.revealed_secret.is_none());
        let escrows = stack.store.escrows_for(&order_id).await.unwrap();
        assert!(escrows.iter().all(|escrow| !escrow.claimed));

        // The genuine claim still settles the order.
        stack
            .harness
            .destination
            .submit(LedgerAction::Claim {
                order_id,
                escrow_address: dst_addr,
                secret: testkit::secret(80),
            })
            .await
            .unwrap();
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Settled, 5).await);
    }

    #[tokio::test]
    async fn test_resume_drives_open_orders() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let now = Utc::now();

        let fresh = Order::from_intent(
            testkit::intent(
                82,
                1_000,
                950,
                now + ChronoDuration::seconds(30),
                now + ChronoDuration::seconds(3_600),
            ),
            now,
        );
        store.upsert_order(&fresh).await.unwrap();

        let mut stale = Order::from_intent(
            testkit::intent(
                83,
                1_000,
                950,
                now + ChronoDuration::seconds(30),
                now + ChronoDuration::seconds(3_600),
            ),
            now - ChronoDuration::seconds(60),
        );
        stale.status = OrderStatus::AuctionActive;
        stale.auction_start = Some(now - ChronoDuration::seconds(30));
        store.upsert_order(&stale).await.unwrap();

        let mut done = Order::from_intent(
            testkit::intent(
                84,
                1_000,
                950,
                now + ChronoDuration::seconds(30),
                now + ChronoDuration::seconds(3_600),
            ),
            now,
        );
        done.status = OrderStatus::Settled;
        store.upsert_order(&done).await.unwrap();

        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        let resumed = engine.resume_open_orders().await.unwrap();
        assert_eq!(resumed, 2);

        // Nobody bids: the fresh order runs its auction out, the stale one's
        // auction already ended.
        assert!(wait_for_status(&store, fresh.id, OrderStatus::Cancelled, 5).await);
        assert!(wait_for_status(&store, stale.id, OrderStatus::Cancelled, 5).await);
        let stale_after = store.get_order(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale_after.cancel_reason, Some(CancelReason::NoBids));
    }

    #[tokio::test]
    async fn test_resume_with_persisted_secret_settles() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let now = Utc::now();

        let order = park_funded_order(
            &harness,
            &store,
            88,
            OrderStatus::DstEscrowCreated,
            now + ChronoDuration::seconds(3_600),
        )
        .await;
        let secret = testkit::secret(88);
        let dst_addr = harness.destination.escrow_address(&order.id);
        let claim_tx = harness
            .destination
            .submit(LedgerAction::Claim {
                order_id: order.id,
                escrow_address: dst_addr,
                secret,
            })
            .await
            .unwrap();
        store
            .set_escrow_claimed(&order.id, LedgerSide::Destination, Some(&claim_tx))
            .await
            .unwrap();
        // The preimage was persisted but the move to settling never
        // committed before the crash.
        store.set_revealed_secret(&order.id, &secret).await.unwrap();

        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        assert_eq!(engine.resume_open_orders().await.unwrap(), 1);

        assert!(wait_for_status(&store, order.id, OrderStatus::Settled, 5).await);
        let src_addr = harness.source.escrow_address(&order.id);
        assert!(harness.source.escrow(&src_addr).unwrap().claimed);
        assert_eq!(harness.source.refund_submissions(&src_addr), 0);
        let escrows = store.escrows_for(&order.id).await.unwrap();
        assert!(escrows.iter().all(|escrow| escrow.claimed));
    }

    #[tokio::test]
    async fn test_resume_settling_order_completes_settlement() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let now = Utc::now();

        let order = park_funded_order(
            &harness,
            &store,
            89,
            OrderStatus::Settling,
            now + ChronoDuration::seconds(3_600),
        )
        .await;
        let secret = testkit::secret(89);
        let dst_addr = harness.destination.escrow_address(&order.id);
        let claim_tx = harness
            .destination
            .submit(LedgerAction::Claim {
                order_id: order.id,
                escrow_address: dst_addr,
                secret,
            })
            .await
            .unwrap();
        store
            .set_escrow_claimed(&order.id, LedgerSide::Destination, Some(&claim_tx))
            .await
            .unwrap();
        store.set_revealed_secret(&order.id, &secret).await.unwrap();

        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        assert_eq!(engine.resume_open_orders().await.unwrap(), 1);

        assert!(wait_for_status(&store, order.id, OrderStatus::Settled, 5).await);
        let settled = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(settled.remaining_amount, U256::ZERO);
        let src_addr = harness.source.escrow_address(&order.id);
        assert!(harness.source.escrow(&src_addr).unwrap().claimed);
        assert_eq!(harness.source.refund_submissions(&src_addr), 0);
    }

    #[tokio::test]
    async fn test_resume_recovers_preimage_from_journal() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let now = Utc::now();

        let order = park_funded_order(
            &harness,
            &store,
            90,
            OrderStatus::DstEscrowCreated,
            now + ChronoDuration::seconds(3_600),
        )
        .await;
        let secret = testkit::secret(90);
        let dst_addr = harness.destination.escrow_address(&order.id);
        let claim_tx = harness
            .destination
            .submit(LedgerAction::Claim {
                order_id: order.id,
                escrow_address: dst_addr.clone(),
                secret,
            })
            .await
            .unwrap();
        store
            .set_escrow_claimed(&order.id, LedgerSide::Destination, Some(&claim_tx))
            .await
            .unwrap();
        // The watcher journaled the claim but the driver command carrying
        // the preimage was lost. A forged entry sits ahead of the real one
        // and must be skipped, not trusted.
        store
            .store_event(&LedgerEvent::EscrowClaimed {
                ledger: LedgerSide::Destination,
                order_id: order.id,
                address: dst_addr.clone(),
                secret: testkit::secret(99),
                cursor: 1,
                tx_id: TxId("sim-algo-sim-forged".to_string()),
            })
            .await
            .unwrap();
        store
            .store_event(&LedgerEvent::EscrowClaimed {
                ledger: LedgerSide::Destination,
                order_id: order.id,
                address: dst_addr,
                secret,
                cursor: 2,
                tx_id: claim_tx,
            })
            .await
            .unwrap();

        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        assert_eq!(engine.resume_open_orders().await.unwrap(), 1);

        assert!(wait_for_status(&store, order.id, OrderStatus::Settled, 5).await);
        let settled = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(settled.revealed_secret, Some(secret));
        let src_addr = harness.source.escrow_address(&order.id);
        assert!(harness.source.escrow(&src_addr).unwrap().claimed);
        assert_eq!(harness.source.refund_submissions(&src_addr), 0);
    }

    #[tokio::test]
    async fn test_claimed_destination_blocks_source_refund() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let now = Utc::now();

        // Source timelock already past. The destination claim was adopted
        // from a ledger answer, but no preimage and no journaled event yet.
        let order = park_funded_order(
            &harness,
            &store,
            91,
            OrderStatus::DstEscrowCreated,
            now - ChronoDuration::seconds(1),
        )
        .await;
        store
            .set_escrow_claimed(&order.id, LedgerSide::Destination, None)
            .await
            .unwrap();

        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        assert_eq!(engine.resume_open_orders().await.unwrap(), 1);

        // The driver must hold the source leg for the claim instead of
        // refunding it back to the maker.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let src_addr = harness.source.escrow_address(&order.id);
        assert_eq!(harness.source.refund_submissions(&src_addr), 0);
        let src = harness.source.escrow(&src_addr).unwrap();
        assert!(!src.claimed && !src.refunded);
        let parked = store.get_order(&order.id).await.unwrap().unwrap();
        assert_eq!(parked.status, OrderStatus::DstEscrowCreated);
    }

    #[tokio::test]
    async fn test_settlement_breach_raises_alert() {
        let stack = start_stack().await;
        let now = Utc::now();
        let intent = testkit::intent(
            85,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);
        bid_when_open(&stack, order_id, 1_000, 940).await;
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::DstEscrowCreated, 4).await);

        // The source leg dies under us after the secret goes public.
        let src_addr = stack.harness.source.escrow_address(&order_id);
        stack
            .harness
            .source
            .fail_next(SimFailure::Rejected(RejectReason::AlreadyRefunded));
        let dst_addr = stack.harness.destination.escrow_address(&order_id);
        stack
            .harness
            .destination
            .submit(LedgerAction::Claim {
                order_id,
                escrow_address: dst_addr,
                secret: testkit::secret(85),
            })
            .await
            .unwrap();

        let store = stack.store.clone();
        let alerted = testkit::wait_until(
            move || {
                let store = store.clone();
                async move { store.alerts_of_kind("atomicity_breach").await == 1 }
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(alerted, "no atomicity breach alert recorded");

        // Never auto-refunded, never silently dropped: the order stays
        // settling for the operator.
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Settling);
        assert_eq!(stack.harness.source.claim_submissions(&src_addr), 1);
        let escrow = stack.harness.source.escrow(&src_addr).unwrap();
        assert!(!escrow.claimed && !escrow.refunded);
    }

    #[tokio::test]
    async fn test_operator_cancel_respects_escrow_guard() {
        let stack = start_stack().await;
        let now = Utc::now();

        let intent = testkit::intent(
            86,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let order_id = stack.harness.source.announce_order(intent);
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::AuctionActive, 3).await);

        stack.engine.cancel_order(&order_id).await.unwrap();
        assert!(wait_for_status(&stack.store, order_id, OrderStatus::Cancelled, 3).await);
        let order = stack.store.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.cancel_reason, Some(CancelReason::Operator));

        let held = testkit::intent(
            87,
            1_000,
            950,
            now + ChronoDuration::seconds(30),
            now + ChronoDuration::seconds(3_600),
        );
        let held_id = stack.harness.source.announce_order(held);
        bid_when_open(&stack, held_id, 1_000, 940).await;
        assert!(wait_for_status(&stack.store, held_id, OrderStatus::DstEscrowCreated, 4).await);

        let refused = stack.engine.cancel_order(&held_id).await;
        assert!(matches!(
            refused,
            Err(RelayerError::InvalidStateTransition { .. })
        ));
        let held_order = stack.store.get_order(&held_id).await.unwrap().unwrap();
        assert_eq!(held_order.status, OrderStatus::DstEscrowCreated);
    }

    #[tokio::test]
    async fn test_refund_adopts_ledger_answers_without_store_rows() {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let settings = testkit::settings();
        let registry = Arc::new(BidRegistry::new(harness.pair.clone()));
        let engine = Arc::new(SwapEngine::new(
            &settings,
            harness.pair.clone(),
            store_dyn,
            registry,
        ));
        let now = Utc::now();

        // A claimed escrow the store has no row for: the local flags still
        // adopt the ledger's answer when the store write fails.
        let claimed_order = testkit::order(92, 1_000, 950);
        harness
            .source
            .submit(LedgerAction::CreateEscrow {
                order_id: claimed_order.id,
                depositor: claimed_order.maker_address.clone(),
                beneficiary: testkit::RESOLVER_ONE.to_string(),
                amount: U256::from(1_000u64),
                hashlock: claimed_order.hashlock,
                timelock: now + ChronoDuration::seconds(3_600),
            })
            .await
            .unwrap();
        let claimed_addr = harness.source.escrow_address(&claimed_order.id);
        harness
            .source
            .submit(LedgerAction::Claim {
                order_id: claimed_order.id,
                escrow_address: claimed_addr.clone(),
                secret: testkit::secret(92),
            })
            .await
            .unwrap();

        let mut escrow = Escrow {
            order_id: claimed_order.id,
            side: LedgerSide::Source,
            address: claimed_addr,
            amount: U256::from(1_000u64),
            hashlock: claimed_order.hashlock,
            timelock: now + ChronoDuration::seconds(3_600),
            claimed: false,
            refunded: false,
            deposit_tx: TxId("dep-92".to_string()),
            claim_tx: None,
            refund_tx: None,
            created_at: now,
        };
        engine.refund_leg(&claimed_order, &mut escrow).await;
        assert!(escrow.claimed && !escrow.refunded);

        // Same for an escrow another party already refunded.
        let refunded_order = testkit::order(93, 1_000, 950);
        harness
            .source
            .submit(LedgerAction::CreateEscrow {
                order_id: refunded_order.id,
                depositor: refunded_order.maker_address.clone(),
                beneficiary: testkit::RESOLVER_ONE.to_string(),
                amount: U256::from(1_000u64),
                hashlock: refunded_order.hashlock,
                timelock: now - ChronoDuration::seconds(1),
            })
            .await
            .unwrap();
        let refunded_addr = harness.source.escrow_address(&refunded_order.id);
        harness
            .source
            .submit(LedgerAction::Refund {
                order_id: refunded_order.id,
                escrow_address: refunded_addr.clone(),
            })
            .await
            .unwrap();

        let mut escrow = Escrow {
            order_id: refunded_order.id,
            side: LedgerSide::Source,
            address: refunded_addr,
            amount: U256::from(1_000u64),
            hashlock: refunded_order.hashlock,
            timelock: now - ChronoDuration::seconds(1),
            claimed: false,
            refunded: false,
            deposit_tx: TxId("dep-93".to_string()),
            claim_tx: None,
            refund_tx: None,
            created_at: now,
        };
        engine.refund_leg(&refunded_order, &mut escrow).await;
        assert!(escrow.refunded && !escrow.claimed);
    }
}
