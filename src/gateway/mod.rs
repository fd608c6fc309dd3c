//! Ledger gateway interface and pair management
//!
//! The coordination core talks to each ledger through `LedgerGateway`; live
//! RPC connectors implement it out of tree, and `sim` provides the
//! in-process connector used for dry runs and tests. `LedgerPair` holds the
//! two sides, the shared event bus, and applies the central retry policy to
//! every call.

pub mod retry;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::{LedgerConfig, PairConfig, RelayerConfig};
use crate::error::RelayerResult;
use crate::events::LedgerEvent;
use crate::gateway::retry::{RetryPolicy, Throttle};
use crate::types::{Hashlock, LedgerSide, OrderId, Secret, TxId};

/// Event bus capacity, shared by both watchers.
const EVENT_CHANNEL_SIZE: usize = 10000;

/// An action the coordinator submits to a ledger.
#[derive(Debug, Clone)]
pub enum LedgerAction {
    /// Fund a hash-time-locked escrow.
    CreateEscrow {
        order_id: OrderId,
        depositor: String,
        beneficiary: String,
        amount: U256,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
    },
    /// Claim an escrow by revealing the preimage.
    Claim {
        order_id: OrderId,
        escrow_address: String,
        secret: Secret,
    },
    /// Return an expired escrow to its depositor.
    Refund {
        order_id: OrderId,
        escrow_address: String,
    },
}

impl LedgerAction {
    /// Action name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self {
            LedgerAction::CreateEscrow { .. } => "create_escrow",
            LedgerAction::Claim { .. } => "claim",
            LedgerAction::Refund { .. } => "refund",
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            LedgerAction::CreateEscrow { order_id, .. } => *order_id,
            LedgerAction::Claim { order_id, .. } => *order_id,
            LedgerAction::Refund { order_id, .. } => *order_id,
        }
    }
}

/// Confirmation receipt for a submitted transaction.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_id: TxId,
    pub cursor: u64,
    pub confirmations: u64,
}

/// One page of ledger events, plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub next_cursor: u64,
}

/// Interface to one ledger. Implementations own connection handling,
/// signing, and translation of native logs into `LedgerEvent`s.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    fn side(&self) -> LedgerSide;

    /// Deterministic escrow address for an order on this ledger. One escrow
    /// per order per side; connectors derive it the way their escrow
    /// contract does (counterfactual deployment).
    fn escrow_address(&self, order_id: &OrderId) -> String;

    /// Submit an action, returning the ledger transaction reference.
    async fn submit(&self, action: LedgerAction) -> RelayerResult<TxId>;

    /// Wait until the transaction has at least `min_confirmations`.
    async fn wait_for_confirmation(
        &self,
        tx_id: &TxId,
        min_confirmations: u64,
    ) -> RelayerResult<TxReceipt>;

    /// Events observed after `cursor`. Restartable: callers persist the
    /// returned `next_cursor` and resume from it after a restart.
    async fn events_from(&self, cursor: u64) -> RelayerResult<EventPage>;

    async fn balance_of(&self, account: &str) -> RelayerResult<U256>;

    /// Current head block/round.
    async fn head_cursor(&self) -> RelayerResult<u64>;
}

/// The two coordinated ledgers plus shared plumbing: event bus, retry
/// policy, and per-side throttles.
pub struct LedgerPair {
    source: Arc<dyn LedgerGateway>,
    destination: Arc<dyn LedgerGateway>,
    source_config: LedgerConfig,
    destination_config: LedgerConfig,
    retry: RetryPolicy,
    source_throttle: Arc<Throttle>,
    destination_throttle: Arc<Throttle>,
    event_tx: broadcast::Sender<LedgerEvent>,
}

impl LedgerPair {
    pub fn new(
        source: Arc<dyn LedgerGateway>,
        destination: Arc<dyn LedgerGateway>,
        pair_config: &PairConfig,
        relayer_config: &RelayerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cooldown = Duration::from_secs(relayer_config.rate_limit_cooldown_secs);

        let source_throttle = Arc::new(Throttle::new(
            &pair_config.source.name,
            Duration::from_millis(pair_config.source.poll_interval_ms),
            cooldown,
        ));
        let destination_throttle = Arc::new(Throttle::new(
            &pair_config.destination.name,
            Duration::from_millis(pair_config.destination.poll_interval_ms),
            cooldown,
        ));

        info!(
            "Ledger pair initialized: source={} destination={}",
            pair_config.source.name, pair_config.destination.name
        );

        LedgerPair {
            source,
            destination,
            source_config: pair_config.source.clone(),
            destination_config: pair_config.destination.clone(),
            retry: RetryPolicy::from_config(relayer_config),
            source_throttle,
            destination_throttle,
            event_tx,
        }
    }

    pub fn gateway(&self, side: LedgerSide) -> &Arc<dyn LedgerGateway> {
        match side {
            LedgerSide::Source => &self.source,
            LedgerSide::Destination => &self.destination,
        }
    }

    pub fn ledger_config(&self, side: LedgerSide) -> &LedgerConfig {
        match side {
            LedgerSide::Source => &self.source_config,
            LedgerSide::Destination => &self.destination_config,
        }
    }

    pub fn ledger_name(&self, side: LedgerSide) -> &str {
        &self.ledger_config(side).name
    }

    pub fn throttle(&self, side: LedgerSide) -> &Arc<Throttle> {
        match side {
            LedgerSide::Source => &self.source_throttle,
            LedgerSide::Destination => &self.destination_throttle,
        }
    }

    /// Subscribe to events from both ledgers
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.event_tx.subscribe()
    }

    /// Sender half of the event bus, used by the watchers
    pub fn event_sender(&self) -> broadcast::Sender<LedgerEvent> {
        self.event_tx.clone()
    }

    /// Submit an action under the retry policy.
    pub async fn submit_with_retry(
        &self,
        side: LedgerSide,
        action: &LedgerAction,
    ) -> RelayerResult<TxId> {
        let gateway = self.gateway(side).clone();
        let throttle = self.throttle(side);
        let name = self.ledger_name(side).to_string();
        let op = format!("{}:{}", name, action.name());

        let timer = crate::metrics::gateway_call_timer(&name, action.name());
        let result = self
            .retry
            .run(&op, throttle, || {
                let gateway = gateway.clone();
                let action = action.clone();
                async move { gateway.submit(action).await }
            })
            .await;
        timer.observe_duration();

        crate::metrics::record_gateway_submission(&name, action.name(), result.is_ok());
        result
    }

    /// Submit and wait for the configured confirmation depth.
    pub async fn submit_and_confirm(
        &self,
        side: LedgerSide,
        action: &LedgerAction,
    ) -> RelayerResult<TxReceipt> {
        let tx_id = self.submit_with_retry(side, action).await?;
        let confirmations = self.ledger_config(side).confirmations;
        let gateway = self.gateway(side).clone();
        let op = format!("{}:confirm", self.ledger_name(side));

        self.retry
            .run(&op, self.throttle(side), || {
                let tx_id = tx_id.clone();
                let gateway = gateway.clone();
                async move { gateway.wait_for_confirmation(&tx_id, confirmations).await }
            })
            .await
    }

    /// Live balance read, under the retry policy.
    pub async fn balance(&self, side: LedgerSide, account: &str) -> RelayerResult<U256> {
        let gateway = self.gateway(side).clone();
        let op = format!("{}:balance", self.ledger_name(side));
        let account = account.to_string();

        self.retry
            .run(&op, self.throttle(side), || {
                let gateway = gateway.clone();
                let account = account.clone();
                async move { gateway.balance_of(&account).await }
            })
            .await
    }

    /// Check connectivity of both ledgers
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut statuses = Vec::new();
        for side in [LedgerSide::Source, LedgerSide::Destination] {
            let healthy = self.gateway(side).head_cursor().await.is_ok();
            crate::metrics::set_ledger_health(self.ledger_name(side), healthy);
            statuses.push((self.ledger_name(side).to_string(), healthy));
        }
        statuses
    }
}
