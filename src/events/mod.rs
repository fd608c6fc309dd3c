//! Normalized ledger events
//!
//! Gateways translate their ledger's native logs into these variants; the
//! watcher forwards them on the event bus and the engine acts on them.

use serde::{Deserialize, Serialize};

use crate::types::{Hashlock, LedgerSide, OrderId, OrderIntent, Secret, TxId};
use alloy_primitives::U256;
use chrono::{DateTime, Utc};

/// Events observed on either ledger, tagged with the side they came from
/// and the cursor (block/round) they were read at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// New swap intent observed on the source ledger.
    OrderCreated {
        ledger: LedgerSide,
        intent: OrderIntent,
        cursor: u64,
        tx_id: TxId,
    },

    /// An escrow was funded.
    EscrowFunded {
        ledger: LedgerSide,
        order_id: OrderId,
        address: String,
        amount: U256,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
        cursor: u64,
        tx_id: TxId,
    },

    /// An escrow was claimed, revealing the secret.
    EscrowClaimed {
        ledger: LedgerSide,
        order_id: OrderId,
        address: String,
        secret: Secret,
        cursor: u64,
        tx_id: TxId,
    },

    /// An escrow was refunded to its depositor.
    EscrowRefunded {
        ledger: LedgerSide,
        order_id: OrderId,
        address: String,
        cursor: u64,
        tx_id: TxId,
    },
}

impl LedgerEvent {
    /// Which ledger this event was observed on
    pub fn ledger(&self) -> LedgerSide {
        match self {
            LedgerEvent::OrderCreated { ledger, .. } => *ledger,
            LedgerEvent::EscrowFunded { ledger, .. } => *ledger,
            LedgerEvent::EscrowClaimed { ledger, .. } => *ledger,
            LedgerEvent::EscrowRefunded { ledger, .. } => *ledger,
        }
    }

    /// Cursor (block/round) the event was read at
    pub fn cursor(&self) -> u64 {
        match self {
            LedgerEvent::OrderCreated { cursor, .. } => *cursor,
            LedgerEvent::EscrowFunded { cursor, .. } => *cursor,
            LedgerEvent::EscrowClaimed { cursor, .. } => *cursor,
            LedgerEvent::EscrowRefunded { cursor, .. } => *cursor,
        }
    }

    /// Event name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::OrderCreated { .. } => "OrderCreated",
            LedgerEvent::EscrowFunded { .. } => "EscrowFunded",
            LedgerEvent::EscrowClaimed { .. } => "EscrowClaimed",
            LedgerEvent::EscrowRefunded { .. } => "EscrowRefunded",
        }
    }

    /// The order an event belongs to. Derived from the intent fields for
    /// newly observed orders.
    pub fn order_id(&self) -> OrderId {
        match self {
            LedgerEvent::OrderCreated { intent, .. } => intent.derive_id(),
            LedgerEvent::EscrowFunded { order_id, .. } => *order_id,
            LedgerEvent::EscrowClaimed { order_id, .. } => *order_id,
            LedgerEvent::EscrowRefunded { order_id, .. } => *order_id,
        }
    }

    /// Whether the engine must act on this event. Funding confirmations are
    /// informational; the coordinator tracked the submission itself.
    pub fn requires_action(&self) -> bool {
        !matches!(self, LedgerEvent::EscrowFunded { .. })
    }
}
