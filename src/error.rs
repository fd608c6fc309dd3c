//! Error types for the Fusion Relayer

use thiserror::Error;

use crate::types::LedgerSide;

/// Reason a ledger rejected a submitted action outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    AlreadyClaimed,
    AlreadyRefunded,
    RefundTooEarly,
    EscrowExpired,
    EscrowNotFound,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AlreadyClaimed => write!(f, "already claimed"),
            RejectReason::AlreadyRefunded => write!(f, "already refunded"),
            RejectReason::RefundTooEarly => write!(f, "refund before timelock"),
            RejectReason::EscrowExpired => write!(f, "escrow expired"),
            RejectReason::EscrowNotFound => write!(f, "escrow not found"),
            RejectReason::Other(detail) => write!(f, "{}", detail),
        }
    }
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error on {ledger} ledger: {message}")]
    Network { ledger: LedgerSide, message: String },

    #[error("Rate limited on {ledger} ledger")]
    RateLimited { ledger: LedgerSide },

    #[error("Transaction rejected on {ledger} ledger: {reason}")]
    Rejected {
        ledger: LedgerSide,
        reason: RejectReason,
    },

    #[error("Insufficient funds on {ledger} ledger: have {have}, need {need}")]
    InsufficientFunds {
        ledger: LedgerSide,
        have: String,
        need: String,
    },

    #[error("Invalid secret for order {order_id}: preimage does not match hashlock")]
    InvalidSecret { order_id: String },

    #[error("Timelock ordering violation: {0}")]
    TimelockOrdering(String),

    #[error("Atomicity breach on order {order_id}: {detail}")]
    AtomicityBreach { order_id: String, detail: String },

    #[error("Bid rejected: {0}")]
    BidRejected(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("No {side} escrow recorded for order {order_id}")]
    EscrowNotFound { order_id: String, side: LedgerSide },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Network { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::RateLimited { .. }
        )
    }

    /// Check if error should trigger an operator alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientFunds { .. } | RelayerError::AtomicityBreach { .. }
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
