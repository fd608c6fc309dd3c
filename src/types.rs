//! Shared data model for the swap coordination core:
//! orders, bids, escrows, secrets, and the per-order state machine.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use uuid::Uuid;

/// Which leg of the swap a ledger serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerSide {
    Source,
    Destination,
}

impl LedgerSide {
    pub fn counterpart(&self) -> LedgerSide {
        match self {
            LedgerSide::Source => LedgerSide::Destination,
            LedgerSide::Destination => LedgerSide::Source,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSide::Source => "source",
            LedgerSide::Destination => "destination",
        }
    }

    pub fn parse(s: &str) -> Option<LedgerSide> {
        match s {
            "source" => Some(LedgerSide::Source),
            "destination" => Some(LedgerSide::Destination),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn decode_hex32(s: &str) -> Result<[u8; 32], String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! hex32_newtype {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(s: &str) -> Result<Self, String> {
                decode_hex32(s).map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                decode_hex32(&s).map(Self).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Content-hash order identifier (keccak-256 over the canonical field encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderId([u8; 32]);
hex32_newtype!(OrderId);

/// Sha-256 commitment to a swap secret; the escrow unlock condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock([u8; 32]);
hex32_newtype!(Hashlock);

/// 32-byte preimage of a hashlock. Revealed once, then copied verbatim
/// to the counterpart leg's claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; 32]);
hex32_newtype!(Secret);

impl Secret {
    /// Sha-256 commitment to this preimage.
    pub fn hashlock(&self) -> Hashlock {
        let digest = Sha256::digest(self.0);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Hashlock(out)
    }

    pub fn matches(&self, hashlock: &Hashlock) -> bool {
        self.hashlock() == *hashlock
    }
}

/// Ledger transaction reference, in the ledger's native encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxId(pub String);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Detected,
    AuctionActive,
    BidsLocked,
    SrcEscrowCreated,
    DstEscrowCreated,
    Settling,
    Settled,
    ExpiredRefunded,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Detected => "detected",
            OrderStatus::AuctionActive => "auction_active",
            OrderStatus::BidsLocked => "bids_locked",
            OrderStatus::SrcEscrowCreated => "src_escrow_created",
            OrderStatus::DstEscrowCreated => "dst_escrow_created",
            OrderStatus::Settling => "settling",
            OrderStatus::Settled => "settled",
            OrderStatus::ExpiredRefunded => "expired_refunded",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "detected" => Some(OrderStatus::Detected),
            "auction_active" => Some(OrderStatus::AuctionActive),
            "bids_locked" => Some(OrderStatus::BidsLocked),
            "src_escrow_created" => Some(OrderStatus::SrcEscrowCreated),
            "dst_escrow_created" => Some(OrderStatus::DstEscrowCreated),
            "settling" => Some(OrderStatus::Settling),
            "settled" => Some(OrderStatus::Settled),
            "expired_refunded" => Some(OrderStatus::ExpiredRefunded),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Settled | OrderStatus::ExpiredRefunded | OrderStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Detected, AuctionActive) | (Detected, Cancelled) => true,
            (AuctionActive, BidsLocked) | (AuctionActive, Cancelled) => true,
            (BidsLocked, SrcEscrowCreated) | (BidsLocked, Cancelled) => true,
            (SrcEscrowCreated, DstEscrowCreated)
            | (SrcEscrowCreated, ExpiredRefunded)
            | (SrcEscrowCreated, Cancelled) => true,
            (DstEscrowCreated, Settling) | (DstEscrowCreated, ExpiredRefunded) => true,
            (Settling, Settled) | (Settling, ExpiredRefunded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code recorded when an order ends in `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    DeadlinePassed,
    NoBids,
    EscrowFailed,
    TimelockOrdering,
    Operator,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::DeadlinePassed => "deadline_passed",
            CancelReason::NoBids => "no_bids",
            CancelReason::EscrowFailed => "escrow_failed",
            CancelReason::TimelockOrdering => "timelock_ordering",
            CancelReason::Operator => "operator",
        }
    }

    pub fn parse(s: &str) -> Option<CancelReason> {
        match s {
            "deadline_passed" => Some(CancelReason::DeadlinePassed),
            "no_bids" => Some(CancelReason::NoBids),
            "escrow_failed" => Some(CancelReason::EscrowFailed),
            "timelock_ordering" => Some(CancelReason::TimelockOrdering),
            "operator" => Some(CancelReason::Operator),
            _ => None,
        }
    }
}

/// Partial-fill policy carried by an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFillPolicy {
    pub allowed: bool,
    pub min_fill: U256,
}

impl PartialFillPolicy {
    pub fn full_only() -> Self {
        PartialFillPolicy {
            allowed: false,
            min_fill: U256::ZERO,
        }
    }
}

/// Normalized new-order payload, as observed on the source ledger or
/// submitted by an operator. The order id is always derived from these
/// fields, never taken from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub maker_asset: String,
    pub taker_asset: String,
    pub maker_amount: U256,
    pub taker_amount: U256,
    pub maker_address: String,
    pub dst_address: String,
    pub deadline: DateTime<Utc>,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub partial_fill: PartialFillPolicy,
}

impl OrderIntent {
    /// Canonical content hash of the defining fields. Length-prefixed
    /// string fields keep the encoding unambiguous.
    pub fn derive_id(&self) -> OrderId {
        let mut hasher = Keccak256::new();
        for field in [
            &self.maker_asset,
            &self.taker_asset,
            &self.maker_address,
            &self.dst_address,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(self.maker_amount.to_be_bytes::<32>());
        hasher.update(self.taker_amount.to_be_bytes::<32>());
        hasher.update(self.deadline.timestamp().to_be_bytes());
        hasher.update(self.hashlock.as_bytes());
        hasher.update(self.timelock.timestamp().to_be_bytes());
        hasher.update([self.partial_fill.allowed as u8]);
        hasher.update(self.partial_fill.min_fill.to_be_bytes::<32>());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        OrderId(out)
    }
}

/// A swap order under coordination. Immutable except for status,
/// remaining amount, winner, revealed secret, and cancel reason. The
/// mutable fields are exactly what recovery needs to re-enter the state
/// machine after a restart.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub maker_asset: String,
    pub taker_asset: String,
    pub maker_amount: U256,
    pub taker_amount: U256,
    pub maker_address: String,
    pub dst_address: String,
    pub deadline: DateTime<Utc>,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub partial_fill: PartialFillPolicy,
    pub status: OrderStatus,
    pub remaining_amount: U256,
    pub auction_start: Option<DateTime<Utc>>,
    pub winning_bid: Option<WinningBid>,
    pub revealed_secret: Option<Secret>,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn from_intent(intent: OrderIntent, now: DateTime<Utc>) -> Self {
        let id = intent.derive_id();
        Order {
            id,
            maker_asset: intent.maker_asset,
            taker_asset: intent.taker_asset,
            maker_amount: intent.maker_amount,
            taker_amount: intent.taker_amount,
            maker_address: intent.maker_address,
            dst_address: intent.dst_address,
            deadline: intent.deadline,
            hashlock: intent.hashlock,
            timelock: intent.timelock,
            partial_fill: intent.partial_fill,
            status: OrderStatus::Detected,
            remaining_amount: intent.maker_amount,
            auction_start: None,
            winning_bid: None,
            revealed_secret: None,
            cancel_reason: None,
            created_at: now,
        }
    }
}

/// The bid that won an order's auction. Persisted so escrow amounts
/// survive a restart; losing bids are not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinningBid {
    pub resolver: String,
    pub input_amount: U256,
    pub output_amount: U256,
}

impl From<&Bid> for WinningBid {
    fn from(bid: &Bid) -> Self {
        WinningBid {
            resolver: bid.resolver.clone(),
            input_amount: bid.input_amount,
            output_amount: bid.output_amount,
        }
    }
}

/// A resolver's offer on an order. Only the active flag ever changes.
#[derive(Debug, Clone, Serialize)]
pub struct Bid {
    pub id: Uuid,
    pub order_id: OrderId,
    pub resolver: String,
    pub input_amount: U256,
    pub output_amount: U256,
    pub gas_estimate: u64,
    pub timestamp: DateTime<Utc>,
    pub active: bool,
}

impl Bid {
    pub fn new(
        order_id: OrderId,
        resolver: &str,
        input_amount: U256,
        output_amount: U256,
        gas_estimate: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Bid {
            id: Uuid::new_v4(),
            order_id,
            resolver: resolver.to_string(),
            input_amount,
            output_amount,
            gas_estimate,
            timestamp,
            active: true,
        }
    }
}

/// One leg's hash-time-locked escrow. Terminal once claimed or refunded;
/// the two flags are mutually exclusive.
#[derive(Debug, Clone)]
pub struct Escrow {
    pub order_id: OrderId,
    pub side: LedgerSide,
    pub address: String,
    pub amount: U256,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub claimed: bool,
    pub refunded: bool,
    pub deposit_tx: TxId,
    pub claim_tx: Option<TxId>,
    pub refund_tx: Option<TxId>,
    pub created_at: DateTime<Utc>,
}

impl Escrow {
    pub fn is_open(&self) -> bool {
        !self.claimed && !self.refunded
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.timelock <= now
    }
}
