//! In-process simulated ledger
//!
//! Implements `LedgerGateway` against an in-memory HTLC ledger that enforces
//! the same rules as the on-chain escrow contracts: claims need a sha256
//! preimage match before the timelock, refunds are only valid after it, and
//! the claimed/refunded flags are mutually exclusive and final. Used for
//! dry-run operation and as the test harness; typed rejections let callers
//! exercise their idempotency and breach paths exactly as against a live
//! ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{RejectReason, RelayerError, RelayerResult};
use crate::events::LedgerEvent;
use crate::gateway::{EventPage, LedgerAction, LedgerGateway, TxReceipt};
use crate::types::{Hashlock, LedgerSide, OrderId, OrderIntent, Secret, TxId};

/// Failure injected ahead of the next submission.
#[derive(Debug, Clone)]
pub enum SimFailure {
    Network,
    RateLimited,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct SimEscrow {
    pub order_id: OrderId,
    pub address: String,
    pub depositor: String,
    pub beneficiary: String,
    pub amount: U256,
    pub hashlock: Hashlock,
    pub timelock: DateTime<Utc>,
    pub claimed: bool,
    pub refunded: bool,
}

struct SimState {
    cursor: u64,
    tx_counter: u64,
    events: Vec<LedgerEvent>,
    escrows: HashMap<String, SimEscrow>,
    balances: HashMap<String, U256>,
    used_preimages: HashSet<[u8; 32]>,
    injected_failures: VecDeque<SimFailure>,
    refund_submissions: HashMap<String, u32>,
    claim_submissions: HashMap<String, u32>,
    submission_log: Vec<String>,
}

pub struct SimulatedLedger {
    side: LedgerSide,
    name: String,
    /// Source-side escrows draw on funds the order intent already committed,
    /// so unknown depositors are provisioned on first use. Destination-side
    /// resolver capital must be credited explicitly.
    auto_fund_depositors: bool,
    state: Mutex<SimState>,
}

impl SimulatedLedger {
    pub fn new(side: LedgerSide, name: &str, auto_fund_depositors: bool) -> Self {
        SimulatedLedger {
            side,
            name: name.to_string(),
            auto_fund_depositors,
            state: Mutex::new(SimState {
                cursor: 0,
                tx_counter: 0,
                events: Vec::new(),
                escrows: HashMap::new(),
                balances: HashMap::new(),
                used_preimages: HashSet::new(),
                injected_failures: VecDeque::new(),
                refund_submissions: HashMap::new(),
                claim_submissions: HashMap::new(),
                submission_log: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Credit an account balance (resolver capital, maker funds).
    pub fn credit(&self, account: &str, amount: U256) {
        let mut state = self.lock();
        let entry = state.balances.entry(account.to_string()).or_insert(U256::ZERO);
        *entry = entry.saturating_add(amount);
    }

    /// Record an externally observed swap intent and emit its event.
    pub fn announce_order(&self, intent: OrderIntent) -> OrderId {
        let order_id = intent.derive_id();
        let mut state = self.lock();
        state.cursor += 1;
        state.tx_counter += 1;
        let tx_id = TxId(format!("sim-{}-{}", self.name, state.tx_counter));
        let cursor = state.cursor;
        state.events.push(LedgerEvent::OrderCreated {
            ledger: self.side,
            intent,
            cursor,
            tx_id,
        });
        order_id
    }

    /// Queue a failure for the next submission.
    pub fn fail_next(&self, failure: SimFailure) {
        self.lock().injected_failures.push_back(failure);
    }

    pub fn escrow(&self, address: &str) -> Option<SimEscrow> {
        self.lock().escrows.get(address).cloned()
    }

    pub fn refund_submissions(&self, address: &str) -> u32 {
        self.lock().refund_submissions.get(address).copied().unwrap_or(0)
    }

    pub fn claim_submissions(&self, address: &str) -> u32 {
        self.lock().claim_submissions.get(address).copied().unwrap_or(0)
    }

    pub fn submission_log(&self) -> Vec<String> {
        self.lock().submission_log.clone()
    }

    pub fn preimage_used(&self, secret: &Secret) -> bool {
        self.lock().used_preimages.contains(secret.as_bytes())
    }

    fn next_tx(&self, state: &mut SimState) -> TxId {
        state.tx_counter += 1;
        TxId(format!("sim-{}-{}", self.name, state.tx_counter))
    }

    fn rejected(&self, reason: RejectReason) -> RelayerError {
        RelayerError::Rejected {
            ledger: self.side,
            reason,
        }
    }

    fn apply_create(
        &self,
        state: &mut SimState,
        order_id: OrderId,
        depositor: String,
        beneficiary: String,
        amount: U256,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
    ) -> RelayerResult<TxId> {
        let address = self.escrow_address(&order_id);
        if state.escrows.contains_key(&address) {
            return Err(self.rejected(RejectReason::Other(format!(
                "escrow {} already exists",
                address
            ))));
        }

        let have = state.balances.get(&depositor).copied().unwrap_or(U256::ZERO);
        if have < amount {
            if self.auto_fund_depositors {
                state.balances.insert(depositor.clone(), amount);
            } else {
                return Err(RelayerError::InsufficientFunds {
                    ledger: self.side,
                    have: have.to_string(),
                    need: amount.to_string(),
                });
            }
        }
        let balance = state
            .balances
            .get_mut(&depositor)
            .ok_or_else(|| RelayerError::Internal("depositor vanished".to_string()))?;
        *balance -= amount;

        state.escrows.insert(
            address.clone(),
            SimEscrow {
                order_id,
                address: address.clone(),
                depositor,
                beneficiary,
                amount,
                hashlock,
                timelock,
                claimed: false,
                refunded: false,
            },
        );

        let tx_id = self.next_tx(state);
        state.cursor += 1;
        let cursor = state.cursor;
        state.events.push(LedgerEvent::EscrowFunded {
            ledger: self.side,
            order_id,
            address,
            amount,
            hashlock,
            timelock,
            cursor,
            tx_id: tx_id.clone(),
        });
        Ok(tx_id)
    }

    fn apply_claim(
        &self,
        state: &mut SimState,
        order_id: OrderId,
        escrow_address: String,
        secret: Secret,
    ) -> RelayerResult<TxId> {
        let now = Utc::now();
        let escrow = match state.escrows.get(&escrow_address) {
            Some(escrow) => escrow.clone(),
            None => return Err(self.rejected(RejectReason::EscrowNotFound)),
        };
        if escrow.claimed {
            return Err(self.rejected(RejectReason::AlreadyClaimed));
        }
        if escrow.refunded {
            return Err(self.rejected(RejectReason::AlreadyRefunded));
        }
        if now >= escrow.timelock {
            return Err(self.rejected(RejectReason::EscrowExpired));
        }
        if !secret.matches(&escrow.hashlock) {
            return Err(RelayerError::InvalidSecret {
                order_id: order_id.to_string(),
            });
        }

        let beneficiary = escrow.beneficiary.clone();
        let amount = escrow.amount;
        if let Some(entry) = state.escrows.get_mut(&escrow_address) {
            entry.claimed = true;
        }
        state.used_preimages.insert(*secret.as_bytes());
        let balance = state
            .balances
            .entry(beneficiary)
            .or_insert(U256::ZERO);
        *balance = balance.saturating_add(amount);

        let tx_id = self.next_tx(state);
        state.cursor += 1;
        let cursor = state.cursor;
        state.events.push(LedgerEvent::EscrowClaimed {
            ledger: self.side,
            order_id,
            address: escrow_address,
            secret,
            cursor,
            tx_id: tx_id.clone(),
        });
        Ok(tx_id)
    }

    fn apply_refund(
        &self,
        state: &mut SimState,
        order_id: OrderId,
        escrow_address: String,
    ) -> RelayerResult<TxId> {
        let now = Utc::now();
        let escrow = match state.escrows.get(&escrow_address) {
            Some(escrow) => escrow.clone(),
            None => return Err(self.rejected(RejectReason::EscrowNotFound)),
        };
        if escrow.claimed {
            return Err(self.rejected(RejectReason::AlreadyClaimed));
        }
        if escrow.refunded {
            return Err(self.rejected(RejectReason::AlreadyRefunded));
        }
        if now < escrow.timelock {
            return Err(self.rejected(RejectReason::RefundTooEarly));
        }

        let depositor = escrow.depositor.clone();
        let amount = escrow.amount;
        if let Some(entry) = state.escrows.get_mut(&escrow_address) {
            entry.refunded = true;
        }
        let balance = state.balances.entry(depositor).or_insert(U256::ZERO);
        *balance = balance.saturating_add(amount);

        let tx_id = self.next_tx(state);
        state.cursor += 1;
        let cursor = state.cursor;
        state.events.push(LedgerEvent::EscrowRefunded {
            ledger: self.side,
            order_id,
            address: escrow_address,
            cursor,
            tx_id: tx_id.clone(),
        });
        Ok(tx_id)
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    fn side(&self) -> LedgerSide {
        self.side
    }

    fn escrow_address(&self, order_id: &OrderId) -> String {
        let id_hex = order_id.to_string();
        format!("{}-escrow-{}", self.name, &id_hex[..16])
    }

    async fn submit(&self, action: LedgerAction) -> RelayerResult<TxId> {
        let mut state = self.lock();

        match &action {
            LedgerAction::Claim { escrow_address, .. } => {
                *state
                    .claim_submissions
                    .entry(escrow_address.clone())
                    .or_insert(0) += 1;
            }
            LedgerAction::Refund { escrow_address, .. } => {
                *state
                    .refund_submissions
                    .entry(escrow_address.clone())
                    .or_insert(0) += 1;
            }
            LedgerAction::CreateEscrow { .. } => {}
        }
        let log_entry = format!("{}:{}", action.name(), action.order_id());
        state.submission_log.push(log_entry);

        if let Some(failure) = state.injected_failures.pop_front() {
            return Err(match failure {
                SimFailure::Network => RelayerError::Network {
                    ledger: self.side,
                    message: "injected network failure".to_string(),
                },
                SimFailure::RateLimited => RelayerError::RateLimited { ledger: self.side },
                SimFailure::Rejected(reason) => self.rejected(reason),
            });
        }

        match action {
            LedgerAction::CreateEscrow {
                order_id,
                depositor,
                beneficiary,
                amount,
                hashlock,
                timelock,
            } => self.apply_create(
                &mut state, order_id, depositor, beneficiary, amount, hashlock, timelock,
            ),
            LedgerAction::Claim {
                order_id,
                escrow_address,
                secret,
            } => self.apply_claim(&mut state, order_id, escrow_address, secret),
            LedgerAction::Refund {
                order_id,
                escrow_address,
            } => self.apply_refund(&mut state, order_id, escrow_address),
        }
    }

    async fn wait_for_confirmation(
        &self,
        tx_id: &TxId,
        min_confirmations: u64,
    ) -> RelayerResult<TxReceipt> {
        let state = self.lock();
        Ok(TxReceipt {
            tx_id: tx_id.clone(),
            cursor: state.cursor,
            confirmations: min_confirmations,
        })
    }

    async fn events_from(&self, cursor: u64) -> RelayerResult<EventPage> {
        let state = self.lock();
        let events = state
            .events
            .iter()
            .filter(|event| event.cursor() > cursor)
            .cloned()
            .collect();
        Ok(EventPage {
            events,
            next_cursor: state.cursor,
        })
    }

    async fn balance_of(&self, account: &str) -> RelayerResult<U256> {
        Ok(self.lock().balances.get(account).copied().unwrap_or(U256::ZERO))
    }

    async fn head_cursor(&self) -> RelayerResult<u64> {
        Ok(self.lock().cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn escrow_action(
        order_id: OrderId,
        hashlock: Hashlock,
        timelock: DateTime<Utc>,
    ) -> LedgerAction {
        LedgerAction::CreateEscrow {
            order_id,
            depositor: "resolver-one".to_string(),
            beneficiary: "maker-dest".to_string(),
            amount: U256::from(500u64),
            hashlock,
            timelock,
        }
    }

    fn order_id(tag: u8) -> OrderId {
        OrderId::from_bytes([tag; 32])
    }

    #[tokio::test]
    async fn test_claim_requires_matching_preimage() {
        let ledger = SimulatedLedger::new(LedgerSide::Destination, "algo-sim", false);
        ledger.credit("resolver-one", U256::from(1_000u64));

        let secret = Secret::from_bytes([9u8; 32]);
        let id = order_id(1);
        let timelock = Utc::now() + ChronoDuration::seconds(60);
        ledger
            .submit(escrow_action(id, secret.hashlock(), timelock))
            .await
            .unwrap();
        let address = ledger.escrow_address(&id);

        let wrong = ledger
            .submit(LedgerAction::Claim {
                order_id: id,
                escrow_address: address.clone(),
                secret: Secret::from_bytes([8u8; 32]),
            })
            .await;
        assert!(matches!(wrong, Err(RelayerError::InvalidSecret { .. })));

        let right = ledger
            .submit(LedgerAction::Claim {
                order_id: id,
                escrow_address: address.clone(),
                secret,
            })
            .await;
        assert!(right.is_ok());
        assert!(ledger.escrow(&address).unwrap().claimed);
        assert!(ledger.preimage_used(&secret));
        assert_eq!(
            ledger.balance_of("maker-dest").await.unwrap(),
            U256::from(500u64)
        );
    }

    #[tokio::test]
    async fn test_refund_gated_by_timelock() {
        let ledger = SimulatedLedger::new(LedgerSide::Source, "evm-sim", true);
        let id = order_id(2);
        let hashlock = Secret::from_bytes([1u8; 32]).hashlock();

        let timelock = Utc::now() + ChronoDuration::seconds(60);
        ledger
            .submit(escrow_action(id, hashlock, timelock))
            .await
            .unwrap();
        let address = ledger.escrow_address(&id);

        let early = ledger
            .submit(LedgerAction::Refund {
                order_id: id,
                escrow_address: address.clone(),
            })
            .await;
        assert!(matches!(
            early,
            Err(RelayerError::Rejected {
                reason: RejectReason::RefundTooEarly,
                ..
            })
        ));

        // Past-timelock escrow refunds, once.
        let id2 = order_id(3);
        let expired = Utc::now() - ChronoDuration::seconds(1);
        ledger
            .submit(escrow_action(id2, hashlock, expired))
            .await
            .unwrap();
        let address2 = ledger.escrow_address(&id2);
        ledger
            .submit(LedgerAction::Refund {
                order_id: id2,
                escrow_address: address2.clone(),
            })
            .await
            .unwrap();
        let again = ledger
            .submit(LedgerAction::Refund {
                order_id: id2,
                escrow_address: address2.clone(),
            })
            .await;
        assert!(matches!(
            again,
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyRefunded,
                ..
            })
        ));
        assert_eq!(ledger.refund_submissions(&address2), 2);
    }

    #[tokio::test]
    async fn test_claim_and_refund_mutually_exclusive() {
        let ledger = SimulatedLedger::new(LedgerSide::Destination, "algo-sim", true);
        let secret = Secret::from_bytes([5u8; 32]);
        let id = order_id(4);
        let timelock = Utc::now() + ChronoDuration::seconds(60);
        ledger
            .submit(escrow_action(id, secret.hashlock(), timelock))
            .await
            .unwrap();
        let address = ledger.escrow_address(&id);

        ledger
            .submit(LedgerAction::Claim {
                order_id: id,
                escrow_address: address.clone(),
                secret,
            })
            .await
            .unwrap();

        let refund = ledger
            .submit(LedgerAction::Refund {
                order_id: id,
                escrow_address: address.clone(),
            })
            .await;
        assert!(matches!(
            refund,
            Err(RelayerError::Rejected {
                reason: RejectReason::AlreadyClaimed,
                ..
            })
        ));
        let escrow = ledger.escrow(&address).unwrap();
        assert!(escrow.claimed && !escrow.refunded);
    }

    #[tokio::test]
    async fn test_destination_requires_funded_depositor() {
        let ledger = SimulatedLedger::new(LedgerSide::Destination, "algo-sim", false);
        let id = order_id(6);
        let hashlock = Secret::from_bytes([2u8; 32]).hashlock();
        let result = ledger
            .submit(escrow_action(id, hashlock, Utc::now() + ChronoDuration::seconds(60)))
            .await;
        assert!(matches!(result, Err(RelayerError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn test_injected_failures_consumed_in_order() {
        let ledger = SimulatedLedger::new(LedgerSide::Source, "evm-sim", true);
        ledger.fail_next(SimFailure::Network);
        ledger.fail_next(SimFailure::RateLimited);

        let id = order_id(7);
        let hashlock = Secret::from_bytes([3u8; 32]).hashlock();
        let action = escrow_action(id, hashlock, Utc::now() + ChronoDuration::seconds(60));

        assert!(matches!(
            ledger.submit(action.clone()).await,
            Err(RelayerError::Network { .. })
        ));
        assert!(matches!(
            ledger.submit(action.clone()).await,
            Err(RelayerError::RateLimited { .. })
        ));
        assert!(ledger.submit(action).await.is_ok());
    }

    #[tokio::test]
    async fn test_events_restartable_from_cursor() {
        let ledger = SimulatedLedger::new(LedgerSide::Source, "evm-sim", true);
        let hashlock = Secret::from_bytes([4u8; 32]).hashlock();
        for tag in 10..13u8 {
            ledger
                .submit(escrow_action(
                    order_id(tag),
                    hashlock,
                    Utc::now() + ChronoDuration::seconds(60),
                ))
                .await
                .unwrap();
        }

        let all = ledger.events_from(0).await.unwrap();
        assert_eq!(all.events.len(), 3);
        assert_eq!(all.next_cursor, 3);

        let tail = ledger.events_from(2).await.unwrap();
        assert_eq!(tail.events.len(), 1);
        assert_eq!(tail.events[0].cursor(), 3);
    }
}
