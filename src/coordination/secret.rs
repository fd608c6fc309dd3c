//! Secret propagation
//!
//! The first claim on either leg makes the preimage public. From that moment
//! the swap's atomicity rests on getting the same preimage onto the
//! counterpart escrow before its timelock, so claims are pushed with the
//! pair's retry machinery and every terminal rejection is classified: an
//! `AlreadyClaimed` is success arriving by another route, a refunded or
//! expired escrow after the reveal is an atomicity breach.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{RejectReason, RelayerError, RelayerResult};
use crate::gateway::{LedgerAction, LedgerPair};
use crate::state::SwapStore;
use crate::types::{LedgerSide, Order, Secret, TxId};

/// What happened to a claim pushed at one leg.
#[derive(Debug)]
pub enum PropagationOutcome {
    /// Our claim landed.
    Claimed(TxId),
    /// Someone else's claim landed first; funds went where they should.
    AlreadyClaimed,
    /// The escrow can no longer be claimed even though the secret is public.
    Breach(String),
}

pub struct SecretCoordinator {
    pair: Arc<LedgerPair>,
    store: Arc<dyn SwapStore>,
}

impl SecretCoordinator {
    pub fn new(pair: Arc<LedgerPair>, store: Arc<dyn SwapStore>) -> Self {
        SecretCoordinator { pair, store }
    }

    /// Check a preimage against the order's hashlock.
    pub fn verify(order: &Order, secret: &Secret) -> RelayerResult<()> {
        if secret.matches(&order.hashlock) {
            Ok(())
        } else {
            Err(RelayerError::InvalidSecret {
                order_id: order.id.to_string(),
            })
        }
    }

    /// Push the revealed preimage at one leg's escrow.
    pub async fn claim_leg(
        &self,
        order: &Order,
        side: LedgerSide,
        secret: &Secret,
    ) -> RelayerResult<PropagationOutcome> {
        Self::verify(order, secret)?;

        let escrow_address = self.escrow_address_for(order, side).await?;
        let action = LedgerAction::Claim {
            order_id: order.id,
            escrow_address,
            secret: *secret,
        };

        match self.pair.submit_and_confirm(side, &action).await {
            Ok(receipt) => {
                if let Err(e) = self
                    .store
                    .set_escrow_claimed(&order.id, side, Some(&receipt.tx_id))
                    .await
                {
                    warn!(
                        "Failed to record {} claim for order {}: {}",
                        side, order.id, e
                    );
                }
                crate::metrics::record_claim(side.as_str());
                info!(
                    "Claimed {} escrow for order {} in {}",
                    side, order.id, receipt.tx_id
                );
                Ok(PropagationOutcome::Claimed(receipt.tx_id))
            }
            Err(RelayerError::Rejected { ledger, reason }) => match reason {
                RejectReason::AlreadyClaimed => {
                    debug!("{} escrow for order {} already claimed", side, order.id);
                    if let Err(e) = self.store.set_escrow_claimed(&order.id, side, None).await {
                        warn!(
                            "Failed to record {} claim for order {}: {}",
                            side, order.id, e
                        );
                    }
                    Ok(PropagationOutcome::AlreadyClaimed)
                }
                RejectReason::AlreadyRefunded | RejectReason::EscrowExpired => {
                    warn!(
                        "Cannot claim {} escrow for order {} after reveal: {}",
                        side, order.id, reason
                    );
                    Ok(PropagationOutcome::Breach(format!(
                        "{} escrow unclaimable after secret reveal: {}",
                        side, reason
                    )))
                }
                reason => Err(RelayerError::Rejected { ledger, reason }),
            },
            Err(e) => Err(e),
        }
    }

    /// The recorded escrow address, falling back to the deterministic one
    /// when the record is missing.
    async fn escrow_address_for(&self, order: &Order, side: LedgerSide) -> RelayerResult<String> {
        let escrows = self.store.escrows_for(&order.id).await?;
        if let Some(escrow) = escrows.into_iter().find(|escrow| escrow.side == side) {
            return Ok(escrow.address);
        }
        Ok(self.pair.gateway(side).escrow_address(&order.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::LedgerGateway;
    use crate::state::MemoryStore;
    use crate::testkit;
    use crate::types::{Escrow, Order};
    use alloy_primitives::U256;
    use chrono::{Duration as ChronoDuration, Utc};

    struct Fixture {
        harness: testkit::SimHarness,
        store: Arc<MemoryStore>,
        coordinator: SecretCoordinator,
    }

    fn fixture() -> Fixture {
        let harness = testkit::sim_pair();
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn SwapStore> = store.clone();
        let coordinator = SecretCoordinator::new(harness.pair.clone(), store_dyn);
        Fixture {
            harness,
            store,
            coordinator,
        }
    }

    /// Order with a funded source escrow, recorded in the store.
    async fn funded_order(fx: &Fixture, tag: u8, timelock_secs: i64) -> (Order, Secret, String) {
        let secret = testkit::secret(tag);
        let now = Utc::now();
        let intent = testkit::intent(
            tag,
            1_000,
            950,
            now + ChronoDuration::hours(1),
            now + ChronoDuration::seconds(timelock_secs),
        );
        let order = Order::from_intent(intent, now);
        fx.store.upsert_order(&order).await.unwrap();

        let timelock = now + ChronoDuration::seconds(timelock_secs);
        let action = LedgerAction::CreateEscrow {
            order_id: order.id,
            depositor: order.maker_address.clone(),
            beneficiary: testkit::RESOLVER_ONE.to_string(),
            amount: U256::from(1_000u64),
            hashlock: order.hashlock,
            timelock,
        };
        let receipt = fx
            .harness
            .pair
            .submit_and_confirm(LedgerSide::Source, &action)
            .await
            .unwrap();

        let address = fx.harness.source.escrow_address(&order.id);
        fx.store
            .record_escrow(&Escrow {
                order_id: order.id,
                side: LedgerSide::Source,
                address: address.clone(),
                amount: U256::from(1_000u64),
                hashlock: order.hashlock,
                timelock,
                claimed: false,
                refunded: false,
                deposit_tx: receipt.tx_id,
                claim_tx: None,
                refund_tx: None,
                created_at: now,
            })
            .await
            .unwrap();

        (order, secret, address)
    }

    #[tokio::test]
    async fn test_claim_pushes_preimage_and_flags_store() {
        let fx = fixture();
        let (order, secret, address) = funded_order(&fx, 61, 3_600).await;

        let outcome = fx
            .coordinator
            .claim_leg(&order, LedgerSide::Source, &secret)
            .await
            .unwrap();
        assert!(matches!(outcome, PropagationOutcome::Claimed(_)));
        assert!(fx.harness.source.escrow(&address).unwrap().claimed);
        assert!(fx.harness.source.preimage_used(&secret));

        let recorded = fx.store.escrows_for(&order.id).await.unwrap();
        assert!(recorded[0].claimed);
        assert!(recorded[0].claim_tx.is_some());
    }

    #[tokio::test]
    async fn test_repeat_claim_is_not_an_error() {
        let fx = fixture();
        let (order, secret, _) = funded_order(&fx, 62, 3_600).await;

        fx.coordinator
            .claim_leg(&order, LedgerSide::Source, &secret)
            .await
            .unwrap();
        let again = fx
            .coordinator
            .claim_leg(&order, LedgerSide::Source, &secret)
            .await
            .unwrap();
        assert!(matches!(again, PropagationOutcome::AlreadyClaimed));
    }

    #[tokio::test]
    async fn test_refunded_escrow_is_a_breach() {
        let fx = fixture();
        // Timelock already passed, so the refund goes through first.
        let (order, secret, address) = funded_order(&fx, 63, -1).await;
        fx.harness
            .pair
            .submit_and_confirm(
                LedgerSide::Source,
                &LedgerAction::Refund {
                    order_id: order.id,
                    escrow_address: address,
                },
            )
            .await
            .unwrap();

        let outcome = fx
            .coordinator
            .claim_leg(&order, LedgerSide::Source, &secret)
            .await
            .unwrap();
        match outcome {
            PropagationOutcome::Breach(detail) => {
                assert!(detail.contains("already refunded"));
            }
            other => panic!("expected breach, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_unclaimed_escrow_is_a_breach() {
        let fx = fixture();
        let (order, secret, _) = funded_order(&fx, 64, -1).await;

        let outcome = fx
            .coordinator
            .claim_leg(&order, LedgerSide::Source, &secret)
            .await
            .unwrap();
        assert!(matches!(outcome, PropagationOutcome::Breach(_)));
    }

    #[tokio::test]
    async fn test_wrong_preimage_never_submitted() {
        let fx = fixture();
        let (order, _, address) = funded_order(&fx, 65, 3_600).await;

        let wrong = testkit::secret(66);
        let result = fx
            .coordinator
            .claim_leg(&order, LedgerSide::Source, &wrong)
            .await;
        assert!(matches!(result, Err(RelayerError::InvalidSecret { .. })));
        assert_eq!(fx.harness.source.claim_submissions(&address), 0);
    }
}
