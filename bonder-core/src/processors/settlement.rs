//! Settlement of committed bonds.
//!
//! A bond stays in flight on the ledger until the destination bridge
//! settles it against the committed root. Failures are retried with
//! backoff forever; an unsettled bond is locked bonder capital.

use super::bonding_engine::{BondingEngine, EngineError};
use crate::chain::abi::{AbiError, CallBuilder};
use crate::chain::types::{H256, TxHash, TxRequest};
use crate::entities::Transfer;
use crate::store::SubmissionFailure;
use bonder_sdk::objects::TransferState;
use tracing::{debug, info, warn};

pub const SETTLE_BONDED_WITHDRAWAL: &str = "settleBondedWithdrawal(address,bytes32,bytes32,uint256)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled { tx_hash: TxHash },
    Failed { tx_hash: Option<TxHash>, error: String },
    /// Leased by someone else, or no longer `Committed`.
    Busy,
}

pub(crate) fn settle_call(t: &Transfer, root: &H256) -> Result<Vec<u8>, AbiError> {
    let bonder = t.bonder.unwrap_or_default();
    Ok(CallBuilder::new(SETTLE_BONDED_WITHDRAWAL)
        .address(&bonder)
        .bytes32(&t.transfer_id)
        .bytes32(root)
        .amount(t.amount)?
        .finish())
}

impl BondingEngine {
    async fn fail_settle(
        &self,
        t: &Transfer,
        tx_hash: Option<TxHash>,
        error: String,
    ) -> Result<SettleOutcome, EngineError> {
        let failure = SubmissionFailure {
            tx_hash,
            error: error.clone(),
            retry_at: self.retry_at(t.attempts),
        };
        let retry_at = failure.retry_at;
        self.store
            .record_settle_failure(&t.transfer_id, self.owner, failure)
            .await?;
        warn!(
            transfer_id = %t.transfer_id,
            chain_id = %t.destination_chain,
            tx_hash = ?tx_hash,
            error = %error,
            attempts = t.attempts + 1,
            retry_at = %retry_at,
            "Settlement failed; will retry"
        );
        Ok(SettleOutcome::Failed { tx_hash, error })
    }

    /// Settle one `Committed` transfer this node bonded.
    pub async fn try_settle(&self, t: &Transfer) -> Result<SettleOutcome, EngineError> {
        let lease = self.config.engine.lock_lease;
        let Some(t) = self
            .store
            .try_lock_transfer(&t.transfer_id, self.owner, TransferState::Committed, lease)
            .await?
        else {
            debug!(transfer_id = %t.transfer_id, "Transfer busy or no longer Committed");
            return Ok(SettleOutcome::Busy);
        };

        let prepared = t
            .committed_root
            .filter(|_| t.bonder.is_some() && t.bond_reserved)
            .ok_or_else(|| EngineError::Store(crate::store::StoreError::Integrity {
                transfer_id: t.transfer_id,
                reason: "committed transfer without root or own bond".to_owned(),
            }))
            .and_then(|root| {
                self.check_lease(&t)?;
                Ok((self.route(&t)?, settle_call(&t, &root)?))
            });
        let (route, data) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let failure = SubmissionFailure {
                    tx_hash: None,
                    error: e.to_string(),
                    retry_at: self.retry_at(t.attempts),
                };
                if let Err(store) = self
                    .store
                    .record_settle_failure(&t.transfer_id, self.owner, failure)
                    .await
                {
                    warn!(transfer_id = %t.transfer_id, error = %store, "Failed to schedule retry");
                }
                return Err(e);
            }
        };

        let tx_hash = match route
            .chain
            .submit_transaction(TxRequest {
                from: route.bonder,
                to: route.bridge,
                data,
                value: 0,
                gas_limit: Some(route.settle_gas_limit),
            })
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => return self.fail_settle(&t, None, e.to_string()).await,
        };
        self.store
            .record_settle_tx(&t.transfer_id, self.owner, tx_hash)
            .await?;
        info!(transfer_id = %t.transfer_id, tx_hash = %tx_hash, "Settlement submitted");

        match route.chain.wait_for_confirmation(tx_hash).await {
            Ok(receipt) if receipt.success => {
                self.store
                    .confirm_settlement(&t.transfer_id, self.owner, tx_hash)
                    .await?;
                info!(
                    transfer_id = %t.transfer_id,
                    tx_hash = %tx_hash,
                    amount = %t.amount,
                    "Settlement confirmed"
                );
                Ok(SettleOutcome::Settled { tx_hash })
            }
            Ok(_) => {
                self.fail_settle(&t, Some(tx_hash), "transaction reverted".to_owned())
                    .await
            }
            Err(e) => self.fail_settle(&t, Some(tx_hash), e.to_string()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::selector;
    use crate::chain::types::Address;
    use crate::entities::transfer::fixtures::new_transfer;
    use time::OffsetDateTime;

    #[test]
    fn settle_call_layout() {
        let mut t = new_transfer(7, 100).into_transfer(OffsetDateTime::now_utc());
        t.bonder = Some(Address([0xb0; 20]));
        let data = settle_call(&t, &H256([0x99; 32])).unwrap();
        assert_eq!(data.len(), 4 + 4 * 32);
        assert_eq!(data[..4], selector(SETTLE_BONDED_WITHDRAWAL));
        assert_eq!(&data[4 + 12..4 + 32], &[0xb0; 20]);
        assert_eq!(&data[4 + 32..4 + 64], &[7; 32]);
        assert_eq!(&data[4 + 64..4 + 96], &[0x99; 32]);
    }
}
