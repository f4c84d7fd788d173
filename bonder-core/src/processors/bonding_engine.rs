//! BondingEngine processor.
//!
//! The BondingEngine is responsible for:
//! - Picking up due `Sent` transfers and deciding bond or skip
//! - Bonding: lease, reserve liquidity, submit, wait, confirm or release
//! - Marking rejected transfers `Unbondable` with the reason
//! - Settling `Committed` transfers it bonded (see `settlement`)
//!
//! Per-transfer exclusivity comes from the store lease, so several engines
//! may run against the same store.

use crate::chain::abi::{AbiError, CallBuilder};
use crate::chain::types::{Address, TxHash, TxRequest};
use crate::chain::{ChainError, ChainRegistry};
use crate::config::BridgeConfig;
use crate::entities::{LedgerError, LiquidityLedger, Transfer};
use crate::events::WorkNoticeReceiver;
use crate::policy::{self, Decision, DeferReason, FeePolicy, GasAdjustedFeePolicy, PolicyInputs};
use crate::store::{BridgeStore, GasPriceStore, StoreError, SubmissionFailure};
use crate::utils::backoff::{calculate_retry_delay, with_jitter};
use bonder_sdk::objects::{ChainId, SkipReason, TokenSymbol, TransferState};
use futures_util::{StreamExt, stream};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const BOND_WITHDRAWAL: &str =
    "bondWithdrawalAndDistribute(address,uint256,bytes32,uint256,uint256,uint256)";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("abi error: {0}")]
    Abi(#[from] AbiError),

    #[error("chain {0} is not configured")]
    UnknownNetwork(ChainId),

    #[error("token {0} is not configured")]
    UnknownToken(TokenSymbol),

    #[error("no bridge contract for {token} on chain {chain_id}")]
    NoBridge { chain_id: ChainId, token: TokenSymbol },

    #[error("lease ends before a submission could confirm")]
    LeaseTooShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondOutcome {
    Bonded { tx_hash: TxHash },
    Skipped(SkipReason),
    /// Submission or confirmation failed; liquidity was released.
    Failed { tx_hash: Option<TxHash>, error: String },
    Deferred(DeferReason),
    /// Leased by someone else, or no longer `Sent`.
    Busy,
}

/// Tally of one engine cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub bonded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub busy: usize,
    pub settled: usize,
    pub settle_failed: usize,
    pub errors: usize,
}

/// Where a transfer gets bonded: the bonder account, the destination
/// bridge and the chain client.
pub(crate) struct Route {
    pub bonder: Address,
    pub bridge: Address,
    pub chain: Arc<dyn crate::chain::ChainAccess>,
    pub bond_gas_limit: u64,
    pub settle_gas_limit: u64,
}

pub struct BondingEngine {
    pub(crate) owner: Uuid,
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) chains: ChainRegistry,
    pub(crate) store: Arc<dyn BridgeStore>,
    gas: Arc<dyn GasPriceStore>,
    fees: Arc<dyn FeePolicy>,
    notices: Option<WorkNoticeReceiver>,
    shutdown_rx: watch::Receiver<bool>,
}

pub(crate) fn bond_call(t: &Transfer) -> Result<Vec<u8>, AbiError> {
    Ok(CallBuilder::new(BOND_WITHDRAWAL)
        .address(&t.recipient)
        .amount(t.amount)?
        .bytes32(&t.transfer_nonce)
        .amount(t.bonder_fee)?
        .amount(t.amount_out_min)?
        .timestamp(t.deadline)
        .finish())
}

impl BondingEngine {
    pub fn new(
        config: Arc<BridgeConfig>,
        chains: ChainRegistry,
        store: Arc<dyn BridgeStore>,
        gas: Arc<dyn GasPriceStore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            owner: Uuid::new_v4(),
            config,
            chains,
            store,
            gas,
            fees: Arc::new(GasAdjustedFeePolicy),
            notices: None,
            shutdown_rx,
        }
    }

    pub fn with_fee_policy(mut self, fees: Arc<dyn FeePolicy>) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_notices(mut self, notices: WorkNoticeReceiver) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Lease owner id of this engine instance.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub(crate) fn route(&self, t: &Transfer) -> Result<Route, EngineError> {
        let token = self
            .config
            .token(&t.token)
            .ok_or_else(|| EngineError::UnknownToken(t.token.clone()))?;
        let network = self
            .config
            .network(t.destination_chain)
            .ok_or(EngineError::UnknownNetwork(t.destination_chain))?;
        let bridge = network
            .bridge_for(&t.token)
            .ok_or_else(|| EngineError::NoBridge {
                chain_id: t.destination_chain,
                token: t.token.clone(),
            })?;
        Ok(Route {
            bonder: token.bonder,
            bridge,
            chain: self.chains.get(t.destination_chain)?,
            bond_gas_limit: network.bond_gas_limit,
            settle_gas_limit: network.settle_gas_limit,
        })
    }

    pub(crate) fn retry_at(&self, attempts: u32) -> OffsetDateTime {
        let settings = &self.config.engine;
        let delay = with_jitter(calculate_retry_delay(
            attempts,
            settings.retry_base,
            settings.retry_max,
        ));
        OffsetDateTime::now_utc() + delay
    }

    /// The lease on `t` must outlive one submission and its confirmation
    /// wait, or another engine could take it over mid-flight.
    pub(crate) fn check_lease(&self, t: &Transfer) -> Result<(), EngineError> {
        let timeouts = self.config.timeouts;
        let deadline = OffsetDateTime::now_utc() + timeouts.rpc + timeouts.confirmation;
        match t.lock_expires_at {
            Some(expires) if expires > deadline => Ok(()),
            _ => Err(EngineError::LeaseTooShort),
        }
    }

    /// Create every configured ledger that does not exist yet.
    pub async fn ensure_ledgers(&self) -> Result<Vec<LiquidityLedger>, EngineError> {
        let mut out = Vec::new();
        for (symbol, token) in &self.config.tokens {
            for (chain_id, route) in &token.routes {
                let key = crate::entities::LedgerKey {
                    chain_id: *chain_id,
                    token: symbol.clone(),
                    bonder: token.bonder,
                };
                out.push(self.store.ensure_ledger(&key, route.initial_stake).await?);
            }
        }
        Ok(out)
    }

    /// Decide bond or skip for `t` with the current ledger and gas sample.
    pub async fn evaluate(&self, t: &Transfer) -> Result<Decision, EngineError> {
        let token = self.config.token(&t.token);
        let ledger = match token {
            Some(policy) => self.store.ledger(&t.ledger_key_for(policy.bonder)).await?,
            None => None,
        };
        let gas = self.gas.latest_gas_sample(t.destination_chain).await?;
        Ok(policy::evaluate(
            &PolicyInputs {
                transfer: t,
                token,
                network: self.config.network(t.destination_chain),
                ledger: ledger.as_ref(),
                gas: gas.as_ref(),
                max_gas_age: self.config.sampler.max_sample_age(),
                now: OffsetDateTime::now_utc().unix_timestamp(),
            },
            self.fees.as_ref(),
        ))
    }

    async fn unlock(&self, t: &Transfer) {
        if let Err(e) = self.store.unlock_transfer(&t.transfer_id, self.owner).await {
            warn!(transfer_id = %t.transfer_id, error = %e, "Failed to release lease");
        }
    }

    /// Give up on a leased transfer after `error`: restore any reservation,
    /// record the attempt and push `next_attempt_at` out with backoff so the
    /// transfer leaves the head of the candidate queue.
    async fn back_off(&self, t: &Transfer, error: EngineError) -> EngineError {
        let failure = SubmissionFailure {
            tx_hash: None,
            error: error.to_string(),
            retry_at: self.retry_at(t.attempts),
        };
        let retry_at = failure.retry_at;
        match self
            .store
            .release_bond(&t.transfer_id, self.owner, failure)
            .await
        {
            Ok(_) => warn!(
                transfer_id = %t.transfer_id,
                error = %error,
                attempts = t.attempts + 1,
                retry_at = %retry_at,
                "Bond attempt aborted; retry scheduled"
            ),
            Err(e) => warn!(
                transfer_id = %t.transfer_id,
                error = %e,
                "Failed to schedule retry; lease left to expire"
            ),
        }
        error
    }

    async fn reject(&self, t: &Transfer, reason: SkipReason) -> Result<BondOutcome, EngineError> {
        self.store
            .mark_unbondable(&t.transfer_id, self.owner, reason)
            .await?;
        info!(
            transfer_id = %t.transfer_id,
            amount = %t.amount,
            reason = reason.as_str(),
            "Transfer marked unbondable"
        );
        Ok(BondOutcome::Skipped(reason))
    }

    async fn fail_bond(
        &self,
        t: &Transfer,
        tx_hash: Option<TxHash>,
        error: String,
    ) -> Result<BondOutcome, EngineError> {
        let failure = SubmissionFailure {
            tx_hash,
            error: error.clone(),
            retry_at: self.retry_at(t.attempts),
        };
        let retry_at = failure.retry_at;
        self.store
            .release_bond(&t.transfer_id, self.owner, failure)
            .await?;
        warn!(
            transfer_id = %t.transfer_id,
            chain_id = %t.destination_chain,
            tx_hash = ?tx_hash,
            error = %error,
            attempts = t.attempts + 1,
            retry_at = %retry_at,
            "Bond failed; liquidity released"
        );
        Ok(BondOutcome::Failed { tx_hash, error })
    }

    /// Evaluate and, if profitable, bond one transfer.
    pub async fn process_bond(&self, t: &Transfer) -> Result<BondOutcome, EngineError> {
        let lease = self.config.engine.lock_lease;
        let Some(t) = self
            .store
            .try_lock_transfer(&t.transfer_id, self.owner, TransferState::Sent, lease)
            .await?
        else {
            debug!(transfer_id = %t.transfer_id, "Transfer busy or no longer Sent");
            return Ok(BondOutcome::Busy);
        };

        let decision = match self.evaluate(&t).await {
            Ok(decision) => decision,
            Err(e) => return Err(self.back_off(&t, e).await),
        };
        match decision {
            Decision::Skip(reason) => self.reject(&t, reason).await,
            Decision::Defer(reason) => {
                info!(
                    transfer_id = %t.transfer_id,
                    reason = reason.as_str(),
                    "Bond decision deferred"
                );
                self.unlock(&t).await;
                Ok(BondOutcome::Deferred(reason))
            }
            Decision::Bond { projected_fee } => self.bond(&t, projected_fee).await,
        }
    }

    async fn bond(&self, t: &Transfer, projected_fee: Decimal) -> Result<BondOutcome, EngineError> {
        let prepared = self.route(t).and_then(|route| Ok((bond_call(t)?, route)));
        let (data, route) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.back_off(t, e).await),
        };

        match self
            .store
            .reserve_bond(&t.transfer_id, self.owner, route.bonder)
            .await
        {
            Ok(ledger) => {
                info!(
                    transfer_id = %t.transfer_id,
                    amount = %t.amount,
                    projected_fee = %projected_fee,
                    available = %ledger.available(),
                    in_flight = %ledger.in_flight,
                    "Liquidity reserved"
                );
            }
            Err(StoreError::Ledger {
                source: LedgerError::Insufficient { .. },
                ..
            }) => return self.reject(t, SkipReason::InsufficientLiquidity).await,
            Err(e) => return Err(self.back_off(t, e.into()).await),
        }
        if let Err(e) = self.check_lease(t) {
            return Err(self.back_off(t, e).await);
        }

        let tx_hash = match route
            .chain
            .submit_transaction(TxRequest {
                from: route.bonder,
                to: route.bridge,
                data,
                value: 0,
                gas_limit: Some(route.bond_gas_limit),
            })
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => return self.fail_bond(t, None, e.to_string()).await,
        };
        self.store
            .record_bond_tx(&t.transfer_id, self.owner, tx_hash)
            .await?;
        info!(transfer_id = %t.transfer_id, tx_hash = %tx_hash, "Bond submitted");

        match route.chain.wait_for_confirmation(tx_hash).await {
            Ok(receipt) if receipt.success => {
                self.store
                    .confirm_bond(&t.transfer_id, self.owner, tx_hash)
                    .await?;
                info!(
                    transfer_id = %t.transfer_id,
                    tx_hash = %tx_hash,
                    block = receipt.block_number,
                    "Bond confirmed"
                );
                Ok(BondOutcome::Bonded { tx_hash })
            }
            Ok(_) => self.fail_bond(t, Some(tx_hash), "transaction reverted".to_owned()).await,
            Err(e) => self.fail_bond(t, Some(tx_hash), e.to_string()).await,
        }
    }

    /// One pass over bond and settlement candidates.
    pub async fn run_once(&self) -> Result<CycleReport, EngineError> {
        let settings = self.config.engine;
        let mut report = CycleReport::default();

        let candidates = self.store.bond_candidates(settings.batch_size).await?;
        let outcomes: Vec<(Transfer, Result<BondOutcome, EngineError>)> = stream::iter(candidates)
            .map(|t| async move {
                let outcome = self.process_bond(&t).await;
                (t, outcome)
            })
            .buffer_unordered(settings.max_concurrent_bonds.max(1))
            .collect()
            .await;
        for (t, outcome) in outcomes {
            match outcome {
                Ok(BondOutcome::Bonded { .. }) => report.bonded += 1,
                Ok(BondOutcome::Skipped(_)) => report.skipped += 1,
                Ok(BondOutcome::Failed { .. }) => report.failed += 1,
                Ok(BondOutcome::Deferred(_)) => report.deferred += 1,
                Ok(BondOutcome::Busy) => report.busy += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(transfer_id = %t.transfer_id, error = %e, "Bond processing failed");
                }
            }
        }

        for t in self.store.settle_candidates(settings.batch_size).await? {
            match self.try_settle(&t).await {
                Ok(super::settlement::SettleOutcome::Settled { .. }) => report.settled += 1,
                Ok(super::settlement::SettleOutcome::Failed { .. }) => report.settle_failed += 1,
                Ok(_) => report.busy += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(transfer_id = %t.transfer_id, error = %e, "Settlement failed");
                }
            }
        }

        Ok(report)
    }

    /// Run the BondingEngine until shutdown.
    pub async fn run(mut self) {
        info!(owner = %self.owner, "BondingEngine started");

        match self.ensure_ledgers().await {
            Ok(ledgers) => info!(ledgers = ledgers.len(), "Ledgers ready"),
            Err(e) => error!(error = %e, "Failed to create ledgers"),
        }

        let mut notices = self.notices.take();
        let mut interval = tokio::time::interval(self.config.engine.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("BondingEngine received shutdown signal");
                        break;
                    }
                    continue;
                }

                Some(notice) = async {
                    match notices.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!(notice = ?notice, "Received WorkNotice");
                }

                _ = interval.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if report != CycleReport::default() => {
                    info!(report = ?report, "Engine cycle complete");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Engine cycle failed"),
            }
        }

        info!("BondingEngine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::selector;
    use crate::entities::transfer::fixtures::new_transfer;

    #[test]
    fn bond_call_layout() {
        let t = new_transfer(1, 100).into_transfer(OffsetDateTime::now_utc());
        let data = bond_call(&t).unwrap();
        assert_eq!(data.len(), 4 + 6 * 32);
        assert_eq!(data[..4], selector(BOND_WITHDRAWAL));
        // recipient, right-aligned in the first word
        assert_eq!(&data[4 + 12..4 + 32], &[0x11; 20]);
        // amount
        assert_eq!(data[4 + 63], 100);
        // nonce
        assert_eq!(&data[4 + 64..4 + 96], &[0x22; 32]);
        // no deadline goes back out as uint256 max
        assert_eq!(&data[4 + 160..4 + 192], &[0xff; 32]);
    }
}
