//! In-process store used by tests and single-binary dry runs.
//!
//! State sits behind one async mutex, so every call is atomic with respect
//! to every other. Multi-row operations work on copies and only swap them
//! in once the whole operation succeeded.

use super::transitions::{self, LeaseOutcome};
use super::{
    BlockRangeBatch, BridgeStore, GasPriceStore, RangeOutcome, StoreError, SubmissionFailure,
};
use crate::chain::types::{Address, H256, TxHash};
use crate::entities::{
    BondAttempt, BondObservation, ChainCheckpoint, GasPriceSample, LedgerKey, LiquidityLedger,
    NewBondAttempt, Transfer,
};
use crate::events::{BridgeEvent, ObservedEvent};
use async_trait::async_trait;
use bonder_sdk::objects::{ChainId, SkipReason, TransferState};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    checkpoints: HashMap<ChainId, ChainCheckpoint>,
    transfers: HashMap<H256, Transfer>,
    ledgers: BTreeMap<LedgerKey, LiquidityLedger>,
    observations: HashMap<H256, BondObservation>,
    attempts: Vec<BondAttempt>,
    gas_samples: Vec<GasPriceSample>,
}

impl MemoryState {
    /// Apply `rule` to a copy of the transfer (and of the ledger named by
    /// `key`), writing both back only if the rule succeeds.
    fn mutate<R>(
        &mut self,
        transfer_id: &H256,
        key: impl FnOnce(&Transfer) -> Option<LedgerKey>,
        rule: impl FnOnce(&mut Transfer, Option<&mut LiquidityLedger>) -> Result<R, StoreError>,
    ) -> Result<(Transfer, R), StoreError> {
        let mut transfer = self
            .transfers
            .get(transfer_id)
            .cloned()
            .ok_or(StoreError::TransferNotFound(*transfer_id))?;
        let mut ledger = key(&transfer).and_then(|k| self.ledgers.get(&k).cloned());
        let out = rule(&mut transfer, ledger.as_mut())?;
        if let Some(ledger) = ledger {
            self.ledgers.insert(ledger.key.clone(), ledger);
        }
        self.transfers.insert(*transfer_id, transfer.clone());
        Ok((transfer, out))
    }

    fn push_attempt(&mut self, attempt: NewBondAttempt) {
        let id = self.attempts.len() as i64 + 1;
        self.attempts.push(BondAttempt {
            id,
            transfer_id: attempt.transfer_id,
            kind: attempt.kind,
            tx_hash: attempt.tx_hash,
            error: attempt.error,
            attempted_at: attempt.attempted_at,
        });
    }

    fn sorted(&self, filter: impl Fn(&Transfer) -> bool, limit: usize) -> Vec<Transfer> {
        let mut out: Vec<Transfer> = self.transfers.values().filter(|t| filter(t)).cloned().collect();
        out.sort_by(|a, b| {
            (a.created_at, a.transfer_id.as_bytes()).cmp(&(b.created_at, b.transfer_id.as_bytes()))
        });
        out.truncate(limit);
        out
    }

    fn apply_event(
        &mut self,
        observed: &ObservedEvent,
        now: OffsetDateTime,
        outcome: &mut RangeOutcome,
    ) -> Result<(), StoreError> {
        let meta = &observed.meta;
        match &observed.event {
            BridgeEvent::TransferSent(sent) => {
                if self.transfers.contains_key(&sent.transfer_id) {
                    return Ok(());
                }
                let transfer = sent.to_new_transfer(meta).into_transfer(now);
                let observation = self.observations.get(&sent.transfer_id).cloned();
                let key = observation.as_ref().map(|o| transfer.ledger_key_for(o.bonder));
                let mut ledger = key.and_then(|k| self.ledgers.get(&k).cloned());
                let transfer = transitions::new_transfer_with_observation(
                    transfer,
                    observation.as_ref(),
                    ledger.as_mut(),
                    now,
                )?;
                if let Some(ledger) = ledger {
                    self.ledgers.insert(ledger.key.clone(), ledger);
                }
                self.transfers.insert(sent.transfer_id, transfer);
                outcome.transfers_inserted += 1;
            }
            BridgeEvent::TransfersCommitted(committed) => {
                for t in self.transfers.values_mut() {
                    if t.source_chain == meta.chain_id
                        && t.destination_chain == committed.destination_chain
                        && t.token == meta.token
                        && t.sent_block <= meta.block_number
                        && transitions::attach_root(t, committed.root_hash, now)
                    {
                        outcome.transfers_committed += 1;
                    }
                }
            }
            BridgeEvent::WithdrawalBonded(bonded) => {
                self.observations
                    .entry(bonded.transfer_id)
                    .or_insert_with(|| BondObservation {
                        transfer_id: bonded.transfer_id,
                        chain_id: meta.chain_id,
                        bonder: bonded.bonder,
                        amount: bonded.amount,
                        bond_tx_hash: meta.tx_hash,
                        settled_root: None,
                        settle_tx_hash: None,
                    });
                let Some(t) = self.transfers.get(&bonded.transfer_id) else {
                    return Ok(());
                };
                if t.destination_chain != meta.chain_id {
                    warn!(transfer_id = %t.transfer_id, chain_id = %meta.chain_id, "Bond observed on a chain other than the destination");
                    return Ok(());
                }
                let (_, changed) = self.mutate(
                    &bonded.transfer_id,
                    |t| Some(transitions::ledger_key_for_bond(t, bonded.bonder)),
                    |t, ledger| transitions::observe_bond(t, ledger, bonded.bonder, meta.tx_hash, now),
                )?;
                if changed {
                    outcome.bonds_observed += 1;
                }
            }
            BridgeEvent::WithdrawalBondSettled(settled) => {
                if let Some(obs) = self.observations.get_mut(&settled.transfer_id) {
                    if obs.settled_root.is_none() {
                        obs.settled_root = Some(settled.root_hash);
                        obs.settle_tx_hash = Some(meta.tx_hash);
                    }
                }
                if !self.transfers.contains_key(&settled.transfer_id) {
                    return Ok(());
                }
                let (_, changed) = self.mutate(
                    &settled.transfer_id,
                    Transfer::reserved_ledger_key,
                    |t, ledger| {
                        transitions::observe_settlement(t, ledger, settled.root_hash, meta.tx_hash, now)
                    },
                )?;
                if changed {
                    outcome.settlements_observed += 1;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a transfer row. Test setup only; bypasses the
    /// lifecycle rules.
    pub async fn put_transfer(&self, transfer: Transfer) {
        self.state
            .lock()
            .await
            .transfers
            .insert(transfer.transfer_id, transfer);
    }

    pub async fn gas_samples(&self, chain_id: ChainId) -> Vec<GasPriceSample> {
        self.state
            .lock()
            .await
            .gas_samples
            .iter()
            .filter(|s| s.chain_id == chain_id)
            .copied()
            .collect()
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn checkpoint(&self, chain_id: ChainId) -> Result<Option<ChainCheckpoint>, StoreError> {
        Ok(self.state.lock().await.checkpoints.get(&chain_id).copied())
    }

    async fn init_checkpoint(
        &self,
        checkpoint: ChainCheckpoint,
    ) -> Result<ChainCheckpoint, StoreError> {
        let mut state = self.state.lock().await;
        Ok(*state
            .checkpoints
            .entry(checkpoint.chain_id)
            .or_insert(checkpoint))
    }

    async fn apply_block_range(&self, batch: BlockRangeBatch) -> Result<RangeOutcome, StoreError> {
        let mut guard = self.state.lock().await;
        let stored = guard.checkpoints.get(&batch.chain_id).map(|c| c.block_number);
        if stored.map(|n| n + 1) != Some(batch.from_block) {
            return Err(StoreError::CheckpointConflict {
                chain_id: batch.chain_id,
                expected: batch.from_block,
                stored,
            });
        }

        let now = OffsetDateTime::now_utc();
        let mut next = guard.clone();
        let mut outcome = RangeOutcome::default();
        for event in &batch.events {
            next.apply_event(event, now, &mut outcome)?;
        }
        next.checkpoints.insert(batch.chain_id, batch.checkpoint);
        *guard = next;
        Ok(outcome)
    }

    async fn rollback_checkpoint(
        &self,
        from: ChainCheckpoint,
        to: ChainCheckpoint,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.checkpoints.get(&from.chain_id).copied();
        if stored != Some(from) {
            return Err(StoreError::CheckpointConflict {
                chain_id: from.chain_id,
                expected: from.block_number,
                stored: stored.map(|c| c.block_number),
            });
        }
        state.checkpoints.insert(to.chain_id, to);
        Ok(())
    }

    async fn transfer(&self, transfer_id: &H256) -> Result<Option<Transfer>, StoreError> {
        Ok(self.state.lock().await.transfers.get(transfer_id).cloned())
    }

    async fn transfers_in_state(
        &self,
        state: TransferState,
        limit: usize,
    ) -> Result<Vec<Transfer>, StoreError> {
        Ok(self.state.lock().await.sorted(|t| t.state == state, limit))
    }

    async fn bond_candidates(&self, limit: usize) -> Result<Vec<Transfer>, StoreError> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .state
            .lock()
            .await
            .sorted(|t| t.is_bond_candidate(now), limit))
    }

    async fn settle_candidates(&self, limit: usize) -> Result<Vec<Transfer>, StoreError> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .state
            .lock()
            .await
            .sorted(|t| t.is_settle_candidate(now), limit))
    }

    async fn try_lock_transfer(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        expected: TransferState,
        lease: Duration,
    ) -> Result<Option<Transfer>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        if !state.transfers.contains_key(transfer_id) {
            return Ok(None);
        }
        let (transfer, outcome) = state.mutate(
            transfer_id,
            Transfer::reserved_ledger_key,
            |t, ledger| transitions::acquire_lease(t, ledger, owner, expected, lease, now),
        )?;
        match outcome {
            LeaseOutcome::Acquired(audit) => {
                if let Some(audit) = audit {
                    state.push_attempt(audit);
                }
                Ok(Some(transfer))
            }
            LeaseOutcome::Busy | LeaseOutcome::StateMismatch => Ok(None),
        }
    }

    async fn unlock_transfer(&self, transfer_id: &H256, owner: Uuid) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        if let Some(t) = state.transfers.get_mut(transfer_id) {
            transitions::unlock(t, owner, now);
        }
        Ok(())
    }

    async fn reserve_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        bonder: Address,
    ) -> Result<LiquidityLedger, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let (transfer, ()) = state.mutate(
            transfer_id,
            |t| Some(t.ledger_key_for(bonder)),
            |t, ledger| {
                let key = t.ledger_key_for(bonder);
                let ledger = ledger.ok_or(StoreError::LedgerMissing(key))?;
                transitions::reserve_bond(t, ledger, owner, bonder, now)
            },
        )?;
        let key = transfer.ledger_key_for(bonder);
        state
            .ledgers
            .get(&key)
            .cloned()
            .ok_or(StoreError::LedgerMissing(key))
    }

    async fn record_bond_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        self.state.lock().await.mutate(
            transfer_id,
            |_| None,
            |t, _| transitions::record_bond_tx(t, owner, tx_hash, now),
        )?;
        Ok(())
    }

    async fn confirm_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (transfer, ()) = self.state.lock().await.mutate(
            transfer_id,
            |_| None,
            |t, _| transitions::confirm_bond(t, owner, tx_hash, now),
        )?;
        Ok(transfer)
    }

    async fn release_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let (transfer, attempt) = state.mutate(
            transfer_id,
            Transfer::reserved_ledger_key,
            |t, ledger| transitions::release_bond(t, ledger, owner, failure, now),
        )?;
        state.push_attempt(attempt);
        Ok(transfer)
    }

    async fn mark_unbondable(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        reason: SkipReason,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (transfer, ()) = self.state.lock().await.mutate(
            transfer_id,
            |_| None,
            |t, _| transitions::mark_unbondable(t, owner, reason, now),
        )?;
        Ok(transfer)
    }

    async fn record_settle_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        self.state.lock().await.mutate(
            transfer_id,
            |_| None,
            |t, _| transitions::record_settle_tx(t, owner, tx_hash, now),
        )?;
        Ok(())
    }

    async fn confirm_settlement(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (transfer, ()) = self.state.lock().await.mutate(
            transfer_id,
            Transfer::reserved_ledger_key,
            |t, ledger| transitions::confirm_settlement(t, ledger, owner, tx_hash, now),
        )?;
        Ok(transfer)
    }

    async fn record_settle_failure(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let (transfer, attempt) = state.mutate(
            transfer_id,
            |_| None,
            |t, _| transitions::record_settle_failure(t, owner, failure, now),
        )?;
        state.push_attempt(attempt);
        Ok(transfer)
    }

    async fn ledger(&self, key: &LedgerKey) -> Result<Option<LiquidityLedger>, StoreError> {
        Ok(self.state.lock().await.ledgers.get(key).cloned())
    }

    async fn ledgers(&self) -> Result<Vec<LiquidityLedger>, StoreError> {
        Ok(self.state.lock().await.ledgers.values().cloned().collect())
    }

    async fn ensure_ledger(
        &self,
        key: &LedgerKey,
        stake: Decimal,
    ) -> Result<LiquidityLedger, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .ledgers
            .entry(key.clone())
            .or_insert_with(|| LiquidityLedger::new(key.clone(), stake))
            .clone())
    }

    async fn deposit(&self, key: &LedgerKey, amount: Decimal) -> Result<LiquidityLedger, StoreError> {
        let mut state = self.state.lock().await;
        let ledger = state
            .ledgers
            .get_mut(key)
            .ok_or_else(|| StoreError::LedgerMissing(key.clone()))?;
        ledger.deposit(amount).map_err(|source| StoreError::Ledger {
            key: key.clone(),
            source,
        })?;
        Ok(ledger.clone())
    }

    async fn bond_attempts(&self, transfer_id: &H256) -> Result<Vec<BondAttempt>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .attempts
            .iter()
            .filter(|a| &a.transfer_id == transfer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GasPriceStore for MemoryStore {
    async fn append_gas_sample(&self, sample: GasPriceSample) -> Result<(), StoreError> {
        self.state.lock().await.gas_samples.push(sample);
        Ok(())
    }

    async fn latest_gas_sample(
        &self,
        chain_id: ChainId,
    ) -> Result<Option<GasPriceSample>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .gas_samples
            .iter()
            .filter(|s| s.chain_id == chain_id)
            .max_by_key(|s| s.sampled_at)
            .copied())
    }

    async fn prune_gas_samples(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.gas_samples.len();
        state.gas_samples.retain(|s| s.sampled_at >= older_than);
        Ok((before - state.gas_samples.len()) as u64)
    }
}
