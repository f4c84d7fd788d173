//! Postgres backend.
//!
//! Single-row reads go through the `Processor` queries next to each entity.
//! Lifecycle operations open a transaction, lock the transfer row and then
//! the one ledger row involved, apply the shared rule and write both back
//! before committing.
//!
//! Every writer takes transfer locks before ledger locks. A block range
//! touches many of both, so it takes all of them up front: transfers in id
//! order, then ledgers in key order.

use super::transitions::{self, LeaseOutcome};
use super::{
    BlockRangeBatch, BridgeStore, GasPriceStore, RangeOutcome, StoreError, SubmissionFailure,
};
use crate::chain::types::{Address, H256, TxHash};
use crate::entities::bond_attempt::{ListBondAttempts, insert_attempt};
use crate::entities::checkpoint::{GetCheckpoint, InitCheckpoint, lock_checkpoint, update_checkpoint};
use crate::entities::gas_price::{GetLatestGasPrice, InsertGasPriceSample, PruneGasPriceSamples};
use crate::entities::liquidity::{EnsureLedger, GetLedger, ListLedgers, lock_ledger_row, update_ledger};
use crate::entities::observation::{get_observation, insert_observation, mark_observation_settled};
use crate::entities::transfer::{
    GetTransfer, ListDueTransfers, ListTransfersInState, insert_transfer, lock_transfer_row,
    lock_uncommitted, uncommitted_ids, update_transfer,
};
use crate::entities::{
    BondAttempt, BondObservation, ChainCheckpoint, GasPriceSample, LedgerKey, LiquidityLedger,
    Transfer,
};
use crate::events::{BridgeEvent, ObservedEvent};
use crate::framework::{DatabaseProcessor, TransactionProcessor};
use async_trait::async_trait;
use bonder_sdk::objects::{ChainId, SkipReason, TransferState};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgStore {
    db: DatabaseProcessor,
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Serialise writers that touch the same transfer id, including writers
/// that arrive before the transfer row exists.
async fn lock_transfer_id(conn: &mut PgConnection, transfer_id: &H256) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(transfer_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

async fn lock_optional_ledger(
    conn: &mut PgConnection,
    key: Option<LedgerKey>,
) -> Result<Option<LiquidityLedger>, sqlx::Error> {
    match key {
        Some(key) => lock_ledger_row(conn, &key).await,
        None => Ok(None),
    }
}

/// Lock every transfer and ledger row `events` can touch.
async fn lock_range(
    conn: &mut PgConnection,
    events: &[ObservedEvent],
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    let mut ids: BTreeSet<H256> = events.iter().filter_map(|e| e.transfer_id()).collect();
    for observed in events {
        if let BridgeEvent::TransfersCommitted(committed) = &observed.event {
            let meta = &observed.meta;
            ids.extend(
                uncommitted_ids(
                    &mut *conn,
                    meta.chain_id,
                    committed.destination_chain,
                    &meta.token,
                    meta.block_number,
                )
                .await?,
            );
        }
    }

    let mut rows = BTreeMap::new();
    for id in &ids {
        lock_transfer_id(&mut *conn, id).await?;
        if let Some(t) = lock_transfer_row(&mut *conn, id).await? {
            rows.insert(*id, t);
        }
    }

    let mut keys = BTreeSet::new();
    for observed in events {
        match &observed.event {
            BridgeEvent::TransferSent(sent) if !rows.contains_key(&sent.transfer_id) => {
                if let Some(o) = get_observation(&mut *conn, &sent.transfer_id).await? {
                    let t = sent.to_new_transfer(&observed.meta).into_transfer(now);
                    keys.insert(t.ledger_key_for(o.bonder));
                }
            }
            BridgeEvent::WithdrawalBonded(bonded) => {
                if let Some(t) = rows.get(&bonded.transfer_id) {
                    keys.insert(transitions::ledger_key_for_bond(t, bonded.bonder));
                }
            }
            BridgeEvent::WithdrawalBondSettled(settled) => {
                if let Some(key) = rows
                    .get(&settled.transfer_id)
                    .and_then(Transfer::reserved_ledger_key)
                {
                    keys.insert(key);
                }
            }
            _ => {}
        }
    }
    for key in &keys {
        lock_ledger_row(&mut *conn, key).await?;
    }
    Ok(())
}

async fn write_back(
    conn: &mut PgConnection,
    transfer: &Transfer,
    ledger: Option<&LiquidityLedger>,
) -> Result<(), sqlx::Error> {
    if let Some(ledger) = ledger {
        update_ledger(&mut *conn, ledger).await?;
    }
    update_transfer(conn, transfer).await
}

async fn apply_event(
    conn: &mut PgConnection,
    observed: &ObservedEvent,
    now: OffsetDateTime,
    outcome: &mut RangeOutcome,
) -> Result<(), StoreError> {
    let meta = &observed.meta;
    match &observed.event {
        BridgeEvent::TransferSent(sent) => {
            lock_transfer_id(&mut *conn, &sent.transfer_id).await?;
            if lock_transfer_row(&mut *conn, &sent.transfer_id).await?.is_some() {
                return Ok(());
            }
            let transfer = sent.to_new_transfer(meta).into_transfer(now);
            let observation = get_observation(&mut *conn, &sent.transfer_id).await?;
            let key = observation.as_ref().map(|o| transfer.ledger_key_for(o.bonder));
            let mut ledger = lock_optional_ledger(&mut *conn, key).await?;
            let transfer = transitions::new_transfer_with_observation(
                transfer,
                observation.as_ref(),
                ledger.as_mut(),
                now,
            )?;
            if insert_transfer(&mut *conn, &transfer).await? {
                if let Some(ledger) = &ledger {
                    update_ledger(&mut *conn, ledger).await?;
                }
                outcome.transfers_inserted += 1;
            }
        }
        BridgeEvent::TransfersCommitted(committed) => {
            let pending = lock_uncommitted(
                &mut *conn,
                meta.chain_id,
                committed.destination_chain,
                &meta.token,
                meta.block_number,
            )
            .await?;
            for mut t in pending {
                if transitions::attach_root(&mut t, committed.root_hash, now) {
                    update_transfer(&mut *conn, &t).await?;
                    outcome.transfers_committed += 1;
                }
            }
        }
        BridgeEvent::WithdrawalBonded(bonded) => {
            lock_transfer_id(&mut *conn, &bonded.transfer_id).await?;
            insert_observation(
                &mut *conn,
                &BondObservation {
                    transfer_id: bonded.transfer_id,
                    chain_id: meta.chain_id,
                    bonder: bonded.bonder,
                    amount: bonded.amount,
                    bond_tx_hash: meta.tx_hash,
                    settled_root: None,
                    settle_tx_hash: None,
                },
            )
            .await?;
            let Some(mut t) = lock_transfer_row(&mut *conn, &bonded.transfer_id).await? else {
                return Ok(());
            };
            if t.destination_chain != meta.chain_id {
                warn!(transfer_id = %t.transfer_id, chain_id = %meta.chain_id, "Bond observed on a chain other than the destination");
                return Ok(());
            }
            let key = transitions::ledger_key_for_bond(&t, bonded.bonder);
            let mut ledger = lock_ledger_row(&mut *conn, &key).await?;
            if transitions::observe_bond(&mut t, ledger.as_mut(), bonded.bonder, meta.tx_hash, now)? {
                write_back(&mut *conn, &t, ledger.as_ref()).await?;
                outcome.bonds_observed += 1;
            }
        }
        BridgeEvent::WithdrawalBondSettled(settled) => {
            lock_transfer_id(&mut *conn, &settled.transfer_id).await?;
            mark_observation_settled(&mut *conn, &settled.transfer_id, &settled.root_hash, &meta.tx_hash)
                .await?;
            let Some(mut t) = lock_transfer_row(&mut *conn, &settled.transfer_id).await? else {
                return Ok(());
            };
            let mut ledger = lock_optional_ledger(&mut *conn, t.reserved_ledger_key()).await?;
            if transitions::observe_settlement(
                &mut t,
                ledger.as_mut(),
                settled.root_hash,
                meta.tx_hash,
                now,
            )? {
                write_back(&mut *conn, &t, ledger.as_ref()).await?;
                outcome.settlements_observed += 1;
            }
        }
    }
    Ok(())
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor::new(pool),
        }
    }

    pub fn processor(&self) -> &DatabaseProcessor {
        &self.db
    }

    /// Lock the transfer and its ledger, apply `rule` and write both back.
    /// The caller commits the returned transaction; dropping it rolls back.
    async fn mutate<R, K, F>(
        &self,
        transfer_id: &H256,
        key: K,
        rule: F,
    ) -> Result<(TransactionProcessor<'static>, Transfer, R), StoreError>
    where
        K: FnOnce(&Transfer) -> Option<LedgerKey> + Send,
        F: FnOnce(&mut Transfer, Option<&mut LiquidityLedger>) -> Result<R, StoreError> + Send,
        R: Send,
    {
        let mut tx = self.db.begin().await?;
        let mut transfer = lock_transfer_row(tx.conn(), transfer_id)
            .await?
            .ok_or(StoreError::TransferNotFound(*transfer_id))?;
        let mut ledger = lock_optional_ledger(tx.conn(), key(&transfer)).await?;
        let out = rule(&mut transfer, ledger.as_mut())?;
        write_back(tx.conn(), &transfer, ledger.as_ref()).await?;
        Ok((tx, transfer, out))
    }
}

#[async_trait]
impl BridgeStore for PgStore {
    async fn checkpoint(&self, chain_id: ChainId) -> Result<Option<ChainCheckpoint>, StoreError> {
        Ok(self.db.process(GetCheckpoint { chain_id }).await?)
    }

    async fn init_checkpoint(
        &self,
        checkpoint: ChainCheckpoint,
    ) -> Result<ChainCheckpoint, StoreError> {
        Ok(self.db.process(InitCheckpoint { checkpoint }).await?)
    }

    #[tracing::instrument(skip_all, err, fields(chain_id = %batch.chain_id, from = batch.from_block, to = batch.checkpoint.block_number))]
    async fn apply_block_range(&self, batch: BlockRangeBatch) -> Result<RangeOutcome, StoreError> {
        let mut tx = self.db.begin().await?;
        let stored = lock_checkpoint(tx.conn(), batch.chain_id)
            .await?
            .map(|c| c.block_number);
        if stored.map(|n| n + 1) != Some(batch.from_block) {
            return Err(StoreError::CheckpointConflict {
                chain_id: batch.chain_id,
                expected: batch.from_block,
                stored,
            });
        }
        let now = OffsetDateTime::now_utc();
        lock_range(tx.conn(), &batch.events, now).await?;
        let mut outcome = RangeOutcome::default();
        for event in &batch.events {
            apply_event(tx.conn(), event, now, &mut outcome).await?;
        }
        update_checkpoint(tx.conn(), &batch.checkpoint).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn rollback_checkpoint(
        &self,
        from: ChainCheckpoint,
        to: ChainCheckpoint,
    ) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        let stored = lock_checkpoint(tx.conn(), from.chain_id).await?;
        if stored != Some(from) {
            return Err(StoreError::CheckpointConflict {
                chain_id: from.chain_id,
                expected: from.block_number,
                stored: stored.map(|c| c.block_number),
            });
        }
        update_checkpoint(tx.conn(), &to).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn transfer(&self, transfer_id: &H256) -> Result<Option<Transfer>, StoreError> {
        Ok(self
            .db
            .process(GetTransfer {
                transfer_id: *transfer_id,
            })
            .await?)
    }

    async fn transfers_in_state(
        &self,
        state: TransferState,
        limit_to: usize,
    ) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .db
            .process(ListTransfersInState {
                state,
                limit: limit(limit_to),
            })
            .await?)
    }

    async fn bond_candidates(&self, limit_to: usize) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .db
            .process(ListDueTransfers {
                state: TransferState::Sent,
                reserved_only: false,
                now: OffsetDateTime::now_utc(),
                limit: limit(limit_to),
            })
            .await?)
    }

    async fn settle_candidates(&self, limit_to: usize) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .db
            .process(ListDueTransfers {
                state: TransferState::Committed,
                reserved_only: true,
                now: OffsetDateTime::now_utc(),
                limit: limit(limit_to),
            })
            .await?)
    }

    async fn try_lock_transfer(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        expected: TransferState,
        lease: Duration,
    ) -> Result<Option<Transfer>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.db.begin().await?;
        let Some(mut transfer) = lock_transfer_row(tx.conn(), transfer_id).await? else {
            return Ok(None);
        };
        let mut ledger = lock_optional_ledger(tx.conn(), transfer.reserved_ledger_key()).await?;
        match transitions::acquire_lease(&mut transfer, ledger.as_mut(), owner, expected, lease, now)? {
            LeaseOutcome::Acquired(audit) => {
                write_back(tx.conn(), &transfer, ledger.as_ref()).await?;
                if let Some(audit) = audit {
                    insert_attempt(tx.conn(), &audit).await?;
                }
                tx.commit().await?;
                Ok(Some(transfer))
            }
            LeaseOutcome::Busy | LeaseOutcome::StateMismatch => Ok(None),
        }
    }

    async fn unlock_transfer(&self, transfer_id: &H256, owner: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transfers SET lock_owner = NULL, lock_expires_at = NULL, updated_at = now() \
             WHERE transfer_id = $1 AND lock_owner = $2",
        )
        .bind(transfer_id.to_string())
        .bind(owner)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn reserve_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        bonder: Address,
    ) -> Result<LiquidityLedger, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, _, ledger) = self
            .mutate(
                transfer_id,
                |t| Some(t.ledger_key_for(bonder)),
                |t, ledger| {
                    let ledger = ledger.ok_or_else(|| StoreError::LedgerMissing(t.ledger_key_for(bonder)))?;
                    transitions::reserve_bond(t, ledger, owner, bonder, now)?;
                    Ok(ledger.clone())
                },
            )
            .await?;
        tx.commit().await?;
        Ok(ledger)
    }

    async fn record_bond_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, _, ()) = self
            .mutate(transfer_id, |_| None, |t, _| {
                transitions::record_bond_tx(t, owner, tx_hash, now)
            })
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn confirm_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, transfer, ()) = self
            .mutate(transfer_id, |_| None, |t, _| {
                transitions::confirm_bond(t, owner, tx_hash, now)
            })
            .await?;
        tx.commit().await?;
        Ok(transfer)
    }

    async fn release_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (mut tx, transfer, attempt) = self
            .mutate(transfer_id, Transfer::reserved_ledger_key, |t, ledger| {
                transitions::release_bond(t, ledger, owner, failure, now)
            })
            .await?;
        insert_attempt(tx.conn(), &attempt).await?;
        tx.commit().await?;
        Ok(transfer)
    }

    async fn mark_unbondable(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        reason: SkipReason,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, transfer, ()) = self
            .mutate(transfer_id, |_| None, |t, _| {
                transitions::mark_unbondable(t, owner, reason, now)
            })
            .await?;
        tx.commit().await?;
        Ok(transfer)
    }

    async fn record_settle_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, _, ()) = self
            .mutate(transfer_id, |_| None, |t, _| {
                transitions::record_settle_tx(t, owner, tx_hash, now)
            })
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn confirm_settlement(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (tx, transfer, ()) = self
            .mutate(transfer_id, Transfer::reserved_ledger_key, |t, ledger| {
                transitions::confirm_settlement(t, ledger, owner, tx_hash, now)
            })
            .await?;
        tx.commit().await?;
        Ok(transfer)
    }

    async fn record_settle_failure(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError> {
        let now = OffsetDateTime::now_utc();
        let (mut tx, transfer, attempt) = self
            .mutate(transfer_id, |_| None, |t, _| {
                transitions::record_settle_failure(t, owner, failure, now)
            })
            .await?;
        insert_attempt(tx.conn(), &attempt).await?;
        tx.commit().await?;
        Ok(transfer)
    }

    async fn ledger(&self, key: &LedgerKey) -> Result<Option<LiquidityLedger>, StoreError> {
        Ok(self.db.process(GetLedger { key: key.clone() }).await?)
    }

    async fn ledgers(&self) -> Result<Vec<LiquidityLedger>, StoreError> {
        Ok(self.db.process(ListLedgers).await?)
    }

    async fn ensure_ledger(
        &self,
        key: &LedgerKey,
        stake: Decimal,
    ) -> Result<LiquidityLedger, StoreError> {
        Ok(self
            .db
            .process(EnsureLedger {
                key: key.clone(),
                stake,
            })
            .await?)
    }

    async fn deposit(&self, key: &LedgerKey, amount: Decimal) -> Result<LiquidityLedger, StoreError> {
        let mut tx = self.db.begin().await?;
        let mut ledger = lock_ledger_row(tx.conn(), key)
            .await?
            .ok_or_else(|| StoreError::LedgerMissing(key.clone()))?;
        ledger.deposit(amount).map_err(|source| StoreError::Ledger {
            key: key.clone(),
            source,
        })?;
        update_ledger(tx.conn(), &ledger).await?;
        tx.commit().await?;
        Ok(ledger)
    }

    async fn bond_attempts(&self, transfer_id: &H256) -> Result<Vec<BondAttempt>, StoreError> {
        Ok(self
            .db
            .process(ListBondAttempts {
                transfer_id: *transfer_id,
            })
            .await?)
    }
}

#[async_trait]
impl GasPriceStore for PgStore {
    async fn append_gas_sample(&self, sample: GasPriceSample) -> Result<(), StoreError> {
        Ok(self.db.process(InsertGasPriceSample { sample }).await?)
    }

    async fn latest_gas_sample(
        &self,
        chain_id: ChainId,
    ) -> Result<Option<GasPriceSample>, StoreError> {
        Ok(self.db.process(GetLatestGasPrice { chain_id }).await?)
    }

    async fn prune_gas_samples(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(self.db.process(PruneGasPriceSamples { older_than }).await?)
    }
}
