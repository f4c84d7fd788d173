//! Durable state: transfers, checkpoints, ledgers and gas samples.
//!
//! The store is the only state shared between daemons. Every method is one
//! atomic unit: either all of its writes land or none do. Lifecycle rules
//! live in [`transitions`] and are shared by both backends.

pub mod memory;
pub mod postgres;
pub mod transitions;

use crate::chain::types::{Address, H256, TxHash};
use crate::entities::{
    BondAttempt, ChainCheckpoint, GasPriceSample, LedgerError, LedgerKey, LiquidityLedger, Transfer,
};
use crate::events::ObservedEvent;
use async_trait::async_trait;
use bonder_sdk::objects::{ChainId, SkipReason, TransferState};
use rust_decimal::Decimal;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("checkpoint conflict on chain {chain_id}: expected range to start at {expected}, stored checkpoint is {stored:?}")]
    CheckpointConflict {
        chain_id: ChainId,
        expected: u64,
        stored: Option<u64>,
    },

    #[error("transfer {transfer_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        transfer_id: H256,
        from: TransferState,
        to: TransferState,
    },

    #[error("ledger {key}: {source}")]
    Ledger {
        key: LedgerKey,
        #[source]
        source: LedgerError,
    },

    #[error("ledger {0} does not exist")]
    LedgerMissing(LedgerKey),

    #[error("transfer {0} not found")]
    TransferNotFound(H256),

    #[error("lease on transfer {0} is not held by this engine")]
    LeaseLost(H256),

    #[error("transfer {transfer_id}: {reason}")]
    Integrity { transfer_id: H256, reason: String },
}

/// Events and the checkpoint that covers them, written together.
#[derive(Debug, Clone)]
pub struct BlockRangeBatch {
    pub chain_id: ChainId,
    /// First block of the range; must be the stored checkpoint + 1.
    pub from_block: u64,
    /// Last block of the range and its hash.
    pub checkpoint: ChainCheckpoint,
    pub events: Vec<ObservedEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeOutcome {
    pub transfers_inserted: usize,
    pub transfers_committed: usize,
    pub bonds_observed: usize,
    pub settlements_observed: usize,
}

impl RangeOutcome {
    pub fn changed(&self) -> usize {
        self.transfers_inserted
            + self.transfers_committed
            + self.bonds_observed
            + self.settlements_observed
    }
}

/// Why a submission failed; recorded in the attempt audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFailure {
    pub tx_hash: Option<TxHash>,
    pub error: String,
    /// Earliest time the transfer is handed out again.
    pub retry_at: OffsetDateTime,
}

#[async_trait]
pub trait BridgeStore: Send + Sync {
    async fn checkpoint(&self, chain_id: ChainId) -> Result<Option<ChainCheckpoint>, StoreError>;

    /// Create the checkpoint if the chain has none; returns the stored one.
    async fn init_checkpoint(&self, checkpoint: ChainCheckpoint)
    -> Result<ChainCheckpoint, StoreError>;

    /// Persist a scanned range and advance the checkpoint in one unit.
    async fn apply_block_range(&self, batch: BlockRangeBatch) -> Result<RangeOutcome, StoreError>;

    /// Move the checkpoint back after a reorg. `from` is the checkpoint the
    /// caller observed; the call fails if it has moved in the meantime.
    async fn rollback_checkpoint(
        &self,
        from: ChainCheckpoint,
        to: ChainCheckpoint,
    ) -> Result<(), StoreError>;

    async fn transfer(&self, transfer_id: &H256) -> Result<Option<Transfer>, StoreError>;

    async fn transfers_in_state(
        &self,
        state: TransferState,
        limit: usize,
    ) -> Result<Vec<Transfer>, StoreError>;

    /// `Sent` transfers that are due and not leased.
    async fn bond_candidates(&self, limit: usize) -> Result<Vec<Transfer>, StoreError>;

    /// `Committed` transfers bonded by this node that are due and not leased.
    async fn settle_candidates(&self, limit: usize) -> Result<Vec<Transfer>, StoreError>;

    /// Take the exclusive lease on a transfer in `expected` state.
    ///
    /// Returns `None` when the state differs or a live lease is held by
    /// another owner. Taking over an expired lease releases any liquidity
    /// its holder still had reserved.
    async fn try_lock_transfer(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        expected: TransferState,
        lease: Duration,
    ) -> Result<Option<Transfer>, StoreError>;

    async fn unlock_transfer(&self, transfer_id: &H256, owner: Uuid) -> Result<(), StoreError>;

    /// Phase one of a bond: move `amount` to in flight on the bonder's ledger.
    async fn reserve_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        bonder: Address,
    ) -> Result<LiquidityLedger, StoreError>;

    async fn record_bond_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError>;

    /// The bond transaction was confirmed: `Sent -> Bonded`.
    async fn confirm_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError>;

    /// The bond attempt failed: restore any reservation, stay `Sent`, record
    /// the attempt and back off.
    async fn release_bond(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError>;

    async fn mark_unbondable(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        reason: SkipReason,
    ) -> Result<Transfer, StoreError>;

    async fn record_settle_tx(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<(), StoreError>;

    /// The settlement was confirmed: in flight becomes settled, `-> Settled`.
    async fn confirm_settlement(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        tx_hash: TxHash,
    ) -> Result<Transfer, StoreError>;

    async fn record_settle_failure(
        &self,
        transfer_id: &H256,
        owner: Uuid,
        failure: SubmissionFailure,
    ) -> Result<Transfer, StoreError>;

    async fn ledger(&self, key: &LedgerKey) -> Result<Option<LiquidityLedger>, StoreError>;

    async fn ledgers(&self) -> Result<Vec<LiquidityLedger>, StoreError>;

    /// Create a ledger with `stake` as its total unless it exists.
    async fn ensure_ledger(
        &self,
        key: &LedgerKey,
        stake: Decimal,
    ) -> Result<LiquidityLedger, StoreError>;

    async fn deposit(&self, key: &LedgerKey, amount: Decimal) -> Result<LiquidityLedger, StoreError>;

    async fn bond_attempts(&self, transfer_id: &H256) -> Result<Vec<BondAttempt>, StoreError>;
}

#[async_trait]
pub trait GasPriceStore: Send + Sync {
    async fn append_gas_sample(&self, sample: GasPriceSample) -> Result<(), StoreError>;

    async fn latest_gas_sample(&self, chain_id: ChainId)
    -> Result<Option<GasPriceSample>, StoreError>;

    async fn prune_gas_samples(&self, older_than: OffsetDateTime) -> Result<u64, StoreError>;
}
