//! Bonds and settlements seen on a destination chain.
//!
//! Destination watchers can run ahead of the source watcher, so a bond may
//! be observed before its transfer exists. The observation is kept and
//! applied when the transfer is inserted.

use crate::chain::types::{Address, H256, TxHash};
use bonder_sdk::objects::ChainId;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondObservation {
    pub transfer_id: H256,
    pub chain_id: ChainId,
    pub bonder: Address,
    pub amount: Decimal,
    pub bond_tx_hash: TxHash,
    pub settled_root: Option<H256>,
    pub settle_tx_hash: Option<TxHash>,
}

#[derive(Debug, sqlx::FromRow)]
struct ObservationRow {
    transfer_id: String,
    chain_id: i64,
    bonder: String,
    amount: Decimal,
    bond_tx_hash: String,
    settled_root: Option<String>,
    settle_tx_hash: Option<String>,
}

impl TryFrom<ObservationRow> for BondObservation {
    type Error = sqlx::Error;

    fn try_from(row: ObservationRow) -> Result<Self, Self::Error> {
        Ok(BondObservation {
            transfer_id: super::parse_column("transfer_id", &row.transfer_id)?,
            chain_id: ChainId(super::from_db_u64(row.chain_id)?),
            bonder: super::parse_column("bonder", &row.bonder)?,
            amount: row.amount,
            bond_tx_hash: super::parse_column("bond_tx_hash", &row.bond_tx_hash)?,
            settled_root: super::parse_optional_column("settled_root", row.settled_root.as_deref())?,
            settle_tx_hash: super::parse_optional_column(
                "settle_tx_hash",
                row.settle_tx_hash.as_deref(),
            )?,
        })
    }
}

pub(crate) async fn get_observation(
    conn: &mut sqlx::PgConnection,
    transfer_id: &H256,
) -> Result<Option<BondObservation>, sqlx::Error> {
    let row: Option<ObservationRow> = sqlx::query_as(
        "SELECT transfer_id, chain_id, bonder, amount, bond_tx_hash, settled_root, settle_tx_hash \
         FROM bond_observations WHERE transfer_id = $1 FOR UPDATE",
    )
    .bind(transfer_id.to_string())
    .fetch_optional(conn)
    .await?;
    row.map(BondObservation::try_from).transpose()
}

/// The first observed bond wins; later duplicates are ignored.
pub(crate) async fn insert_observation(
    conn: &mut sqlx::PgConnection,
    observation: &BondObservation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO bond_observations \
         (transfer_id, chain_id, bonder, amount, bond_tx_hash, settled_root, settle_tx_hash) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (transfer_id) DO NOTHING",
    )
    .bind(observation.transfer_id.to_string())
    .bind(super::to_db_u64(observation.chain_id.get())?)
    .bind(observation.bonder.to_string())
    .bind(observation.amount)
    .bind(observation.bond_tx_hash.to_string())
    .bind(observation.settled_root.map(|h| h.to_string()))
    .bind(observation.settle_tx_hash.map(|h| h.to_string()))
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn mark_observation_settled(
    conn: &mut sqlx::PgConnection,
    transfer_id: &H256,
    root: &H256,
    tx_hash: &TxHash,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE bond_observations SET settled_root = $2, settle_tx_hash = $3 \
         WHERE transfer_id = $1 AND settled_root IS NULL",
    )
    .bind(transfer_id.to_string())
    .bind(root.to_string())
    .bind(tx_hash.to_string())
    .execute(conn)
    .await?;
    Ok(())
}
