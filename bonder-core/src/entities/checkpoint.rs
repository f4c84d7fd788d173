use crate::chain::types::H256;
use crate::framework::DatabaseProcessor;
use bonder_sdk::objects::ChainId;
use kanau::processor::Processor;

/// Last block a chain watcher has fully processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCheckpoint {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: H256,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CheckpointRow {
    pub chain_id: i64,
    pub block_number: i64,
    pub block_hash: String,
}

impl TryFrom<CheckpointRow> for ChainCheckpoint {
    type Error = sqlx::Error;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(ChainCheckpoint {
            chain_id: ChainId(super::from_db_u64(row.chain_id)?),
            block_number: super::from_db_u64(row.block_number)?,
            block_hash: super::parse_column("block_hash", &row.block_hash)?,
        })
    }
}

pub(crate) async fn lock_checkpoint(
    conn: &mut sqlx::PgConnection,
    chain_id: ChainId,
) -> Result<Option<ChainCheckpoint>, sqlx::Error> {
    let row: Option<CheckpointRow> = sqlx::query_as(
        "SELECT chain_id, block_number, block_hash FROM chain_checkpoints \
         WHERE chain_id = $1 FOR UPDATE",
    )
    .bind(super::to_db_u64(chain_id.get())?)
    .fetch_optional(conn)
    .await?;
    row.map(ChainCheckpoint::try_from).transpose()
}

pub(crate) async fn update_checkpoint(
    conn: &mut sqlx::PgConnection,
    checkpoint: &ChainCheckpoint,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE chain_checkpoints SET block_number = $2, block_hash = $3, updated_at = now() \
         WHERE chain_id = $1",
    )
    .bind(super::to_db_u64(checkpoint.chain_id.get())?)
    .bind(super::to_db_u64(checkpoint.block_number)?)
    .bind(checkpoint.block_hash.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GetCheckpoint {
    pub chain_id: ChainId,
}

impl Processor<GetCheckpoint> for DatabaseProcessor {
    type Output = Option<ChainCheckpoint>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetCheckpoint")]
    async fn process(&self, query: GetCheckpoint) -> Result<Option<ChainCheckpoint>, sqlx::Error> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT chain_id, block_number, block_hash FROM chain_checkpoints WHERE chain_id = $1",
        )
        .bind(super::to_db_u64(query.chain_id.get())?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ChainCheckpoint::try_from).transpose()
    }
}

#[derive(Debug, Clone)]
/// Create the checkpoint on first start; an existing checkpoint wins.
pub struct InitCheckpoint {
    pub checkpoint: ChainCheckpoint,
}

impl Processor<InitCheckpoint> for DatabaseProcessor {
    type Output = ChainCheckpoint;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InitCheckpoint")]
    async fn process(&self, insert: InitCheckpoint) -> Result<ChainCheckpoint, sqlx::Error> {
        let cp = insert.checkpoint;
        sqlx::query(
            "INSERT INTO chain_checkpoints (chain_id, block_number, block_hash) \
             VALUES ($1, $2, $3) ON CONFLICT (chain_id) DO NOTHING",
        )
        .bind(super::to_db_u64(cp.chain_id.get())?)
        .bind(super::to_db_u64(cp.block_number)?)
        .bind(cp.block_hash.to_string())
        .execute(&self.pool)
        .await?;
        self.process(GetCheckpoint {
            chain_id: cp.chain_id,
        })
        .await?
        .ok_or(sqlx::Error::RowNotFound)
    }
}
