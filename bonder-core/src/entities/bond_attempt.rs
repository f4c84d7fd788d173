//! Audit trail of failed bond and settlement submissions.

use crate::chain::types::{H256, TxHash};
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptKind {
    Bond,
    Settle,
    /// A lease expired while its holder still had liquidity reserved.
    LeaseExpired,
}

impl AttemptKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptKind::Bond => "bond",
            AttemptKind::Settle => "settle",
            AttemptKind::LeaseExpired => "lease_expired",
        }
    }
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown attempt kind: {0}")]
pub struct UnknownAttemptKind(String);

impl FromStr for AttemptKind {
    type Err = UnknownAttemptKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bond" => Ok(AttemptKind::Bond),
            "settle" => Ok(AttemptKind::Settle),
            "lease_expired" => Ok(AttemptKind::LeaseExpired),
            other => Err(UnknownAttemptKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBondAttempt {
    pub transfer_id: H256,
    pub kind: AttemptKind,
    pub tx_hash: Option<TxHash>,
    pub error: String,
    pub attempted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondAttempt {
    pub id: i64,
    pub transfer_id: H256,
    pub kind: AttemptKind,
    pub tx_hash: Option<TxHash>,
    pub error: String,
    pub attempted_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct BondAttemptRow {
    id: i64,
    transfer_id: String,
    kind: String,
    tx_hash: Option<String>,
    error: String,
    attempted_at: OffsetDateTime,
}

impl TryFrom<BondAttemptRow> for BondAttempt {
    type Error = sqlx::Error;

    fn try_from(row: BondAttemptRow) -> Result<Self, Self::Error> {
        Ok(BondAttempt {
            id: row.id,
            transfer_id: super::parse_column("transfer_id", &row.transfer_id)?,
            kind: super::parse_column("kind", &row.kind)?,
            tx_hash: super::parse_optional_column("tx_hash", row.tx_hash.as_deref())?,
            error: row.error,
            attempted_at: row.attempted_at,
        })
    }
}

pub(crate) async fn insert_attempt(
    conn: &mut sqlx::PgConnection,
    attempt: &NewBondAttempt,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO bond_attempts (transfer_id, kind, tx_hash, error, attempted_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(attempt.transfer_id.to_string())
    .bind(attempt.kind.as_str())
    .bind(attempt.tx_hash.map(|h| h.to_string()))
    .bind(&attempt.error)
    .bind(attempt.attempted_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ListBondAttempts {
    pub transfer_id: H256,
}

impl Processor<ListBondAttempts> for DatabaseProcessor {
    type Output = Vec<BondAttempt>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListBondAttempts")]
    async fn process(&self, query: ListBondAttempts) -> Result<Vec<BondAttempt>, sqlx::Error> {
        let rows: Vec<BondAttemptRow> = sqlx::query_as(
            "SELECT id, transfer_id, kind, tx_hash, error, attempted_at \
             FROM bond_attempts WHERE transfer_id = $1 ORDER BY id",
        )
        .bind(query.transfer_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BondAttempt::try_from).collect()
    }
}
