use crate::chain::types::{Address, H256, TxHash};
use crate::entities::liquidity::LedgerKey;
use crate::framework::DatabaseProcessor;
use bonder_sdk::objects::{ChainId, SkipReason, TokenSymbol, TransferState};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

/// One cross-chain value movement, from the source-chain send to the
/// destination-chain settlement. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub transfer_id: H256,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub token: TokenSymbol,
    /// Base units of `token`.
    pub amount: Decimal,
    pub recipient: Address,
    /// Unix timestamp after which the transfer may no longer be bonded.
    pub deadline: i64,
    pub bonder_fee: Decimal,
    pub transfer_nonce: H256,
    pub amount_out_min: Decimal,
    pub sent_block: u64,
    pub sent_tx_hash: TxHash,
    pub committed_root: Option<H256>,
    pub state: TransferState,
    /// Bonder that holds (or is about to hold) the bond.
    pub bonder: Option<Address>,
    pub bond_tx_hash: Option<TxHash>,
    /// True while this node's ledger carries `amount` in flight for the transfer.
    pub bond_reserved: bool,
    pub settle_tx_hash: Option<TxHash>,
    pub unbondable_reason: Option<SkipReason>,
    /// Failed submissions since the last successful transition.
    pub attempts: u32,
    pub next_attempt_at: Option<OffsetDateTime>,
    pub lock_owner: Option<Uuid>,
    pub lock_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields known when the watcher decodes a `TransferSent` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub transfer_id: H256,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    pub token: TokenSymbol,
    pub amount: Decimal,
    pub recipient: Address,
    pub deadline: i64,
    pub bonder_fee: Decimal,
    pub transfer_nonce: H256,
    pub amount_out_min: Decimal,
    pub sent_block: u64,
    pub sent_tx_hash: TxHash,
}

impl NewTransfer {
    pub fn into_transfer(self, now: OffsetDateTime) -> Transfer {
        Transfer {
            transfer_id: self.transfer_id,
            source_chain: self.source_chain,
            destination_chain: self.destination_chain,
            token: self.token,
            amount: self.amount,
            recipient: self.recipient,
            deadline: self.deadline,
            bonder_fee: self.bonder_fee,
            transfer_nonce: self.transfer_nonce,
            amount_out_min: self.amount_out_min,
            sent_block: self.sent_block,
            sent_tx_hash: self.sent_tx_hash,
            committed_root: None,
            state: TransferState::Sent,
            bonder: None,
            bond_tx_hash: None,
            bond_reserved: false,
            settle_tx_hash: None,
            unbondable_reason: None,
            attempts: 0,
            next_attempt_at: None,
            lock_owner: None,
            lock_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Transfer {
    /// Ledger of `bonder` on the destination chain for this token.
    pub fn ledger_key_for(&self, bonder: Address) -> LedgerKey {
        LedgerKey {
            chain_id: self.destination_chain,
            token: self.token.clone(),
            bonder,
        }
    }

    /// Ledger currently charged for this transfer, if any.
    pub fn reserved_ledger_key(&self) -> Option<LedgerKey> {
        if !self.bond_reserved {
            return None;
        }
        self.bonder.map(|b| self.ledger_key_for(b))
    }

    pub fn lease_free(&self, now: OffsetDateTime) -> bool {
        match (self.lock_owner, self.lock_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => false,
        }
    }

    pub fn holds_lease(&self, owner: Uuid) -> bool {
        self.lock_owner == Some(owner)
    }

    pub fn due(&self, now: OffsetDateTime) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub fn is_bond_candidate(&self, now: OffsetDateTime) -> bool {
        self.state == TransferState::Sent && self.due(now) && self.lease_free(now)
    }

    pub fn is_settle_candidate(&self, now: OffsetDateTime) -> bool {
        self.state == TransferState::Committed
            && self.bond_reserved
            && self.due(now)
            && self.lease_free(now)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransferRow {
    transfer_id: String,
    source_chain: i64,
    destination_chain: i64,
    token: String,
    amount: Decimal,
    recipient: String,
    deadline: i64,
    bonder_fee: Decimal,
    transfer_nonce: String,
    amount_out_min: Decimal,
    sent_block: i64,
    sent_tx_hash: String,
    committed_root: Option<String>,
    state: String,
    bonder: Option<String>,
    bond_tx_hash: Option<String>,
    bond_reserved: bool,
    settle_tx_hash: Option<String>,
    unbondable_reason: Option<String>,
    attempts: i32,
    next_attempt_at: Option<OffsetDateTime>,
    lock_owner: Option<Uuid>,
    lock_expires_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = sqlx::Error;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        use super::{from_db_u64, parse_column, parse_optional_column};
        Ok(Transfer {
            transfer_id: parse_column("transfer_id", &row.transfer_id)?,
            source_chain: ChainId(from_db_u64(row.source_chain)?),
            destination_chain: ChainId(from_db_u64(row.destination_chain)?),
            token: TokenSymbol::new(&row.token),
            amount: row.amount,
            recipient: parse_column("recipient", &row.recipient)?,
            deadline: row.deadline,
            bonder_fee: row.bonder_fee,
            transfer_nonce: parse_column("transfer_nonce", &row.transfer_nonce)?,
            amount_out_min: row.amount_out_min,
            sent_block: from_db_u64(row.sent_block)?,
            sent_tx_hash: parse_column("sent_tx_hash", &row.sent_tx_hash)?,
            committed_root: parse_optional_column("committed_root", row.committed_root.as_deref())?,
            state: parse_column("state", &row.state)?,
            bonder: parse_optional_column("bonder", row.bonder.as_deref())?,
            bond_tx_hash: parse_optional_column("bond_tx_hash", row.bond_tx_hash.as_deref())?,
            bond_reserved: row.bond_reserved,
            settle_tx_hash: parse_optional_column("settle_tx_hash", row.settle_tx_hash.as_deref())?,
            unbondable_reason: parse_optional_column(
                "unbondable_reason",
                row.unbondable_reason.as_deref(),
            )?,
            attempts: u32::try_from(row.attempts).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            next_attempt_at: row.next_attempt_at,
            lock_owner: row.lock_owner,
            lock_expires_at: row.lock_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) async fn lock_transfer_row(
    conn: &mut sqlx::PgConnection,
    transfer_id: &H256,
) -> Result<Option<Transfer>, sqlx::Error> {
    let row: Option<TransferRow> = sqlx::query_as(
        r#"
        SELECT
            transfer_id, source_chain, destination_chain, token, amount, recipient,
            deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
            committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
            unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
            created_at, updated_at
        FROM transfers
        WHERE transfer_id = $1
        FOR UPDATE
        "#,
    )
    .bind(transfer_id.to_string())
    .fetch_optional(conn)
    .await?;
    row.map(Transfer::try_from).transpose()
}

/// Insert a transfer; an existing row with the same id is left untouched.
/// Returns whether a row was written.
pub(crate) async fn insert_transfer(
    conn: &mut sqlx::PgConnection,
    t: &Transfer,
) -> Result<bool, sqlx::Error> {
    use super::to_db_u64;
    let result = sqlx::query(
        r#"
        INSERT INTO transfers (
            transfer_id, source_chain, destination_chain, token, amount, recipient,
            deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
            committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
            unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25)
        ON CONFLICT (transfer_id) DO NOTHING
        "#,
    )
    .bind(t.transfer_id.to_string())
    .bind(to_db_u64(t.source_chain.get())?)
    .bind(to_db_u64(t.destination_chain.get())?)
    .bind(t.token.as_str())
    .bind(t.amount)
    .bind(t.recipient.to_string())
    .bind(t.deadline)
    .bind(t.bonder_fee)
    .bind(t.transfer_nonce.to_string())
    .bind(t.amount_out_min)
    .bind(to_db_u64(t.sent_block)?)
    .bind(t.sent_tx_hash.to_string())
    .bind(t.committed_root.map(|h| h.to_string()))
    .bind(t.state.as_str())
    .bind(t.bonder.map(|a| a.to_string()))
    .bind(t.bond_tx_hash.map(|h| h.to_string()))
    .bind(t.bond_reserved)
    .bind(t.settle_tx_hash.map(|h| h.to_string()))
    .bind(t.unbondable_reason.map(|r| r.as_str()))
    .bind(i32::try_from(t.attempts).unwrap_or(i32::MAX))
    .bind(t.next_attempt_at)
    .bind(t.lock_owner)
    .bind(t.lock_expires_at)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Write back every mutable column of a transfer read with `FOR UPDATE`.
pub(crate) async fn update_transfer(
    conn: &mut sqlx::PgConnection,
    t: &Transfer,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE transfers SET committed_root = $2, state = $3, bonder = $4, bond_tx_hash = $5, \
         bond_reserved = $6, settle_tx_hash = $7, unbondable_reason = $8, attempts = $9, \
         next_attempt_at = $10, lock_owner = $11, lock_expires_at = $12, updated_at = $13 \
         WHERE transfer_id = $1",
    )
    .bind(t.transfer_id.to_string())
    .bind(t.committed_root.map(|h| h.to_string()))
    .bind(t.state.as_str())
    .bind(t.bonder.map(|a| a.to_string()))
    .bind(t.bond_tx_hash.map(|h| h.to_string()))
    .bind(t.bond_reserved)
    .bind(t.settle_tx_hash.map(|h| h.to_string()))
    .bind(t.unbondable_reason.map(|r| r.as_str()))
    .bind(i32::try_from(t.attempts).unwrap_or(i32::MAX))
    .bind(t.next_attempt_at)
    .bind(t.lock_owner)
    .bind(t.lock_expires_at)
    .bind(t.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Uncommitted transfers from `source_chain` to `destination_chain` sent at
/// or before `up_to_block`, locked for update.
pub(crate) async fn lock_uncommitted(
    conn: &mut sqlx::PgConnection,
    source_chain: ChainId,
    destination_chain: ChainId,
    token: &TokenSymbol,
    up_to_block: u64,
) -> Result<Vec<Transfer>, sqlx::Error> {
    use super::to_db_u64;
    let rows: Vec<TransferRow> = sqlx::query_as(
        r#"
        SELECT
            transfer_id, source_chain, destination_chain, token, amount, recipient,
            deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
            committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
            unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
            created_at, updated_at
        FROM transfers
        WHERE source_chain = $1 AND destination_chain = $2 AND token = $3
          AND sent_block <= $4 AND committed_root IS NULL
        ORDER BY transfer_id
        FOR UPDATE
        "#,
    )
    .bind(to_db_u64(source_chain.get())?)
    .bind(to_db_u64(destination_chain.get())?)
    .bind(token.as_str())
    .bind(to_db_u64(up_to_block)?)
    .fetch_all(conn)
    .await?;
    rows.into_iter().map(Transfer::try_from).collect()
}

/// Ids of the rows [`lock_uncommitted`] would lock, without locking them.
pub(crate) async fn uncommitted_ids(
    conn: &mut sqlx::PgConnection,
    source_chain: ChainId,
    destination_chain: ChainId,
    token: &TokenSymbol,
    up_to_block: u64,
) -> Result<Vec<H256>, sqlx::Error> {
    use super::{parse_column, to_db_u64};
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT transfer_id
        FROM transfers
        WHERE source_chain = $1 AND destination_chain = $2 AND token = $3
          AND sent_block <= $4 AND committed_root IS NULL
        "#,
    )
    .bind(to_db_u64(source_chain.get())?)
    .bind(to_db_u64(destination_chain.get())?)
    .bind(token.as_str())
    .bind(to_db_u64(up_to_block)?)
    .fetch_all(conn)
    .await?;
    ids.iter().map(|id| parse_column("transfer_id", id)).collect()
}

#[derive(Debug, Clone)]
pub struct GetTransfer {
    pub transfer_id: H256,
}

impl Processor<GetTransfer> for DatabaseProcessor {
    type Output = Option<Transfer>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetTransfer")]
    async fn process(&self, query: GetTransfer) -> Result<Option<Transfer>, sqlx::Error> {
        let row: Option<TransferRow> = sqlx::query_as(
            r#"
            SELECT
                transfer_id, source_chain, destination_chain, token, amount, recipient,
                deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
                committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
                unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
                created_at, updated_at
            FROM transfers
            WHERE transfer_id = $1
            "#,
        )
        .bind(query.transfer_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transfer::try_from).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct ListTransfersInState {
    pub state: TransferState,
    pub limit: i64,
}

impl Processor<ListTransfersInState> for DatabaseProcessor {
    type Output = Vec<Transfer>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListTransfersInState")]
    async fn process(&self, query: ListTransfersInState) -> Result<Vec<Transfer>, sqlx::Error> {
        let rows: Vec<TransferRow> = sqlx::query_as(
            r#"
            SELECT
                transfer_id, source_chain, destination_chain, token, amount, recipient,
                deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
                committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
                unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
                created_at, updated_at
            FROM transfers
            WHERE state = $1
            ORDER BY created_at, transfer_id
            LIMIT $2
            "#,
        )
        .bind(query.state.as_str())
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Transfer::try_from).collect()
    }
}

#[derive(Debug, Clone)]
/// Transfers the engine may pick up now: due for a retry and not leased by
/// a live holder.
pub struct ListDueTransfers {
    pub state: TransferState,
    /// Only transfers this node has liquidity reserved for.
    pub reserved_only: bool,
    pub now: OffsetDateTime,
    pub limit: i64,
}

impl Processor<ListDueTransfers> for DatabaseProcessor {
    type Output = Vec<Transfer>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListDueTransfers")]
    async fn process(&self, query: ListDueTransfers) -> Result<Vec<Transfer>, sqlx::Error> {
        let rows: Vec<TransferRow> = sqlx::query_as(
            r#"
            SELECT
                transfer_id, source_chain, destination_chain, token, amount, recipient,
                deadline, bonder_fee, transfer_nonce, amount_out_min, sent_block, sent_tx_hash,
                committed_root, state, bonder, bond_tx_hash, bond_reserved, settle_tx_hash,
                unbondable_reason, attempts, next_attempt_at, lock_owner, lock_expires_at,
                created_at, updated_at
            FROM transfers
            WHERE state = $1
              AND ($2 = FALSE OR bond_reserved)
              AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
              AND (lock_owner IS NULL OR lock_expires_at <= $3)
            ORDER BY created_at, transfer_id
            LIMIT $4
            "#,
        )
        .bind(query.state.as_str())
        .bind(query.reserved_only)
        .bind(query.now)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Transfer::try_from).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::new_transfer;
    use super::*;
    use time::Duration;

    #[test]
    fn candidates_respect_backoff_and_lease() {
        let now = OffsetDateTime::now_utc();
        let mut t = new_transfer(1, 100).into_transfer(now);
        assert!(t.is_bond_candidate(now));
        assert!(!t.is_settle_candidate(now));

        t.next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!t.is_bond_candidate(now));
        assert!(t.is_bond_candidate(now + Duration::seconds(30)));

        t.next_attempt_at = None;
        t.lock_owner = Some(Uuid::new_v4());
        t.lock_expires_at = Some(now + Duration::minutes(5));
        assert!(!t.is_bond_candidate(now));
        assert!(t.is_bond_candidate(now + Duration::minutes(5)));
    }

    #[test]
    fn reserved_ledger_key_requires_reservation() {
        let now = OffsetDateTime::now_utc();
        let mut t = new_transfer(1, 100).into_transfer(now);
        t.bonder = Some(Address([0xb0; 20]));
        assert_eq!(t.reserved_ledger_key(), None);
        t.bond_reserved = true;
        let key = t.reserved_ledger_key().unwrap();
        assert_eq!(key.chain_id, ChainId(10));
        assert_eq!(key.bonder, Address([0xb0; 20]));
    }
}
