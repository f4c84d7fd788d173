//! Per (chain, token, bonder) capital accounting.
//!
//! Only `total`, `in_flight` and `settled` are stored. `available` is
//! derived, so `available + in_flight + settled == total` holds by
//! construction; every mutation instead guards that no component goes
//! negative.

use crate::chain::types::Address;
use crate::framework::DatabaseProcessor;
use bonder_sdk::objects::{ChainId, LiquidityEntry, TokenSymbol};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub chain_id: ChainId,
    pub token: TokenSymbol,
    pub bonder: Address,
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.chain_id, self.token, self.bonder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    NonPositive(Decimal),
    #[error("insufficient liquidity: available {available}, requested {requested}")]
    Insufficient { available: Decimal, requested: Decimal },
    #[error("in-flight underflow: in flight {in_flight}, requested {requested}")]
    InFlightUnderflow { in_flight: Decimal, requested: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidityLedger {
    pub key: LedgerKey,
    pub total: Decimal,
    pub in_flight: Decimal,
    pub settled: Decimal,
}

fn positive(amount: Decimal) -> Result<Decimal, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositive(amount));
    }
    Ok(amount)
}

impl LiquidityLedger {
    pub fn new(key: LedgerKey, total: Decimal) -> Self {
        Self {
            key,
            total,
            in_flight: Decimal::ZERO,
            settled: Decimal::ZERO,
        }
    }

    pub fn available(&self) -> Decimal {
        self.total - self.in_flight - self.settled
    }

    /// First phase of a bond: move `amount` from available to in flight.
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        let amount = positive(amount)?;
        let available = self.available();
        if available < amount {
            return Err(LedgerError::Insufficient {
                available,
                requested: amount,
            });
        }
        self.in_flight += amount;
        Ok(())
    }

    /// Undo a reservation whose transaction failed.
    pub fn release(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        let amount = positive(amount)?;
        if self.in_flight < amount {
            return Err(LedgerError::InFlightUnderflow {
                in_flight: self.in_flight,
                requested: amount,
            });
        }
        self.in_flight -= amount;
        Ok(())
    }

    /// The bond was settled on chain: in flight becomes settled.
    pub fn settle(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        let amount = positive(amount)?;
        if self.in_flight < amount {
            return Err(LedgerError::InFlightUnderflow {
                in_flight: self.in_flight,
                requested: amount,
            });
        }
        self.in_flight -= amount;
        self.settled += amount;
        Ok(())
    }

    pub fn deposit(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        self.total += positive(amount)?;
        Ok(())
    }

    /// Account for a bond the chain reports as already made by this bonder.
    ///
    /// The chain is authoritative here: if the ledger believes there is not
    /// enough available capital, `total` is raised by the shortfall. Returns
    /// the shortfall that was added.
    pub fn reserve_observed(&mut self, amount: Decimal) -> Result<Decimal, LedgerError> {
        let amount = positive(amount)?;
        let shortfall = (amount - self.available()).max(Decimal::ZERO);
        self.total += shortfall;
        self.in_flight += amount;
        Ok(shortfall)
    }

    pub fn to_entry(&self) -> LiquidityEntry {
        LiquidityEntry {
            chain_id: self.key.chain_id,
            token: self.key.token.clone(),
            bonder: self.key.bonder.to_string(),
            total: self.total,
            available: self.available(),
            in_flight: self.in_flight,
            settled: self.settled,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LedgerRow {
    pub chain_id: i64,
    pub token: String,
    pub bonder: String,
    pub total: Decimal,
    pub in_flight: Decimal,
    pub settled: Decimal,
}

impl TryFrom<LedgerRow> for LiquidityLedger {
    type Error = sqlx::Error;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LiquidityLedger {
            key: LedgerKey {
                chain_id: ChainId(super::from_db_u64(row.chain_id)?),
                token: TokenSymbol::new(&row.token),
                bonder: super::parse_column("bonder", &row.bonder)?,
            },
            total: row.total,
            in_flight: row.in_flight,
            settled: row.settled,
        })
    }
}

pub(crate) async fn lock_ledger_row(
    conn: &mut sqlx::PgConnection,
    key: &LedgerKey,
) -> Result<Option<LiquidityLedger>, sqlx::Error> {
    let row: Option<LedgerRow> = sqlx::query_as(
        r#"
        SELECT chain_id, token, bonder, total, in_flight, settled
        FROM liquidity_ledgers
        WHERE chain_id = $1 AND token = $2 AND bonder = $3
        FOR UPDATE
        "#,
    )
    .bind(super::to_db_u64(key.chain_id.get())?)
    .bind(key.token.as_str())
    .bind(key.bonder.to_string())
    .fetch_optional(conn)
    .await?;
    row.map(LiquidityLedger::try_from).transpose()
}

/// Write back a ledger read with `FOR UPDATE`. The table's CHECK
/// constraints reject any row where a component went negative.
pub(crate) async fn update_ledger(
    conn: &mut sqlx::PgConnection,
    ledger: &LiquidityLedger,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE liquidity_ledgers SET total = $4, in_flight = $5, settled = $6, updated_at = now() \
         WHERE chain_id = $1 AND token = $2 AND bonder = $3",
    )
    .bind(super::to_db_u64(ledger.key.chain_id.get())?)
    .bind(ledger.key.token.as_str())
    .bind(ledger.key.bonder.to_string())
    .bind(ledger.total)
    .bind(ledger.in_flight)
    .bind(ledger.settled)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GetLedger {
    pub key: LedgerKey,
}

impl Processor<GetLedger> for DatabaseProcessor {
    type Output = Option<LiquidityLedger>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLedger")]
    async fn process(&self, query: GetLedger) -> Result<Option<LiquidityLedger>, sqlx::Error> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT chain_id, token, bonder, total, in_flight, settled
            FROM liquidity_ledgers
            WHERE chain_id = $1 AND token = $2 AND bonder = $3
            "#,
        )
        .bind(super::to_db_u64(query.key.chain_id.get())?)
        .bind(query.key.token.as_str())
        .bind(query.key.bonder.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LiquidityLedger::try_from).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct ListLedgers;

impl Processor<ListLedgers> for DatabaseProcessor {
    type Output = Vec<LiquidityLedger>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListLedgers")]
    async fn process(&self, _query: ListLedgers) -> Result<Vec<LiquidityLedger>, sqlx::Error> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT chain_id, token, bonder, total, in_flight, settled
            FROM liquidity_ledgers
            ORDER BY chain_id, token, bonder
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LiquidityLedger::try_from).collect()
    }
}

#[derive(Debug, Clone)]
/// Create the ledger with an opening stake unless it already exists.
pub struct EnsureLedger {
    pub key: LedgerKey,
    pub stake: Decimal,
}

impl Processor<EnsureLedger> for DatabaseProcessor {
    type Output = LiquidityLedger;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:EnsureLedger")]
    async fn process(&self, insert: EnsureLedger) -> Result<LiquidityLedger, sqlx::Error> {
        sqlx::query(
            "INSERT INTO liquidity_ledgers (chain_id, token, bonder, total, in_flight, settled) \
             VALUES ($1, $2, $3, $4, 0, 0) \
             ON CONFLICT (chain_id, token, bonder) DO NOTHING",
        )
        .bind(super::to_db_u64(insert.key.chain_id.get())?)
        .bind(insert.key.token.as_str())
        .bind(insert.key.bonder.to_string())
        .bind(insert.stake)
        .execute(&self.pool)
        .await?;
        self.process(GetLedger { key: insert.key })
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(total: i64) -> LiquidityLedger {
        LiquidityLedger::new(
            LedgerKey {
                chain_id: ChainId(10),
                token: TokenSymbol::new("USDC"),
                bonder: Address([0xb0; 20]),
            },
            Decimal::from(total),
        )
    }

    fn conserved(l: &LiquidityLedger) -> bool {
        l.available() + l.in_flight + l.settled == l.total
            && l.available() >= Decimal::ZERO
            && l.in_flight >= Decimal::ZERO
            && l.settled >= Decimal::ZERO
    }

    #[test]
    fn reserve_then_settle() {
        let mut l = ledger(500);
        l.reserve(Decimal::from(100)).unwrap();
        assert_eq!(l.available(), Decimal::from(400));
        assert_eq!(l.in_flight, Decimal::from(100));
        l.settle(Decimal::from(100)).unwrap();
        assert_eq!(l.available(), Decimal::from(400));
        assert_eq!(l.in_flight, Decimal::ZERO);
        assert_eq!(l.settled, Decimal::from(100));
        assert!(conserved(&l));
    }

    #[test]
    fn release_restores_available() {
        let mut l = ledger(500);
        l.reserve(Decimal::from(100)).unwrap();
        l.release(Decimal::from(100)).unwrap();
        assert_eq!(l, ledger(500));
    }

    #[test]
    fn over_reservation_is_refused_without_side_effects() {
        let mut l = ledger(50);
        let err = l.reserve(Decimal::from(100)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Insufficient {
                available: Decimal::from(50),
                requested: Decimal::from(100)
            }
        );
        assert_eq!(l, ledger(50));
        assert!(l.release(Decimal::ONE).is_err());
        assert!(l.settle(Decimal::ONE).is_err());
        assert!(l.reserve(Decimal::ZERO).is_err());
    }

    #[test]
    fn observed_bond_tops_up_total() {
        let mut l = ledger(50);
        let shortfall = l.reserve_observed(Decimal::from(80)).unwrap();
        assert_eq!(shortfall, Decimal::from(30));
        assert_eq!(l.available(), Decimal::ZERO);
        assert!(conserved(&l));
    }
}
