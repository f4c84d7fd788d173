pub mod bond_attempt;
pub mod checkpoint;
pub mod gas_price;
pub mod liquidity;
pub mod observation;
pub mod transfer;

pub use bond_attempt::{AttemptKind, BondAttempt, NewBondAttempt};
pub use checkpoint::ChainCheckpoint;
pub use gas_price::GasPriceSample;
pub use liquidity::{LedgerError, LedgerKey, LiquidityLedger};
pub use observation::BondObservation;
pub use transfer::{NewTransfer, Transfer};

use std::str::FromStr;

// Postgres has no unsigned integers; block numbers and chain ids are BIGINT.

pub(crate) fn to_db_u64(value: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

pub(crate) fn from_db_u64(value: i64) -> Result<u64, sqlx::Error> {
    u64::try_from(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn parse_column<T>(column: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_owned(),
        source: Box::new(e),
    })
}

pub(crate) fn parse_optional_column<T>(
    column: &str,
    value: Option<&str>,
) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.map(|v| parse_column(column, v)).transpose()
}
