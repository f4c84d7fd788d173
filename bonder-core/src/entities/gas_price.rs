use crate::framework::DatabaseProcessor;
use bonder_sdk::objects::ChainId;
use kanau::processor::Processor;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use time::OffsetDateTime;

/// One gas price reading. Written only by the gas sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceSample {
    pub chain_id: ChainId,
    pub sampled_at: OffsetDateTime,
    /// Wei per gas unit.
    pub gas_price: u128,
}

#[derive(Debug, sqlx::FromRow)]
struct GasPriceRow {
    chain_id: i64,
    sampled_at: OffsetDateTime,
    gas_price: Decimal,
}

impl TryFrom<GasPriceRow> for GasPriceSample {
    type Error = sqlx::Error;

    fn try_from(row: GasPriceRow) -> Result<Self, Self::Error> {
        let gas_price = row.gas_price.to_u128().ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "gas_price".to_owned(),
            source: format!("not a u128: {}", row.gas_price).into(),
        })?;
        Ok(GasPriceSample {
            chain_id: ChainId(super::from_db_u64(row.chain_id)?),
            sampled_at: row.sampled_at,
            gas_price,
        })
    }
}

fn price_to_db(price: u128) -> Result<Decimal, sqlx::Error> {
    i128::try_from(price)
        .ok()
        .and_then(|p| Decimal::try_from_i128_with_scale(p, 0).ok())
        .ok_or_else(|| sqlx::Error::Encode(format!("gas price out of range: {price}").into()))
}

#[derive(Debug, Clone)]
pub struct InsertGasPriceSample {
    pub sample: GasPriceSample,
}

impl Processor<InsertGasPriceSample> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertGasPriceSample")]
    async fn process(&self, insert: InsertGasPriceSample) -> Result<(), sqlx::Error> {
        let sample = insert.sample;
        sqlx::query(
            "INSERT INTO gas_price_samples (chain_id, sampled_at, gas_price) VALUES ($1, $2, $3)",
        )
        .bind(super::to_db_u64(sample.chain_id.get())?)
        .bind(sample.sampled_at)
        .bind(price_to_db(sample.gas_price)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GetLatestGasPrice {
    pub chain_id: ChainId,
}

impl Processor<GetLatestGasPrice> for DatabaseProcessor {
    type Output = Option<GasPriceSample>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetLatestGasPrice")]
    async fn process(&self, query: GetLatestGasPrice) -> Result<Option<GasPriceSample>, sqlx::Error> {
        let row: Option<GasPriceRow> = sqlx::query_as(
            "SELECT chain_id, sampled_at, gas_price FROM gas_price_samples \
             WHERE chain_id = $1 ORDER BY sampled_at DESC, id DESC LIMIT 1",
        )
        .bind(super::to_db_u64(query.chain_id.get())?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(GasPriceSample::try_from).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PruneGasPriceSamples {
    pub older_than: OffsetDateTime,
}

impl Processor<PruneGasPriceSamples> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PruneGasPriceSamples")]
    async fn process(&self, query: PruneGasPriceSamples) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM gas_price_samples WHERE sampled_at < $1")
            .bind(query.older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
