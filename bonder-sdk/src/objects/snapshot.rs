use crate::objects::chains::{ChainId, TokenSymbol};
use crate::signature::Signature;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate bonder liquidity at a point in time.
///
/// Published for dashboards only. Nothing inside the bonder reads it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    /// Unix timestamp (seconds) the snapshot was assembled at.
    pub generated_at: i64,
    pub entries: Vec<LiquidityEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityEntry {
    pub chain_id: ChainId,
    pub token: TokenSymbol,
    pub bonder: String,
    pub total: Decimal,
    pub available: Decimal,
    pub in_flight: Decimal,
    pub settled: Decimal,
}

impl Signature for LiquiditySnapshot {}

impl LiquiditySnapshot {
    /// Sum of `available` per (chain, token) across every bonder.
    pub fn available_by_route(&self) -> Vec<(ChainId, TokenSymbol, Decimal)> {
        let mut out: Vec<(ChainId, TokenSymbol, Decimal)> = Vec::new();
        for entry in &self.entries {
            match out
                .iter_mut()
                .find(|(c, t, _)| *c == entry.chain_id && *t == entry.token)
            {
                Some((_, _, sum)) => *sum += entry.available,
                None => out.push((entry.chain_id, entry.token.clone(), entry.available)),
            }
        }
        out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        out
    }
}
