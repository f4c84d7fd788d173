//! Bond/skip decisions.
//!
//! [`evaluate`] is a pure function of the transfer, the configured policy,
//! the destination ledger and the latest gas sample. The profitability
//! formula sits behind [`FeePolicy`] so it can be swapped without touching
//! the rule order.

use crate::config::{NetworkConfig, TokenPolicy, TokenRoute};
use crate::entities::{GasPriceSample, LiquidityLedger, Transfer};
use bonder_sdk::objects::SkipReason;
use rust_decimal::Decimal;
use std::time::Duration;

/// Wei per whole native coin.
const WEI_PER_NATIVE: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeInputs {
    pub bonder_fee: Decimal,
    /// Wei per gas on the destination chain.
    pub gas_price: u128,
    pub gas_limit: u64,
    pub fee_multiplier: Decimal,
    /// Token base units per whole native coin.
    pub native_price: Decimal,
}

pub trait FeePolicy: Send + Sync {
    /// Fee the bonder keeps after paying for the bond, in token base units.
    fn projected_fee(&self, inputs: &FeeInputs) -> Decimal;
}

/// `bonder_fee - gas_price * gas_limit * fee_multiplier * native_price / 10^18`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasAdjustedFeePolicy;

impl GasAdjustedFeePolicy {
    pub fn gas_cost(inputs: &FeeInputs) -> Decimal {
        // A gas price beyond Decimal's range prices the bond out entirely.
        let Ok(gas_price) = Decimal::try_from_i128_with_scale(
            i128::try_from(inputs.gas_price).unwrap_or(i128::MAX),
            0,
        ) else {
            return Decimal::MAX;
        };
        gas_price
            .checked_mul(Decimal::from(inputs.gas_limit))
            .and_then(|wei| wei.checked_mul(inputs.fee_multiplier))
            .and_then(|wei| wei.checked_mul(inputs.native_price))
            .and_then(|v| v.checked_div(Decimal::from(WEI_PER_NATIVE)))
            .unwrap_or(Decimal::MAX)
    }
}

impl FeePolicy for GasAdjustedFeePolicy {
    fn projected_fee(&self, inputs: &FeeInputs) -> Decimal {
        inputs
            .bonder_fee
            .checked_sub(Self::gas_cost(inputs))
            .unwrap_or(Decimal::MIN)
    }
}

/// Why a transfer was neither bonded nor rejected this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    NoGasSample,
    /// The newest sample is older than the sampler should ever leave it.
    StaleGasSample,
    NoLedger,
}

impl DeferReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferReason::NoGasSample => "no-gas-sample",
            DeferReason::StaleGasSample => "stale-gas-sample",
            DeferReason::NoLedger => "no-ledger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Bond { projected_fee: Decimal },
    Skip(SkipReason),
    /// Inputs are missing; retry next cycle without changing state.
    Defer(DeferReason),
}

/// Everything [`evaluate`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs<'a> {
    pub transfer: &'a Transfer,
    pub token: Option<&'a TokenPolicy>,
    pub network: Option<&'a NetworkConfig>,
    pub ledger: Option<&'a LiquidityLedger>,
    pub gas: Option<&'a GasPriceSample>,
    /// Samples older than this are not priced against.
    pub max_gas_age: Duration,
    /// Unix seconds.
    pub now: i64,
}

impl PolicyInputs<'_> {
    fn route(&self) -> Option<(&TokenPolicy, &TokenRoute, &NetworkConfig)> {
        let token = self.token?;
        let route = token.routes.get(&self.transfer.destination_chain)?;
        let network = self.network?;
        network.bridge_for(&self.transfer.token)?;
        Some((token, route, network))
    }
}

/// Rules are checked in a fixed order; the first failing rule names the
/// skip reason.
pub fn evaluate(inputs: &PolicyInputs<'_>, fees: &dyn FeePolicy) -> Decision {
    let t = inputs.transfer;
    let Some((token, route, network)) = inputs.route() else {
        return Decision::Skip(SkipReason::UnsupportedRoute);
    };
    if t.amount <= Decimal::ZERO || t.bonder_fee < Decimal::ZERO {
        return Decision::Skip(SkipReason::InvalidAmount);
    }
    if t.committed_root.is_some() {
        return Decision::Skip(SkipReason::AlreadyCommitted);
    }
    // A zero deadline means the sender set none.
    if t.deadline != 0 && t.deadline < inputs.now {
        return Decision::Skip(SkipReason::DeadlineExpired);
    }
    if t.amount > token.max_trade_amount {
        return Decision::Skip(SkipReason::ExceedsMaxTradeAmount);
    }
    let Some(ledger) = inputs.ledger else {
        return Decision::Defer(DeferReason::NoLedger);
    };
    if ledger.available() < t.amount {
        return Decision::Skip(SkipReason::InsufficientLiquidity);
    }
    let Some(gas) = inputs.gas else {
        return Decision::Defer(DeferReason::NoGasSample);
    };
    let max_age = i64::try_from(inputs.max_gas_age.as_secs()).unwrap_or(i64::MAX);
    if gas.sampled_at.unix_timestamp().saturating_add(max_age) < inputs.now {
        return Decision::Defer(DeferReason::StaleGasSample);
    }
    let projected_fee = fees.projected_fee(&FeeInputs {
        bonder_fee: t.bonder_fee,
        gas_price: gas.gas_price,
        gas_limit: network.bond_gas_limit,
        fee_multiplier: network.fee_multiplier,
        native_price: route.native_price,
    });
    if projected_fee <= token.min_threshold {
        return Decision::Skip(SkipReason::BelowMinThreshold);
    }
    Decision::Bond { projected_fee }
}
