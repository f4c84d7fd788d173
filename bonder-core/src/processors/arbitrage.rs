//! ArbitrageEvaluator processor.
//!
//! The ArbitrageEvaluator is responsible for:
//! - Reading the price of each configured pair on two venues
//! - Estimating the profit of trading the cheaper leg into the dearer one
//! - Submitting the trade to the pair's executor contract
//! - Keeping one trade per pair in flight and a cooldown after each action
//!
//! All per-pair state is in memory. A restart forgets cooldowns; a trade
//! still being mined at restart is not tracked.

use crate::chain::abi::{AbiError, CallBuilder, keccak256};
use crate::chain::types::{H256, TxHash, TxRequest};
use crate::chain::{ChainError, ChainRegistry};
use crate::config::{ArbPairConfig, ArbitrageSettings, VenueConfig};
use crate::policy::{FeeInputs, GasAdjustedFeePolicy};
use crate::store::{GasPriceStore, StoreError};
use async_trait::async_trait;
use bonder_sdk::objects::TokenSymbol;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const EXECUTE_ARBITRAGE: &str = "executeArbitrage(bytes32,bytes32,uint256,uint256)";

#[derive(Debug, Error)]
pub enum ArbError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("venue {venue} returned status {status}")]
    VenueStatus { venue: String, status: u16 },

    #[error("venue {venue} returned an unusable price: {price}")]
    InvalidPrice { venue: String, price: Decimal },

    #[error("venue {0} is not configured")]
    UnknownVenue(String),

    #[error("no arbitrage pair #{0}")]
    UnknownPair(usize),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("abi error: {0}")]
    Abi(#[from] AbiError),

    #[error("invalid venue url: {0}")]
    Url(#[from] url::ParseError),
}

/// A source of spot prices.
#[async_trait]
pub trait PriceVenue: Send + Sync {
    fn name(&self) -> &str;

    /// Units of `quote` per unit of `base`.
    async fn price(&self, base: &TokenSymbol, quote: &TokenSymbol) -> Result<Decimal, ArbError>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

/// `GET {base_url}/price?base=..&quote=..` answering `{"price": "<decimal>"}`.
pub struct HttpPriceVenue {
    name: String,
    base_url: url::Url,
    http_client: reqwest::Client,
}

impl HttpPriceVenue {
    pub fn new(config: &VenueConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl PriceVenue for HttpPriceVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn price(&self, base: &TokenSymbol, quote: &TokenSymbol) -> Result<Decimal, ArbError> {
        let mut url = self.base_url.join("price")?;
        url.query_pairs_mut()
            .append_pair("base", base.as_str())
            .append_pair("quote", quote.as_str());

        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArbError::VenueStatus {
                venue: self.name.clone(),
                status: status.as_u16(),
            });
        }
        let body: PriceResponse = response.json().await?;
        if body.price <= Decimal::ZERO {
            return Err(ArbError::InvalidPrice {
                venue: self.name.clone(),
                price: body.price,
            });
        }
        Ok(body.price)
    }
}

/// The last price comparison made for a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbOpportunity {
    pub pair: String,
    pub price_a: Decimal,
    pub price_b: Decimal,
    pub size: Decimal,
    pub gas_cost: Decimal,
    pub profit: Decimal,
    /// Venue the base token is bought on.
    pub buy_venue: String,
    pub sell_venue: String,
}

#[derive(Debug, Default)]
struct PairState {
    in_flight: bool,
    last_action: Option<Instant>,
    last_opportunity: Option<ArbOpportunity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbDecision {
    InFlight,
    CoolingDown { remaining: Duration },
    NoOpportunity(ArbOpportunity),
    Submitted { tx_hash: TxHash, opportunity: ArbOpportunity },
    /// Submission failed; the cooldown still applies.
    Failed { error: String },
}

pub fn pair_label(pair: &ArbPairConfig) -> String {
    format!("{}/{}@{}", pair.base, pair.quote, pair.chain_id)
}

fn venue_id(name: &str) -> H256 {
    H256(keccak256(name.as_bytes()))
}

pub(crate) fn arbitrage_call(
    pair: &ArbPairConfig,
    opportunity: &ArbOpportunity,
) -> Result<Vec<u8>, AbiError> {
    Ok(CallBuilder::new(EXECUTE_ARBITRAGE)
        .bytes32(&venue_id(&opportunity.buy_venue))
        .bytes32(&venue_id(&opportunity.sell_venue))
        .amount(opportunity.size)?
        .amount(pair.min_threshold.max(Decimal::ZERO).trunc())?
        .finish())
}

pub struct ArbitrageEvaluator {
    settings: ArbitrageSettings,
    venues: HashMap<String, Arc<dyn PriceVenue>>,
    chains: ChainRegistry,
    gas: Arc<dyn GasPriceStore>,
    state: Arc<Mutex<HashMap<usize, PairState>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ArbitrageEvaluator {
    pub fn new(
        settings: ArbitrageSettings,
        chains: ChainRegistry,
        gas: Arc<dyn GasPriceStore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let venues = settings
            .venues
            .iter()
            .map(|v| {
                (
                    v.name.clone(),
                    Arc::new(HttpPriceVenue::new(v)) as Arc<dyn PriceVenue>,
                )
            })
            .collect();
        Self {
            settings,
            venues,
            chains,
            gas,
            state: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(Vec::new()),
            shutdown_rx,
        }
    }

    /// Replace or add a venue by its name.
    pub fn with_venue(mut self, venue: Arc<dyn PriceVenue>) -> Self {
        self.venues.insert(venue.name().to_owned(), venue);
        self
    }

    pub fn pairs(&self) -> &[ArbPairConfig] {
        &self.settings.pairs
    }

    pub async fn last_opportunity(&self, index: usize) -> Option<ArbOpportunity> {
        self.state
            .lock()
            .await
            .get(&index)
            .and_then(|s| s.last_opportunity.clone())
    }

    pub async fn is_in_flight(&self, index: usize) -> bool {
        self.state
            .lock()
            .await
            .get(&index)
            .is_some_and(|s| s.in_flight)
    }

    fn venue(&self, name: &str) -> Result<&Arc<dyn PriceVenue>, ArbError> {
        self.venues
            .get(name)
            .ok_or_else(|| ArbError::UnknownVenue(name.to_owned()))
    }

    /// Clear the in-flight flag, optionally stamping the cooldown.
    async fn finish(&self, index: usize, acted: bool) {
        let mut state = self.state.lock().await;
        let entry = state.entry(index).or_default();
        entry.in_flight = false;
        if acted {
            entry.last_action = Some(Instant::now());
        }
    }

    async fn gas_price(&self, pair: &ArbPairConfig) -> Result<u128, ArbError> {
        if let Some(sample) = self.gas.latest_gas_sample(pair.chain_id).await? {
            return Ok(sample.gas_price);
        }
        Ok(self.chains.get(pair.chain_id)?.gas_price().await?)
    }

    async fn price_pair(&self, pair: &ArbPairConfig) -> Result<ArbOpportunity, ArbError> {
        let venue_a = self.venue(&pair.venue_a)?;
        let venue_b = self.venue(&pair.venue_b)?;
        let (price_a, price_b) = tokio::try_join!(
            venue_a.price(&pair.base, &pair.quote),
            venue_b.price(&pair.base, &pair.quote),
        )?;
        let gas_price = self.gas_price(pair).await?;

        let size = pair.max_trade_amount;
        let gas_cost = GasAdjustedFeePolicy::gas_cost(&FeeInputs {
            bonder_fee: Decimal::ZERO,
            gas_price,
            gas_limit: pair.gas_limit,
            fee_multiplier: Decimal::ONE,
            native_price: pair.native_price,
        });
        let profit = (price_a - price_b)
            .abs()
            .checked_mul(size)
            .and_then(|gross| gross.checked_sub(gas_cost))
            .unwrap_or(Decimal::MIN);
        let (buy_venue, sell_venue) = if price_a <= price_b {
            (pair.venue_a.clone(), pair.venue_b.clone())
        } else {
            (pair.venue_b.clone(), pair.venue_a.clone())
        };

        Ok(ArbOpportunity {
            pair: pair_label(pair),
            price_a,
            price_b,
            size,
            gas_cost,
            profit,
            buy_venue,
            sell_venue,
        })
    }

    /// Evaluate one pair and trade if it clears the threshold.
    pub async fn evaluate(&self, index: usize) -> Result<ArbDecision, ArbError> {
        let Some(pair) = self.settings.pairs.get(index) else {
            return Err(ArbError::UnknownPair(index));
        };

        {
            let mut state = self.state.lock().await;
            let entry = state.entry(index).or_default();
            if entry.in_flight {
                return Ok(ArbDecision::InFlight);
            }
            if let Some(last) = entry.last_action {
                let elapsed = last.elapsed();
                if elapsed < pair.cooldown {
                    return Ok(ArbDecision::CoolingDown {
                        remaining: pair.cooldown - elapsed,
                    });
                }
            }
            entry.in_flight = true;
        }

        let opportunity = match self.price_pair(pair).await {
            Ok(opportunity) => opportunity,
            Err(e) => {
                self.finish(index, false).await;
                return Err(e);
            }
        };
        self.state
            .lock()
            .await
            .entry(index)
            .or_default()
            .last_opportunity = Some(opportunity.clone());

        if opportunity.profit < pair.min_threshold {
            debug!(
                pair = %opportunity.pair,
                profit = %opportunity.profit,
                min_threshold = %pair.min_threshold,
                "No arbitrage opportunity"
            );
            self.finish(index, false).await;
            return Ok(ArbDecision::NoOpportunity(opportunity));
        }

        self.submit(index, pair, opportunity).await
    }

    async fn submit(
        &self,
        index: usize,
        pair: &ArbPairConfig,
        opportunity: ArbOpportunity,
    ) -> Result<ArbDecision, ArbError> {
        let prepared = arbitrage_call(pair, &opportunity)
            .map_err(ArbError::from)
            .and_then(|data| Ok((data, self.chains.get(pair.chain_id)?)));
        let (data, chain) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.finish(index, false).await;
                return Err(e);
            }
        };

        let tx_hash = match chain
            .submit_transaction(TxRequest {
                from: pair.trader,
                to: pair.executor,
                data,
                value: 0,
                gas_limit: Some(pair.gas_limit),
            })
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                warn!(pair = %opportunity.pair, error = %e, "Arbitrage submission failed");
                self.finish(index, true).await;
                return Ok(ArbDecision::Failed {
                    error: e.to_string(),
                });
            }
        };
        info!(
            pair = %opportunity.pair,
            tx_hash = %tx_hash,
            buy = %opportunity.buy_venue,
            sell = %opportunity.sell_venue,
            profit = %opportunity.profit,
            "Arbitrage submitted"
        );

        let state = self.state.clone();
        let label = opportunity.pair.clone();
        let handle = tokio::spawn(async move {
            match chain.wait_for_confirmation(tx_hash).await {
                Ok(receipt) if receipt.success => {
                    info!(pair = %label, tx_hash = %tx_hash, "Arbitrage confirmed");
                }
                Ok(_) => warn!(pair = %label, tx_hash = %tx_hash, "Arbitrage reverted"),
                Err(e) => {
                    warn!(pair = %label, tx_hash = %tx_hash, error = %e, "Arbitrage confirmation failed")
                }
            }
            let mut state = state.lock().await;
            let entry = state.entry(index).or_default();
            entry.in_flight = false;
            entry.last_action = Some(Instant::now());
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);

        Ok(ArbDecision::Submitted {
            tx_hash,
            opportunity,
        })
    }

    /// Wait for every spawned confirmation task.
    pub async fn settle_pending(&self) {
        let handles: Vec<JoinHandle<()>> = self.pending.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Arbitrage confirmation task failed");
            }
        }
    }

    /// Evaluate every pair once.
    pub async fn run_once(&self) -> Vec<Result<ArbDecision, ArbError>> {
        let mut out = Vec::with_capacity(self.settings.pairs.len());
        for index in 0..self.settings.pairs.len() {
            out.push(self.evaluate(index).await);
        }
        out
    }

    /// Run the ArbitrageEvaluator until shutdown.
    pub async fn run(mut self) {
        info!(pairs = self.settings.pairs.len(), "ArbitrageEvaluator started");

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("ArbitrageEvaluator received shutdown signal");
                        break;
                    }
                }

                _ = interval.tick() => {
                    for (index, result) in self.run_once().await.into_iter().enumerate() {
                        if let Err(e) = result {
                            let pair = self.settings.pairs.get(index).map(pair_label).unwrap_or_default();
                            warn!(pair = %pair, error = %e, "Arbitrage evaluation failed");
                        }
                    }
                }
            }
        }

        self.settle_pending().await;
        info!("ArbitrageEvaluator shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::selector;
    use crate::chain::types::Address;
    use bonder_sdk::objects::ChainId;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pair() -> ArbPairConfig {
        ArbPairConfig {
            base: TokenSymbol::new("ETH"),
            quote: TokenSymbol::new("USDC"),
            chain_id: ChainId(10),
            venue_a: "a".to_owned(),
            venue_b: "b".to_owned(),
            executor: Address([0xee; 20]),
            trader: Address([0x7a; 20]),
            max_trade_amount: Decimal::from(2),
            min_threshold: Decimal::from(5),
            gas_limit: 100_000,
            native_price: Decimal::from(2000),
            cooldown: Duration::from_secs(60),
        }
    }

    #[test]
    fn call_encodes_direction_and_size() {
        let opportunity = ArbOpportunity {
            pair: "ETH/USDC@10".to_owned(),
            price_a: Decimal::from(100),
            price_b: Decimal::from(110),
            size: Decimal::from(2),
            gas_cost: Decimal::ZERO,
            profit: Decimal::from(20),
            buy_venue: "a".to_owned(),
            sell_venue: "b".to_owned(),
        };
        let data = arbitrage_call(&pair(), &opportunity).unwrap();
        assert_eq!(data.len(), 4 + 4 * 32);
        assert_eq!(data[..4], selector(EXECUTE_ARBITRAGE));
        assert_eq!(&data[4..4 + 32], &keccak256(b"a"));
        assert_eq!(&data[4 + 32..4 + 64], &keccak256(b"b"));
        assert_eq!(data[4 + 95], 2);
        assert_eq!(data[4 + 127], 5);
    }

    #[tokio::test]
    async fn http_venue_reads_decimal_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/price"))
            .and(query_param("base", "ETH"))
            .and(query_param("quote", "USDC"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "price": "2501.25" })),
            )
            .mount(&server)
            .await;

        let venue = HttpPriceVenue::new(&VenueConfig {
            name: "dex".to_owned(),
            base_url: url::Url::parse(&format!("{}/", server.uri())).unwrap(),
        });
        let price = venue
            .price(&TokenSymbol::new("ETH"), &TokenSymbol::new("USDC"))
            .await
            .unwrap();
        assert_eq!(price, Decimal::new(250125, 2));
    }

    #[tokio::test]
    async fn http_venue_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let venue = HttpPriceVenue::new(&VenueConfig {
            name: "dex".to_owned(),
            base_url: url::Url::parse(&format!("{}/", server.uri())).unwrap(),
        });
        assert!(matches!(
            venue
                .price(&TokenSymbol::new("ETH"), &TokenSymbol::new("USDC"))
                .await,
            Err(ArbError::VenueStatus { status: 503, .. })
        ));
    }
}
