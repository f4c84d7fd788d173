//! TOML file configuration structures.
//!
//! These structs directly map to the `bonder-config.toml` file format.
//! Durations are whole seconds; amounts are decimal strings or numbers.

use bonder_core::chain::types::Address;
use bonder_core::config::{ChainTimeouts, EngineSettings, SamplerSettings, WatcherSettings};
use bonder_sdk::objects::{ChainId, TokenSymbol};
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    pub networks: Vec<NetworkFile>,
    #[serde(default)]
    pub tokens: Vec<TokenFile>,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    pub snapshot: Option<SnapshotConfig>,
    #[serde(default)]
    pub arbitrage: ArbitrageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub rpc_secs: u64,
    pub confirmation_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let d = ChainTimeouts::default();
        Self {
            rpc_secs: d.rpc.as_secs(),
            confirmation_secs: d.confirmation.as_secs(),
        }
    }
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_rollback_depth() -> u64 {
    64
}

fn default_fee_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_bond_gas_limit() -> u64 {
    250_000
}

fn default_settle_gas_limit() -> u64 {
    150_000
}

/// One `[[networks]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkFile {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_urls: Vec<Url>,
    #[serde(default)]
    pub explorer_urls: Vec<Url>,
    pub wait_confirmations: u64,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_rollback_depth")]
    pub reorg_rollback_depth: u64,
    #[serde(default = "default_fee_multiplier")]
    pub fee_multiplier: Decimal,
    #[serde(default = "default_bond_gas_limit")]
    pub bond_gas_limit: u64,
    #[serde(default = "default_settle_gas_limit")]
    pub settle_gas_limit: u64,
    #[serde(default)]
    pub bridges: Vec<BridgeFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeFile {
    pub token: TokenSymbol,
    pub address: Address,
}

/// One `[[tokens]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenFile {
    pub symbol: TokenSymbol,
    pub bonder: Address,
    pub max_trade_amount: Decimal,
    pub min_threshold: Decimal,
    #[serde(default)]
    pub routes: Vec<RouteFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteFile {
    pub chain_id: ChainId,
    #[serde(default)]
    pub initial_stake: Decimal,
    /// Token units per whole native coin of `chain_id`.
    pub native_token_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub header_concurrency: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        let d = WatcherSettings::default();
        Self {
            poll_interval_secs: d.poll_interval.as_secs(),
            max_backoff_secs: d.max_backoff.as_secs(),
            header_concurrency: d.header_concurrency,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_concurrent_bonds: usize,
    pub lock_lease_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let d = EngineSettings::default();
        Self {
            poll_interval_secs: d.poll_interval.as_secs(),
            batch_size: d.batch_size,
            max_concurrent_bonds: d.max_concurrent_bonds,
            lock_lease_secs: d.lock_lease.as_secs(),
            retry_base_secs: d.retry_base.as_secs(),
            retry_max_secs: d.retry_max.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_secs: u64,
    /// Zero keeps every sample.
    pub retention_secs: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        let d = SamplerSettings::default();
        Self {
            interval_secs: d.interval.as_secs(),
            retention_secs: d.retention.map(|r| r.as_secs()).unwrap_or_default(),
        }
    }
}

/// `[snapshot]`. The signing key and upload token come from the
/// environment, never from this file.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
    pub endpoint: Url,
    #[serde(default = "default_snapshot_key")]
    pub key: String,
}

fn default_snapshot_interval() -> u64 {
    60
}

fn default_snapshot_key() -> String {
    "liquidity.json".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    pub interval_secs: u64,
    pub venues: Vec<VenueFile>,
    pub pairs: Vec<ArbPairFile>,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            venues: Vec::new(),
            pairs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueFile {
    pub name: String,
    pub base_url: Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbPairFile {
    pub base: TokenSymbol,
    pub quote: TokenSymbol,
    pub chain_id: ChainId,
    pub venue_a: String,
    pub venue_b: String,
    pub executor: Address,
    pub trader: Address,
    pub max_trade_amount: Decimal,
    pub min_threshold: Decimal,
    #[serde(default = "default_bond_gas_limit")]
    pub gas_limit: u64,
    pub native_token_price: Decimal,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_cooldown() -> u64 {
    300
}
