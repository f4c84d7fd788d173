//! Validated, immutable runtime configuration.
//!
//! Built once at startup (see `bonder-node`'s loader) and shared by `Arc`.
//! Every field is typed and already defaulted; nothing here re-reads the
//! environment.

use crate::chain::types::{Address, LogFilter};
use crate::events::protocol_topics;
use bonder_sdk::objects::{ChainId, TokenSymbol};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub networks: BTreeMap<ChainId, NetworkConfig>,
    pub tokens: BTreeMap<TokenSymbol, TokenPolicy>,
    pub timeouts: ChainTimeouts,
    pub watcher: WatcherSettings,
    pub engine: EngineSettings,
    pub sampler: SamplerSettings,
    pub snapshot: Option<SnapshotSettings>,
    pub arbitrage: ArbitrageSettings,
}

impl BridgeConfig {
    pub fn network(&self, chain_id: ChainId) -> Option<&NetworkConfig> {
        self.networks.get(&chain_id)
    }

    pub fn token(&self, token: &TokenSymbol) -> Option<&TokenPolicy> {
        self.tokens.get(token)
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_urls: Vec<Url>,
    pub explorer_urls: Vec<Url>,
    pub wait_confirmations: u64,
    /// First block the watcher scans on a fresh database.
    pub start_block: u64,
    pub max_block_range: u64,
    pub reorg_rollback_depth: u64,
    /// Scales the gas cost charged against a bond on this chain.
    pub fee_multiplier: Decimal,
    pub bond_gas_limit: u64,
    pub settle_gas_limit: u64,
    pub bridges: Vec<BridgeContract>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeContract {
    pub token: TokenSymbol,
    pub address: Address,
}

impl NetworkConfig {
    pub fn bridge_for(&self, token: &TokenSymbol) -> Option<Address> {
        self.bridges
            .iter()
            .find(|b| &b.token == token)
            .map(|b| b.address)
    }

    pub fn token_at(&self, address: &Address) -> Option<&TokenSymbol> {
        self.bridges
            .iter()
            .find(|b| &b.address == address)
            .map(|b| &b.token)
    }

    pub fn log_filter(&self) -> LogFilter {
        LogFilter {
            addresses: self.bridges.iter().map(|b| b.address).collect(),
            topics0: protocol_topics(),
        }
    }
}

/// Bonding policy for one token.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub symbol: TokenSymbol,
    /// Account that signs bonds and owns the ledgers for this token.
    pub bonder: Address,
    pub max_trade_amount: Decimal,
    /// The projected fee must be strictly greater than this.
    pub min_threshold: Decimal,
    /// Destination chains this token can be bonded on.
    pub routes: BTreeMap<ChainId, TokenRoute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRoute {
    /// Opening ledger total, used only when the ledger does not exist yet.
    pub initial_stake: Decimal,
    /// Base units of the token per whole native coin of the chain, used to
    /// price gas.
    pub native_price: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct ChainTimeouts {
    pub rpc: Duration,
    pub confirmation: Duration,
}

/// Slack for the store round trips between taking a lease and confirming.
pub const LEASE_STORE_MARGIN: Duration = Duration::from_secs(60);

impl ChainTimeouts {
    /// Shortest lease that covers one submission and its confirmation wait.
    pub fn min_lock_lease(&self) -> Duration {
        self.rpc + self.confirmation + LEASE_STORE_MARGIN
    }
}

impl Default for ChainTimeouts {
    fn default() -> Self {
        Self {
            rpc: Duration::from_secs(15),
            confirmation: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub header_concurrency: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            header_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent_bonds: usize,
    /// How long a transfer lease is honoured. Must exceed
    /// [`ChainTimeouts::min_lock_lease`].
    pub lock_lease: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 50,
            max_concurrent_bonds: 4,
            lock_lease: Duration::from_secs(900),
            retry_base: Duration::from_secs(15),
            retry_max: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub interval: Duration,
    /// Samples older than this are pruned. `None` keeps everything.
    pub retention: Option<Duration>,
}

/// Sampler intervals a gas sample may miss before bonding pauses.
pub const STALE_SAMPLE_INTERVALS: u32 = 3;

impl SamplerSettings {
    pub fn max_sample_age(&self) -> Duration {
        self.interval * STALE_SAMPLE_INTERVALS
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub interval: Duration,
    /// Object-storage base url; the document is PUT to `{endpoint}/{key}`.
    pub endpoint: Url,
    pub key: String,
    pub signing_key: Option<Vec<u8>>,
    pub upload_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ArbitrageSettings {
    pub interval: Duration,
    pub venues: Vec<VenueConfig>,
    pub pairs: Vec<ArbPairConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueConfig {
    pub name: String,
    pub base_url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbPairConfig {
    pub base: TokenSymbol,
    pub quote: TokenSymbol,
    pub chain_id: ChainId,
    pub venue_a: String,
    pub venue_b: String,
    /// Contract that executes the two legs atomically.
    pub executor: Address,
    pub trader: Address,
    /// Trade size in base units of `base`.
    pub max_trade_amount: Decimal,
    /// Minimum net profit in units of `quote`.
    pub min_threshold: Decimal,
    pub gas_limit: u64,
    /// Units of `quote` per whole native coin.
    pub native_price: Decimal,
    pub cooldown: Duration,
}
