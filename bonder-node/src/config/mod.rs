//! Configuration module for bonder-node.
//!
//! Handles loading configuration from the TOML file and the environment,
//! validating it, and building the immutable
//! [`BridgeConfig`](bonder_core::config::BridgeConfig) every daemon shares.

pub mod env;
pub mod file;

use bonder_core::config::{
    ArbPairConfig, ArbitrageSettings, BridgeConfig, BridgeContract, ChainTimeouts, EngineSettings,
    LEASE_STORE_MARGIN, NetworkConfig, SamplerSettings, SnapshotSettings, TokenPolicy, TokenRoute,
    VenueConfig, WatcherSettings,
};
use bonder_sdk::objects::ChainId;
use env::{DATABASE_URL, Environment, SNAPSHOT_SIGNING_KEY, SNAPSHOT_UPLOAD_TOKEN};
use file::{FileConfig, LoggingConfig, StoreConfig};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to read env file: {0}")]
    EnvFile(#[from] dotenvy::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub bridge: BridgeConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub env: Environment,
}

impl LoadedConfig {
    pub fn database_url(&self) -> Result<String, ConfigError> {
        self.env.var(DATABASE_URL).ok_or(ConfigError::MissingDatabaseUrl)
    }
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, env_file: Option<PathBuf>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            env_file,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the env file, if any
    /// 2. Read the TOML file
    /// 3. Validate it and build the runtime configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let env = match &self.env_file {
            Some(path) => Environment::from_file(path)?,
            None => Environment::from_process(),
        };
        let content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&content)?;
        let bridge = build_bridge_config(&file_config, &env)?;
        Ok(LoadedConfig {
            bridge,
            store: file_config.store,
            logging: file_config.logging,
            env,
        })
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn nonzero_secs(field: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(invalid(format!("{field} must be at least one second")));
    }
    Ok(secs(value))
}

/// Validate a parsed file and turn it into a [`BridgeConfig`].
pub fn build_bridge_config(file: &FileConfig, env: &Environment) -> Result<BridgeConfig, ConfigError> {
    let networks = build_networks(file)?;
    let tokens = build_tokens(file, &networks)?;

    let timeouts = ChainTimeouts {
        rpc: nonzero_secs("timeouts.rpc_secs", file.timeouts.rpc_secs)?,
        confirmation: nonzero_secs("timeouts.confirmation_secs", file.timeouts.confirmation_secs)?,
    };

    let watcher = WatcherSettings {
        poll_interval: nonzero_secs("watcher.poll_interval_secs", file.watcher.poll_interval_secs)?,
        max_backoff: secs(file.watcher.max_backoff_secs),
        header_concurrency: file.watcher.header_concurrency.max(1),
    };

    let engine = EngineSettings {
        poll_interval: nonzero_secs("engine.poll_interval_secs", file.engine.poll_interval_secs)?,
        batch_size: file.engine.batch_size.max(1),
        max_concurrent_bonds: file.engine.max_concurrent_bonds.max(1),
        lock_lease: secs(file.engine.lock_lease_secs),
        retry_base: secs(file.engine.retry_base_secs),
        retry_max: secs(file.engine.retry_max_secs),
    };
    // A lease that lapses mid-confirmation lets a second engine bond again.
    let min_lease = timeouts.min_lock_lease();
    if engine.lock_lease <= min_lease {
        return Err(invalid(format!(
            "engine.lock_lease_secs ({}) must exceed timeouts.rpc_secs + \
             timeouts.confirmation_secs + {}s ({}s)",
            file.engine.lock_lease_secs,
            LEASE_STORE_MARGIN.as_secs(),
            min_lease.as_secs()
        )));
    }

    let sampler = SamplerSettings {
        interval: nonzero_secs("sampler.interval_secs", file.sampler.interval_secs)?,
        retention: (file.sampler.retention_secs > 0).then(|| secs(file.sampler.retention_secs)),
    };

    let snapshot = match &file.snapshot {
        Some(s) => Some(SnapshotSettings {
            interval: nonzero_secs("snapshot.interval_secs", s.interval_secs)?,
            endpoint: s.endpoint.clone(),
            key: s.key.clone(),
            signing_key: env.var(SNAPSHOT_SIGNING_KEY).map(String::into_bytes),
            upload_token: env.var(SNAPSHOT_UPLOAD_TOKEN),
        }),
        None => None,
    };

    let arbitrage = build_arbitrage(file, &networks)?;

    Ok(BridgeConfig {
        networks,
        tokens,
        timeouts,
        watcher,
        engine,
        sampler,
        snapshot,
        arbitrage,
    })
}

fn build_networks(file: &FileConfig) -> Result<BTreeMap<ChainId, NetworkConfig>, ConfigError> {
    if file.networks.is_empty() {
        return Err(invalid("at least one [[networks]] entry is required"));
    }
    let mut networks = BTreeMap::new();
    for n in &file.networks {
        if n.rpc_urls.is_empty() {
            return Err(invalid(format!("network {} has no rpc_urls", n.name)));
        }
        if n.max_block_range == 0 {
            return Err(invalid(format!("network {}: max_block_range must be positive", n.name)));
        }
        if n.fee_multiplier <= Decimal::ZERO {
            return Err(invalid(format!("network {}: fee_multiplier must be positive", n.name)));
        }
        let mut seen = HashSet::new();
        for bridge in &n.bridges {
            if !seen.insert(&bridge.token) {
                return Err(invalid(format!(
                    "network {}: token {} has more than one bridge",
                    n.name, bridge.token
                )));
            }
        }
        let network = NetworkConfig {
            chain_id: n.chain_id,
            name: n.name.clone(),
            rpc_urls: n.rpc_urls.clone(),
            explorer_urls: n.explorer_urls.clone(),
            wait_confirmations: n.wait_confirmations,
            start_block: n.start_block,
            max_block_range: n.max_block_range,
            reorg_rollback_depth: n.reorg_rollback_depth.max(1),
            fee_multiplier: n.fee_multiplier,
            bond_gas_limit: n.bond_gas_limit,
            settle_gas_limit: n.settle_gas_limit,
            bridges: n
                .bridges
                .iter()
                .map(|b| BridgeContract {
                    token: b.token.clone(),
                    address: b.address,
                })
                .collect(),
        };
        if networks.insert(n.chain_id, network).is_some() {
            return Err(invalid(format!("chain id {} is configured twice", n.chain_id)));
        }
    }
    Ok(networks)
}

fn build_tokens(
    file: &FileConfig,
    networks: &BTreeMap<ChainId, NetworkConfig>,
) -> Result<BTreeMap<bonder_sdk::objects::TokenSymbol, TokenPolicy>, ConfigError> {
    let mut tokens = BTreeMap::new();
    for t in &file.tokens {
        if t.max_trade_amount <= Decimal::ZERO {
            return Err(invalid(format!("token {}: max_trade_amount must be positive", t.symbol)));
        }
        if t.min_threshold < Decimal::ZERO {
            return Err(invalid(format!("token {}: min_threshold must not be negative", t.symbol)));
        }
        let mut routes = BTreeMap::new();
        for r in &t.routes {
            let network = networks.get(&r.chain_id).ok_or_else(|| {
                invalid(format!("token {}: route to unknown chain {}", t.symbol, r.chain_id))
            })?;
            if network.bridge_for(&t.symbol).is_none() {
                return Err(invalid(format!(
                    "token {}: network {} has no bridge for it",
                    t.symbol, network.name
                )));
            }
            if r.initial_stake < Decimal::ZERO || r.native_token_price <= Decimal::ZERO {
                return Err(invalid(format!(
                    "token {}: route {} needs a non-negative stake and a positive native_token_price",
                    t.symbol, r.chain_id
                )));
            }
            routes.insert(
                r.chain_id,
                TokenRoute {
                    initial_stake: r.initial_stake,
                    native_price: r.native_token_price,
                },
            );
        }
        let policy = TokenPolicy {
            symbol: t.symbol.clone(),
            bonder: t.bonder,
            max_trade_amount: t.max_trade_amount,
            min_threshold: t.min_threshold,
            routes,
        };
        if tokens.insert(t.symbol.clone(), policy).is_some() {
            return Err(invalid(format!("token {} is configured twice", t.symbol)));
        }
    }
    Ok(tokens)
}

fn build_arbitrage(
    file: &FileConfig,
    networks: &BTreeMap<ChainId, NetworkConfig>,
) -> Result<ArbitrageSettings, ConfigError> {
    let arb = &file.arbitrage;
    let mut names = HashSet::new();
    for venue in &arb.venues {
        if !names.insert(venue.name.as_str()) {
            return Err(invalid(format!("venue {} is configured twice", venue.name)));
        }
    }

    let mut pairs = Vec::with_capacity(arb.pairs.len());
    for p in &arb.pairs {
        for venue in [&p.venue_a, &p.venue_b] {
            if !names.contains(venue.as_str()) {
                return Err(invalid(format!(
                    "pair {}/{}: unknown venue {venue}",
                    p.base, p.quote
                )));
            }
        }
        if !networks.contains_key(&p.chain_id) {
            return Err(invalid(format!(
                "pair {}/{}: unknown chain {}",
                p.base, p.quote, p.chain_id
            )));
        }
        if p.max_trade_amount <= Decimal::ZERO || p.native_token_price <= Decimal::ZERO {
            return Err(invalid(format!(
                "pair {}/{}: max_trade_amount and native_token_price must be positive",
                p.base, p.quote
            )));
        }
        pairs.push(ArbPairConfig {
            base: p.base.clone(),
            quote: p.quote.clone(),
            chain_id: p.chain_id,
            venue_a: p.venue_a.clone(),
            venue_b: p.venue_b.clone(),
            executor: p.executor,
            trader: p.trader,
            max_trade_amount: p.max_trade_amount,
            min_threshold: p.min_threshold,
            gas_limit: p.gas_limit,
            native_price: p.native_token_price,
            cooldown: secs(p.cooldown_secs),
        });
    }

    let interval = if pairs.is_empty() {
        secs(arb.interval_secs.max(1))
    } else {
        nonzero_secs("arbitrage.interval_secs", arb.interval_secs)?
    };

    Ok(ArbitrageSettings {
        interval,
        venues: arb
            .venues
            .iter()
            .map(|v| VenueConfig {
                name: v.name.clone(),
                base_url: v.base_url.clone(),
            })
            .collect(),
        pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bonder_sdk::objects::TokenSymbol;
    use std::io::Write;

    const BASE: &str = r#"
[timeouts]
confirmation_secs = 120

[engine]
lock_lease_secs = 600

[[networks]]
chain_id = 1
name = "ethereum"
rpc_urls = ["https://eth.example.com"]
wait_confirmations = 12

[[networks.bridges]]
token = "USDC"
address = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1"

[[networks]]
chain_id = 10
name = "optimism"
rpc_urls = ["https://op.example.com"]
wait_confirmations = 3

[[networks.bridges]]
token = "USDC"
address = "0xa2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2"

[[tokens]]
symbol = "USDC"
bonder = "0xb0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0"
max_trade_amount = "1000"
min_threshold = "1"

[[tokens.routes]]
chain_id = 10
initial_stake = "500"
native_token_price = "2000"
"#;

    fn build(toml_str: &str) -> Result<BridgeConfig, ConfigError> {
        let file: FileConfig = toml::from_str(toml_str)?;
        build_bridge_config(&file, &Environment::default())
    }

    #[test]
    fn test_builds_typed_config() {
        let config = build(BASE).unwrap();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.timeouts.confirmation, Duration::from_secs(120));
        assert_eq!(config.engine.lock_lease, Duration::from_secs(600));

        let usdc = config.token(&TokenSymbol::new("USDC")).unwrap();
        let route = usdc.routes[&ChainId(10)];
        assert_eq!(route.initial_stake, Decimal::from(500));
        assert_eq!(route.native_price, Decimal::from(2000));
        assert!(config.snapshot.is_none());
    }

    #[test]
    fn test_route_needs_a_bridge() {
        let toml_str = BASE.replace(
            "chain_id = 10\ninitial_stake",
            "chain_id = 1\ninitial_stake",
        );
        let toml_str = toml_str.replace(
            "token = \"USDC\"\naddress = \"0xa1",
            "token = \"DAI\"\naddress = \"0xa1",
        );
        let err = build(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(m) if m.contains("no bridge")));
    }

    #[test]
    fn test_duplicate_chain_is_rejected() {
        let toml_str = BASE.replace("chain_id = 10\nname", "chain_id = 1\nname");
        let err = build(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(m) if m.contains("twice")));
    }

    #[test]
    fn test_lease_must_outlive_submit_and_confirmation() {
        // rpc 15 + confirmation 120 + store margin 60 = 195
        for too_short in [60, 121, 195] {
            let toml_str = BASE.replace(
                "lock_lease_secs = 600",
                &format!("lock_lease_secs = {too_short}"),
            );
            let err = build(&toml_str).unwrap_err();
            assert!(
                matches!(&err, ConfigError::ValidationError(m) if m.contains("lock_lease_secs")),
                "lease {too_short} accepted: {err:?}"
            );
        }
        let toml_str = BASE.replace("lock_lease_secs = 600", "lock_lease_secs = 196");
        assert_eq!(
            build(&toml_str).unwrap().engine.lock_lease,
            Duration::from_secs(196)
        );
    }

    #[test]
    fn test_pair_with_unknown_venue_is_rejected() {
        let toml_str = format!(
            "{BASE}\n[[arbitrage.pairs]]\nbase = \"ETH\"\nquote = \"USDC\"\nchain_id = 10\n\
             venue_a = \"alpha\"\nvenue_b = \"beta\"\n\
             executor = \"0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee\"\n\
             trader = \"0x7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a7a\"\n\
             max_trade_amount = \"1\"\nmin_threshold = \"5\"\nnative_token_price = \"2000\"\n"
        );
        let err = build(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(m) if m.contains("unknown venue")));
    }

    #[test]
    fn test_loader_reads_secrets_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("bonder-config.toml");
        let env_path = dir.path().join("bonder.env");
        std::fs::write(
            &config_path,
            format!("{BASE}\n[snapshot]\nendpoint = \"https://bucket.example.com/\"\n"),
        )
        .unwrap();
        let mut env_file = std::fs::File::create(&env_path).unwrap();
        writeln!(env_file, "SNAPSHOT_SIGNING_KEY=bonder-secret").unwrap();

        let loaded = ConfigLoader::new(&config_path, Some(env_path)).load().unwrap();
        let snapshot = loaded.bridge.snapshot.unwrap();
        if std::env::var(SNAPSHOT_SIGNING_KEY).is_err() {
            assert_eq!(snapshot.signing_key.as_deref(), Some(&b"bonder-secret"[..]));
        }
        assert_eq!(snapshot.key, "liquidity.json");
    }
}
