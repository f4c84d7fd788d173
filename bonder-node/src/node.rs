//! Daemon wiring.
//!
//! Builds the chain clients and the store, then spawns the processors a
//! command asks for and waits for them to wind down after shutdown.

use anyhow::Context;
use bonder_core::chain::rpc::RpcChainClient;
use bonder_core::chain::{ChainAccess, ChainRegistry, TimeoutChain};
use bonder_core::config::{BridgeConfig, NetworkConfig};
use bonder_core::events::work_notice_channel;
use bonder_core::processors::{
    ArbitrageEvaluator, BondingEngine, ChainWatcher, GasSampler, SnapshotPublisher,
};
use bonder_core::store::PgStore;
use bonder_sdk::objects::ChainId;
use futures_util::future::try_join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Which daemons to run in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Watch(ChainId),
    Bond,
    GasSampler,
    Arbitrage,
    All,
}

pub struct Node {
    config: Arc<BridgeConfig>,
    store: Arc<PgStore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    pub fn new(config: BridgeConfig, store: PgStore, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            shutdown_rx,
        }
    }

    /// Build a timeout-bounded client for one network and make sure it
    /// answers before any daemon starts.
    async fn connect(&self, network: &NetworkConfig) -> anyhow::Result<Arc<dyn ChainAccess>> {
        let client = RpcChainClient::new(network.chain_id, network.rpc_urls.clone())
            .with_context(|| format!("failed to build RPC client for {}", network.name))?;
        let chain = TimeoutChain::new(
            client,
            self.config.timeouts.rpc,
            self.config.timeouts.confirmation,
        );
        let height = chain
            .current_block_height()
            .await
            .with_context(|| format!("RPC for {} (chain {}) is unreachable", network.name, network.chain_id))?;
        info!(chain_id = %network.chain_id, name = %network.name, height, "Connected to chain");
        Ok(Arc::new(chain))
    }

    async fn connect_chains(&self, only: Option<ChainId>) -> anyhow::Result<ChainRegistry> {
        let networks = self
            .config
            .networks
            .values()
            .filter(|n| only.is_none_or(|id| n.chain_id == id));
        let chains = try_join_all(networks.map(|n| self.connect(n))).await?;
        Ok(chains
            .into_iter()
            .fold(ChainRegistry::new(), |registry, chain| registry.with(chain)))
    }

    fn watcher(&self, network: &NetworkConfig, chains: &ChainRegistry) -> anyhow::Result<ChainWatcher> {
        Ok(ChainWatcher::new(
            network.clone(),
            self.config.watcher,
            chains.get(network.chain_id)?,
            self.store.clone(),
            self.shutdown_rx.clone(),
        ))
    }

    fn engine(&self, chains: &ChainRegistry) -> BondingEngine {
        BondingEngine::new(
            self.config.clone(),
            chains.clone(),
            self.store.clone(),
            self.store.clone(),
            self.shutdown_rx.clone(),
        )
    }

    fn sampler(&self, chains: &ChainRegistry) -> GasSampler {
        let sampler = GasSampler::new(
            chains.clone(),
            self.store.clone(),
            self.config.sampler,
            self.shutdown_rx.clone(),
        );
        match &self.config.snapshot {
            Some(settings) => {
                if settings.signing_key.is_none() {
                    info!("Snapshot signing key not set; publishing unsigned snapshots");
                }
                sampler.with_publisher(SnapshotPublisher::new(self.store.clone(), settings.clone()))
            }
            None => sampler,
        }
    }

    fn arbitrage(&self, chains: &ChainRegistry) -> ArbitrageEvaluator {
        ArbitrageEvaluator::new(
            self.config.arbitrage.clone(),
            chains.clone(),
            self.store.clone(),
            self.shutdown_rx.clone(),
        )
    }

    /// Spawn the daemons for `role` and wait until all of them have stopped.
    pub async fn run(self, role: Role) -> anyhow::Result<()> {
        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        match role {
            Role::Watch(chain_id) => {
                let network = self
                    .config
                    .network(chain_id)
                    .with_context(|| format!("chain {chain_id} is not configured"))?;
                let chains = self.connect_chains(Some(chain_id)).await?;
                let watcher = self.watcher(network, &chains)?;
                tasks.push((format!("watcher-{chain_id}"), tokio::spawn(watcher.run())));
            }
            Role::Bond => {
                let chains = self.connect_chains(None).await?;
                tasks.push(("engine".to_owned(), tokio::spawn(self.engine(&chains).run())));
            }
            Role::GasSampler => {
                let chains = self.connect_chains(None).await?;
                tasks.push(("gas-sampler".to_owned(), tokio::spawn(self.sampler(&chains).run())));
            }
            Role::Arbitrage => {
                anyhow::ensure!(
                    !self.config.arbitrage.pairs.is_empty(),
                    "no [[arbitrage.pairs]] configured"
                );
                let chains = self.connect_chains(None).await?;
                tasks.push(("arbitrage".to_owned(), tokio::spawn(self.arbitrage(&chains).run())));
            }
            Role::All => {
                let chains = self.connect_chains(None).await?;
                let (notice_tx, notice_rx) = work_notice_channel();
                for network in self.config.networks.values() {
                    let watcher = self.watcher(network, &chains)?.with_notices(notice_tx.clone());
                    tasks.push((
                        format!("watcher-{}", network.chain_id),
                        tokio::spawn(watcher.run()),
                    ));
                }
                let engine = self.engine(&chains).with_notices(notice_rx);
                tasks.push(("engine".to_owned(), tokio::spawn(engine.run())));
                tasks.push(("gas-sampler".to_owned(), tokio::spawn(self.sampler(&chains).run())));
                if self.config.arbitrage.pairs.is_empty() {
                    info!("No arbitrage pairs configured; evaluator not started");
                } else {
                    tasks.push(("arbitrage".to_owned(), tokio::spawn(self.arbitrage(&chains).run())));
                }
            }
        }

        info!(daemons = tasks.len(), "All daemons started");
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(daemon = %name, error = %e, "Daemon task failed");
            }
        }
        Ok(())
    }
}
