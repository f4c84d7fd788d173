//! GasSampler processor.
//!
//! The GasSampler is responsible for:
//! - Reading the current gas price of every configured chain on a fixed
//!   interval and appending it to the sample log
//! - Pruning samples older than the retention window
//! - Publishing the liquidity snapshot, when one is configured
//!
//! A chain that fails to answer is logged and skipped; the other chains
//! are still sampled in the same pass.

use super::snapshot_publisher::SnapshotPublisher;
use crate::chain::{ChainError, ChainRegistry};
use crate::config::SamplerSettings;
use crate::entities::GasPriceSample;
use crate::store::{GasPriceStore, StoreError};
use bonder_sdk::objects::ChainId;
use futures_util::{StreamExt, stream};
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleReport {
    pub sampled: Vec<ChainId>,
    pub failed: Vec<ChainId>,
}

pub struct GasSampler {
    chains: ChainRegistry,
    gas: Arc<dyn GasPriceStore>,
    settings: SamplerSettings,
    publisher: Option<SnapshotPublisher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GasSampler {
    pub fn new(
        chains: ChainRegistry,
        gas: Arc<dyn GasPriceStore>,
        settings: SamplerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chains,
            gas,
            settings,
            publisher: None,
            shutdown_rx,
        }
    }

    pub fn with_publisher(mut self, publisher: SnapshotPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Read and store one sample for `chain_id`.
    pub async fn sample(&self, chain_id: ChainId) -> Result<GasPriceSample, SamplerError> {
        let chain = self.chains.get(chain_id)?;
        let gas_price = chain.gas_price().await?;
        let sample = GasPriceSample {
            chain_id,
            sampled_at: OffsetDateTime::now_utc(),
            gas_price,
        };
        self.gas.append_gas_sample(sample).await?;
        debug!(chain_id = %chain_id, gas_price, "Gas price sampled");
        Ok(sample)
    }

    /// Sample every chain concurrently.
    pub async fn sample_all(&self) -> SampleReport {
        let chain_ids: Vec<ChainId> = self.chains.chain_ids().sorted().collect();
        let results: Vec<(ChainId, Result<GasPriceSample, SamplerError>)> =
            stream::iter(chain_ids)
                .map(|chain_id| async move { (chain_id, self.sample(chain_id).await) })
                .buffer_unordered(self.chains.len().max(1))
                .collect()
                .await;

        let mut report = SampleReport::default();
        for (chain_id, result) in results {
            match result {
                Ok(_) => report.sampled.push(chain_id),
                Err(e) => {
                    warn!(chain_id = %chain_id, error = %e, "Gas price sampling failed");
                    report.failed.push(chain_id);
                }
            }
        }
        report.sampled.sort();
        report.failed.sort();
        report
    }

    /// Drop samples older than the retention window.
    pub async fn prune(&self) -> Result<u64, SamplerError> {
        let Some(retention) = self.settings.retention else {
            return Ok(0);
        };
        let cutoff = OffsetDateTime::now_utc() - retention;
        let pruned = self.gas.prune_gas_samples(cutoff).await?;
        if pruned > 0 {
            info!(pruned, cutoff = %cutoff, "Pruned old gas samples");
        }
        Ok(pruned)
    }

    async fn publish(&self) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher.publish().await {
            error!(error = %e, "Failed to publish liquidity snapshot");
        }
    }

    /// Run the GasSampler until shutdown.
    pub async fn run(mut self) {
        info!(chains = self.chains.len(), "GasSampler started");

        let mut sample_interval = tokio::time::interval(self.settings.interval);
        sample_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Without a publisher the snapshot branch never fires.
        let snapshot_every = self
            .publisher
            .as_ref()
            .map(|p| p.interval())
            .unwrap_or(Duration::from_secs(3600));
        let mut snapshot_interval = tokio::time::interval(snapshot_every);
        snapshot_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let publishing = self.publisher.is_some();

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("GasSampler received shutdown signal");
                        break;
                    }
                }

                _ = sample_interval.tick() => {
                    let report = self.sample_all().await;
                    if !report.failed.is_empty() {
                        warn!(
                            sampled = report.sampled.len(),
                            failed = ?report.failed,
                            "Gas sampling pass incomplete"
                        );
                    }
                    if let Err(e) = self.prune().await {
                        error!(error = %e, "Failed to prune gas samples");
                    }
                }

                _ = snapshot_interval.tick(), if publishing => {
                    self.publish().await;
                }
            }
        }

        info!("GasSampler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainAccess;
    use crate::chain::types::{BlockHeader, BlockRange, LogFilter, RawLog, TxHash, TxReceipt, TxRequest};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FixedGas {
        chain_id: ChainId,
        price: Option<u128>,
    }

    #[async_trait]
    impl ChainAccess for FixedGas {
        fn chain_id(&self) -> ChainId {
            self.chain_id
        }
        async fn current_block_height(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError> {
            Err(ChainError::NotFound(format!("block {number}")))
        }
        async fn logs(&self, _r: BlockRange, _f: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
            Ok(vec![])
        }
        async fn gas_price(&self) -> Result<u128, ChainError> {
            self.price.ok_or(ChainError::Rpc {
                code: -32000,
                message: "unavailable".to_owned(),
            })
        }
        async fn submit_transaction(&self, _tx: TxRequest) -> Result<TxHash, ChainError> {
            Err(ChainError::NoEndpoint)
        }
        async fn wait_for_confirmation(&self, _tx: TxHash) -> Result<TxReceipt, ChainError> {
            Err(ChainError::NoEndpoint)
        }
    }

    fn sampler(store: Arc<MemoryStore>, retention: Option<Duration>) -> GasSampler {
        let chains = ChainRegistry::new()
            .with(Arc::new(FixedGas {
                chain_id: ChainId(1),
                price: Some(30_000_000_000),
            }))
            .with(Arc::new(FixedGas {
                chain_id: ChainId(10),
                price: None,
            }));
        let (_tx, rx) = watch::channel(false);
        GasSampler::new(
            chains,
            store,
            SamplerSettings {
                interval: Duration::from_secs(30),
                retention,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn failing_chain_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let report = sampler(store.clone(), None).sample_all().await;
        assert_eq!(report.sampled, vec![ChainId(1)]);
        assert_eq!(report.failed, vec![ChainId(10)]);

        let latest = store.latest_gas_sample(ChainId(1)).await.unwrap().unwrap();
        assert_eq!(latest.gas_price, 30_000_000_000);
        assert!(store.latest_gas_sample(ChainId(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_respects_retention() {
        let store = Arc::new(MemoryStore::new());
        store
            .append_gas_sample(GasPriceSample {
                chain_id: ChainId(1),
                sampled_at: OffsetDateTime::now_utc() - time::Duration::days(30),
                gas_price: 1,
            })
            .await
            .unwrap();

        assert_eq!(sampler(store.clone(), None).prune().await.unwrap(), 0);
        let pruned = sampler(store.clone(), Some(Duration::from_secs(24 * 3600)))
            .prune()
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.latest_gas_sample(ChainId(1)).await.unwrap().is_none());
    }
}
