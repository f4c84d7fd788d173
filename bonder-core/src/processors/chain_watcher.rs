//! ChainWatcher processor.
//!
//! One watcher per chain. Each tick it:
//! - Reads the head and scans `[checkpoint + 1, head - wait_confirmations]`,
//!   at most `max_block_range` blocks at a time
//! - Verifies every header links to its predecessor, starting from the
//!   checkpoint hash; a broken link at the checkpoint is a reorg
//! - Decodes bridge logs and writes them together with the new checkpoint
//! - Nudges the bonding engine when something was recorded

use crate::chain::types::{BlockHeader, H256, LogFilter, RawLog};
use crate::chain::{ChainAccess, ChainError};
use crate::config::{NetworkConfig, WatcherSettings};
use crate::entities::ChainCheckpoint;
use crate::events::{ObservedEvent, WorkNotice, WorkNoticeSender, decode_log};
use crate::store::{BlockRangeBatch, BridgeStore, StoreError};
use crate::utils::backoff::{calculate_retry_delay, with_jitter};
use bonder_sdk::objects::ChainId;
use futures_util::{StreamExt, TryStreamExt, stream};
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("header {got} returned for block {requested}")]
    HeaderMismatch { requested: u64, got: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing confirmed beyond the checkpoint.
    Idle { head: u64 },
    Advanced { from: u64, to: u64, events: usize },
    /// The checkpoint block was abandoned; the checkpoint moved back.
    ReorgRolledBack { from: u64, to: u64 },
    /// The chain moved while the range was being read; nothing written.
    Retry { at_block: u64 },
}

pub struct ChainWatcher {
    network: NetworkConfig,
    settings: WatcherSettings,
    chain: Arc<dyn ChainAccess>,
    store: Arc<dyn BridgeStore>,
    filter: LogFilter,
    notices: Option<WorkNoticeSender>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChainWatcher {
    pub fn new(
        network: NetworkConfig,
        settings: WatcherSettings,
        chain: Arc<dyn ChainAccess>,
        store: Arc<dyn BridgeStore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let filter = network.log_filter();
        Self {
            network,
            settings,
            chain,
            store,
            filter,
            notices: None,
            shutdown_rx,
        }
    }

    /// Send a [`WorkNotice`] after every range that recorded events.
    pub fn with_notices(mut self, notices: WorkNoticeSender) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.network.chain_id
    }

    /// Load the checkpoint, creating it just below `start_block` on first run.
    pub async fn start(&self) -> Result<ChainCheckpoint, WatcherError> {
        if let Some(checkpoint) = self.store.checkpoint(self.chain_id()).await? {
            return Ok(checkpoint);
        }
        let number = self.network.start_block.saturating_sub(1);
        let header = self.chain.block_header(number).await?;
        let checkpoint = self
            .store
            .init_checkpoint(ChainCheckpoint {
                chain_id: self.chain_id(),
                block_number: number,
                block_hash: header.hash,
            })
            .await?;
        info!(
            chain_id = %self.chain_id(),
            block = checkpoint.block_number,
            "Checkpoint initialised"
        );
        Ok(checkpoint)
    }

    async fn headers(&self, from: u64, to: u64) -> Result<Vec<BlockHeader>, WatcherError> {
        let chain = &self.chain;
        let headers: Vec<BlockHeader> = stream::iter(from..=to)
            .map(|n| async move { chain.block_header(n).await })
            .buffered(self.settings.header_concurrency.max(1))
            .try_collect()
            .await?;
        for (n, header) in (from..=to).zip(&headers) {
            if header.number != n {
                return Err(WatcherError::HeaderMismatch {
                    requested: n,
                    got: header.number,
                });
            }
        }
        Ok(headers)
    }

    async fn roll_back(&self, checkpoint: ChainCheckpoint) -> Result<TickOutcome, WatcherError> {
        let floor = self.network.start_block.saturating_sub(1);
        let target = checkpoint
            .block_number
            .saturating_sub(self.network.reorg_rollback_depth.max(1))
            .max(floor);
        let header = self.chain.block_header(target).await?;
        self.store
            .rollback_checkpoint(
                checkpoint,
                ChainCheckpoint {
                    chain_id: self.chain_id(),
                    block_number: target,
                    block_hash: header.hash,
                },
            )
            .await?;
        error!(
            chain_id = %self.chain_id(),
            from = checkpoint.block_number,
            to = target,
            abandoned_hash = %checkpoint.block_hash,
            "Reorg below confirmation depth; checkpoint rolled back"
        );
        Ok(TickOutcome::ReorgRolledBack {
            from: checkpoint.block_number,
            to: target,
        })
    }

    fn decode(&self, log: &RawLog) -> Option<ObservedEvent> {
        let token = self.network.token_at(&log.address)?;
        match decode_log(self.chain_id(), token, log) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    chain_id = %self.chain_id(),
                    block = log.block_number,
                    log_index = log.log_index,
                    tx_hash = %log.tx_hash,
                    error = %e,
                    "Skipping undecodable log"
                );
                None
            }
        }
    }

    /// Run one scan step.
    pub async fn tick(&self) -> Result<TickOutcome, WatcherError> {
        let checkpoint = match self.store.checkpoint(self.chain_id()).await? {
            Some(checkpoint) => checkpoint,
            None => self.start().await?,
        };
        let head = self.chain.current_block_height().await?;
        let confirmed = head.saturating_sub(self.network.wait_confirmations);
        if confirmed <= checkpoint.block_number {
            return Ok(TickOutcome::Idle { head });
        }
        let from = checkpoint.block_number + 1;
        let to = confirmed.min(from + self.network.max_block_range.max(1) - 1);

        let headers = self.headers(from, to).await?;
        let mut parent: H256 = checkpoint.block_hash;
        for header in &headers {
            if header.parent_hash != parent {
                if header.number == from {
                    return self.roll_back(checkpoint).await;
                }
                debug!(chain_id = %self.chain_id(), block = header.number, "Headers changed mid-read");
                return Ok(TickOutcome::Retry {
                    at_block: header.number,
                });
            }
            parent = header.hash;
        }

        let logs = self.chain.logs(from..=to, &self.filter).await?;
        for log in &logs {
            let canonical = log
                .block_number
                .checked_sub(from)
                .and_then(|i| headers.get(i as usize))
                .map(|h| h.hash);
            if canonical != Some(log.block_hash) {
                debug!(
                    chain_id = %self.chain_id(),
                    block = log.block_number,
                    log_hash = %log.block_hash,
                    "Log from a branch other than the verified headers"
                );
                return Ok(TickOutcome::Retry {
                    at_block: log.block_number,
                });
            }
        }

        let events: Vec<ObservedEvent> = logs
            .iter()
            .filter(|log| self.filter.matches(log))
            .sorted_by_key(|log| (log.block_number, log.log_index))
            .filter_map(|log| self.decode(log))
            .collect();
        let count = events.len();

        let outcome = self
            .store
            .apply_block_range(BlockRangeBatch {
                chain_id: self.chain_id(),
                from_block: from,
                checkpoint: ChainCheckpoint {
                    chain_id: self.chain_id(),
                    block_number: to,
                    block_hash: parent,
                },
                events,
            })
            .await?;

        info!(
            chain_id = %self.chain_id(),
            from,
            to,
            events = count,
            inserted = outcome.transfers_inserted,
            committed = outcome.transfers_committed,
            bonds = outcome.bonds_observed,
            settlements = outcome.settlements_observed,
            "Range processed"
        );

        if count > 0 {
            if let Some(notices) = &self.notices {
                // A full channel only drops the nudge; the engine still polls.
                let _ = notices.try_send(WorkNotice::EventsRecorded {
                    chain_id: self.chain_id(),
                    count,
                });
            }
        }

        Ok(TickOutcome::Advanced {
            from,
            to,
            events: count,
        })
    }

    /// Run the ChainWatcher until shutdown.
    pub async fn run(mut self) {
        let chain_id = self.chain_id();
        info!(chain_id = %chain_id, "ChainWatcher started");

        let mut failures: u32 = 0;
        loop {
            let delay = match self.tick().await {
                Ok(TickOutcome::Advanced { .. } | TickOutcome::ReorgRolledBack { .. }) => {
                    failures = 0;
                    Duration::ZERO
                }
                Ok(TickOutcome::Idle { .. } | TickOutcome::Retry { .. }) => {
                    failures = 0;
                    self.settings.poll_interval
                }
                Err(e) => {
                    let delay = with_jitter(calculate_retry_delay(
                        failures,
                        self.settings.poll_interval,
                        self.settings.max_backoff,
                    ));
                    failures = failures.saturating_add(1);
                    warn!(
                        chain_id = %chain_id,
                        error = %e,
                        failures,
                        retry_in = ?delay,
                        "Watcher tick failed"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(chain_id = %chain_id, "ChainWatcher received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(chain_id = %chain_id, "ChainWatcher shutdown complete");
    }
}
