//! Chain access.
//!
//! Every daemon talks to a chain through [`ChainAccess`]. Instances are built
//! once from configuration and handed to the processors that need them; the
//! collaborator behind the trait owns key material and signs what the core
//! asks it to submit.

pub mod abi;
pub mod rpc;
pub mod types;

use async_trait::async_trait;
use bonder_sdk::objects::ChainId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use types::{BlockHeader, BlockRange, LogFilter, RawLog, TxHash, TxReceipt, TxRequest};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no rpc endpoint configured")]
    NoEndpoint,

    #[error("chain {0} is not configured")]
    UnknownChain(ChainId),
}

impl ChainError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChainError::Timeout { .. })
    }
}

impl From<types::HexError> for ChainError {
    fn from(e: types::HexError) -> Self {
        ChainError::Decode(e.to_string())
    }
}

#[async_trait]
pub trait ChainAccess: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn current_block_height(&self) -> Result<u64, ChainError>;

    async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError>;

    async fn logs(&self, range: BlockRange, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError>;

    /// Gas price in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;

    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, ChainError>;

    /// Resolves once the transaction is mined, successful or reverted.
    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError>;
}

#[async_trait]
impl<T: ChainAccess + ?Sized> ChainAccess for Arc<T> {
    fn chain_id(&self) -> ChainId {
        (**self).chain_id()
    }

    async fn current_block_height(&self) -> Result<u64, ChainError> {
        (**self).current_block_height().await
    }

    async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError> {
        (**self).block_header(number).await
    }

    async fn logs(&self, range: BlockRange, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        (**self).logs(range, filter).await
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        (**self).gas_price().await
    }

    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, ChainError> {
        (**self).submit_transaction(tx).await
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        (**self).wait_for_confirmation(tx_hash).await
    }
}

/// Bounds every call of the wrapped chain with a timeout. An elapsed
/// timeout is reported as [`ChainError::Timeout`], never as success.
pub struct TimeoutChain<C> {
    inner: C,
    rpc_timeout: Duration,
    confirmation_timeout: Duration,
}

impl<C: ChainAccess> TimeoutChain<C> {
    pub fn new(inner: C, rpc_timeout: Duration, confirmation_timeout: Duration) -> Self {
        Self {
            inner,
            rpc_timeout,
            confirmation_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        after: Duration,
        fut: impl std::future::Future<Output = Result<T, ChainError>> + Send,
    ) -> Result<T, ChainError> {
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout { op, after }),
        }
    }
}

#[async_trait]
impl<C: ChainAccess> ChainAccess for TimeoutChain<C> {
    fn chain_id(&self) -> ChainId {
        self.inner.chain_id()
    }

    async fn current_block_height(&self) -> Result<u64, ChainError> {
        self.bounded("current_block_height", self.rpc_timeout, self.inner.current_block_height())
            .await
    }

    async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError> {
        self.bounded("block_header", self.rpc_timeout, self.inner.block_header(number))
            .await
    }

    async fn logs(&self, range: BlockRange, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        self.bounded("logs", self.rpc_timeout, self.inner.logs(range, filter))
            .await
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.bounded("gas_price", self.rpc_timeout, self.inner.gas_price())
            .await
    }

    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, ChainError> {
        self.bounded("submit_transaction", self.rpc_timeout, self.inner.submit_transaction(tx))
            .await
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        self.bounded(
            "wait_for_confirmation",
            self.confirmation_timeout,
            self.inner.wait_for_confirmation(tx_hash),
        )
        .await
    }
}

/// The chain clients of one process, keyed by chain id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<ChainId, Arc<dyn ChainAccess>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain: Arc<dyn ChainAccess>) {
        self.chains.insert(chain.chain_id(), chain);
    }

    pub fn with(mut self, chain: Arc<dyn ChainAccess>) -> Self {
        self.insert(chain);
        self
    }

    pub fn get(&self, chain_id: ChainId) -> Result<Arc<dyn ChainAccess>, ChainError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or(ChainError::UnknownChain(chain_id))
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.chains.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
