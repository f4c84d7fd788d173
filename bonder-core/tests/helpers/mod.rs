//! Shared fixtures for the integration tests.
//!
//! - `MockChain`: a scripted chain with blocks, logs, reorgs and
//!   controllable transaction outcomes
//! - `Harness`: a source chain, a destination chain, a `MemoryStore` and a
//!   config wired together

#![allow(dead_code)]

use async_trait::async_trait;
use bonder_core::chain::types::{
    Address, BlockHeader, BlockRange, H256, LogFilter, RawLog, TxHash, TxReceipt, TxRequest,
};
use bonder_core::chain::{ChainAccess, ChainError, ChainRegistry};
use bonder_core::config::{
    ArbitrageSettings, BridgeConfig, BridgeContract, ChainTimeouts, EngineSettings, NetworkConfig,
    SamplerSettings, TokenPolicy, TokenRoute, WatcherSettings,
};
use bonder_core::entities::{GasPriceSample, LedgerKey, LiquidityLedger, Transfer};
use bonder_core::events::types::encode;
use bonder_core::events::{TransferSent, TransfersCommitted, WithdrawalBondSettled, WithdrawalBonded};
use bonder_core::processors::{BondingEngine, ChainWatcher};
use bonder_core::store::{BridgeStore, GasPriceStore, MemoryStore};
use bonder_core::{ChainId, TokenSymbol, TransferState};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const SOURCE: ChainId = ChainId(1);
pub const DEST: ChainId = ChainId(10);

pub const SOURCE_BRIDGE: Address = Address([0xa1; 20]);
pub const DEST_BRIDGE: Address = Address([0xa2; 20]);
pub const BONDER: Address = Address([0xb0; 20]);
pub const OTHER_BONDER: Address = Address([0xb1; 20]);
pub const RECIPIENT: Address = Address([0x11; 20]);

/// 1 gwei; prices a 100k-gas bond at 0.2 token units with a native price of 2000.
pub const GAS_PRICE: u128 = 1_000_000_000;

pub fn usdc() -> TokenSymbol {
    TokenSymbol::new("USDC")
}

pub fn transfer_id(n: u8) -> H256 {
    H256([n; 32])
}

pub fn ledger_key() -> LedgerKey {
    LedgerKey {
        chain_id: DEST,
        token: usdc(),
        bonder: BONDER,
    }
}

// ============================================================================
// MOCK CHAIN
// ============================================================================

fn block_hash(chain_id: ChainId, number: u64, fork: u8) -> H256 {
    let mut hash = [0u8; 32];
    hash[0] = 0xbb;
    hash[1] = fork;
    hash[8..16].copy_from_slice(&chain_id.get().to_be_bytes());
    hash[24..].copy_from_slice(&number.to_be_bytes());
    H256(hash)
}

struct MockState {
    blocks: Vec<BlockHeader>,
    logs: Vec<RawLog>,
    gas_price: Option<u128>,
    fail_submits: usize,
    revert_submits: usize,
    reverting: HashSet<TxHash>,
    submitted: Vec<TxRequest>,
    confirmation_delay: Duration,
    next_tx: u64,
}

/// A chain whose blocks, logs and transaction outcomes are set by the test.
pub struct MockChain {
    chain_id: ChainId,
    state: Mutex<MockState>,
    submit_calls: AtomicUsize,
}

impl MockChain {
    /// Blocks `0..=height` on fork 0.
    pub fn new(chain_id: ChainId, height: u64) -> Arc<Self> {
        let chain = Self {
            chain_id,
            state: Mutex::new(MockState {
                blocks: Vec::new(),
                logs: Vec::new(),
                gas_price: Some(GAS_PRICE),
                fail_submits: 0,
                revert_submits: 0,
                reverting: HashSet::new(),
                submitted: Vec::new(),
                confirmation_delay: Duration::ZERO,
                next_tx: 1,
            }),
            submit_calls: AtomicUsize::new(0),
        };
        chain.extend_to(height, 0);
        Arc::new(chain)
    }

    fn extend_to(&self, height: u64, fork: u8) {
        let mut state = self.state.lock().unwrap();
        while state.blocks.len() as u64 <= height {
            let number = state.blocks.len() as u64;
            let parent_hash = state.blocks.last().map(|b| b.hash).unwrap_or(H256::ZERO);
            state.blocks.push(BlockHeader {
                number,
                hash: block_hash(self.chain_id, number, fork),
                parent_hash,
            });
        }
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    /// Append `count` blocks on the current fork.
    pub fn mine(&self, count: u64) {
        let fork = self
            .state
            .lock()
            .unwrap()
            .blocks
            .last()
            .map(|b| b.hash.0[1])
            .unwrap_or(0);
        self.extend_to(self.height() + count, fork);
    }

    pub fn hash_of(&self, number: u64) -> H256 {
        self.state.lock().unwrap().blocks[number as usize].hash
    }

    /// Replace every block from `from` on with blocks of `fork`, keeping the
    /// height. Logs in replaced blocks are dropped.
    pub fn reorg(&self, from: u64, fork: u8) {
        let height = self.height();
        {
            let mut state = self.state.lock().unwrap();
            state.blocks.truncate(from as usize);
            state.logs.retain(|l| l.block_number < from);
        }
        self.extend_to(height, fork);
    }

    pub fn push_log(&self, address: Address, encoded: (Vec<H256>, Vec<u8>), block: u64) {
        let mut state = self.state.lock().unwrap();
        let hash = state.blocks[block as usize].hash;
        let index = state.logs.iter().filter(|l| l.block_number == block).count() as u64;
        state
            .logs
            .push(encode::raw_log(address, encoded, block, hash, index));
    }

    /// A log stamped with a block hash the chain never had, as served by a
    /// node still on an abandoned branch.
    pub fn push_stale_log(&self, address: Address, encoded: (Vec<H256>, Vec<u8>), block: u64) {
        let mut state = self.state.lock().unwrap();
        let hash = block_hash(self.chain_id, block, 0xff);
        state.logs.push(encode::raw_log(address, encoded, block, hash, 0));
    }

    /// Re-stamp every log with the current hash of its block.
    pub fn restamp_logs(&self) {
        let mut state = self.state.lock().unwrap();
        let hashes: Vec<H256> = state.blocks.iter().map(|b| b.hash).collect();
        for log in &mut state.logs {
            log.block_hash = hashes[log.block_number as usize];
        }
    }

    pub fn set_gas_price(&self, price: Option<u128>) {
        self.state.lock().unwrap().gas_price = price;
    }

    /// The next `n` submissions fail before reaching the chain.
    pub fn fail_next_submits(&self, n: usize) {
        self.state.lock().unwrap().fail_submits = n;
    }

    /// The next `n` submissions are mined but revert.
    pub fn revert_next_submits(&self, n: usize) {
        self.state.lock().unwrap().revert_submits = n;
    }

    pub fn set_confirmation_delay(&self, delay: Duration) {
        self.state.lock().unwrap().confirmation_delay = delay;
    }

    pub fn submitted(&self) -> Vec<TxRequest> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Every `submit_transaction` call, failed ones included.
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainAccess for MockChain {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn current_block_height(&self) -> Result<u64, ChainError> {
        Ok(self.height())
    }

    async fn block_header(&self, number: u64) -> Result<BlockHeader, ChainError> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .get(number as usize)
            .copied()
            .ok_or_else(|| ChainError::NotFound(format!("block {number}")))
    }

    async fn logs(&self, range: BlockRange, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|l| range.contains(&l.block_number) && filter.matches(l))
            .cloned()
            .collect())
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.state.lock().unwrap().gas_price.ok_or(ChainError::Rpc {
            code: -32000,
            message: "gas price unavailable".to_owned(),
        })
    }

    async fn submit_transaction(&self, tx: TxRequest) -> Result<TxHash, ChainError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(ChainError::Rpc {
                code: -32000,
                message: "nonce too low".to_owned(),
            });
        }
        let mut hash = [0u8; 32];
        hash[0] = 0x7e;
        hash[24..].copy_from_slice(&state.next_tx.to_be_bytes());
        state.next_tx += 1;
        let tx_hash = H256(hash);
        if state.revert_submits > 0 {
            state.revert_submits -= 1;
            state.reverting.insert(tx_hash);
        }
        state.submitted.push(tx);
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        let delay = self.state.lock().unwrap().confirmation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok(TxReceipt {
            tx_hash,
            block_number: state.blocks.len() as u64,
            success: !state.reverting.contains(&tx_hash),
            gas_used: 80_000,
        })
    }
}

// ============================================================================
// EVENTS
// ============================================================================

pub fn sent(n: u8, amount: i64, bonder_fee: i64) -> TransferSent {
    TransferSent {
        transfer_id: transfer_id(n),
        destination_chain: DEST,
        recipient: RECIPIENT,
        amount: Decimal::from(amount),
        transfer_nonce: H256([0x22; 32]),
        bonder_fee: Decimal::from(bonder_fee),
        index: n.into(),
        amount_out_min: Decimal::ZERO,
        deadline: 0,
    }
}

pub fn committed(root: H256, total: i64) -> TransfersCommitted {
    TransfersCommitted {
        destination_chain: DEST,
        root_hash: root,
        total_amount: Decimal::from(total),
        committed_at: 1_700_000_000,
    }
}

pub fn bonded(n: u8, bonder: Address, amount: i64) -> WithdrawalBonded {
    WithdrawalBonded {
        bonder,
        transfer_id: transfer_id(n),
        amount: Decimal::from(amount),
    }
}

pub fn bond_settled(n: u8, bonder: Address, root: H256) -> WithdrawalBondSettled {
    WithdrawalBondSettled {
        bonder,
        transfer_id: transfer_id(n),
        root_hash: root,
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

fn network(chain_id: ChainId, name: &str, bridge: Address) -> NetworkConfig {
    NetworkConfig {
        chain_id,
        name: name.to_owned(),
        rpc_urls: vec![],
        explorer_urls: vec![],
        wait_confirmations: 2,
        start_block: 1,
        max_block_range: 50,
        reorg_rollback_depth: 5,
        fee_multiplier: Decimal::ONE,
        bond_gas_limit: 100_000,
        settle_gas_limit: 100_000,
        bridges: vec![BridgeContract {
            token: usdc(),
            address: bridge,
        }],
    }
}

pub fn bridge_config() -> BridgeConfig {
    BridgeConfig {
        networks: BTreeMap::from([
            (SOURCE, network(SOURCE, "ethereum", SOURCE_BRIDGE)),
            (DEST, network(DEST, "optimism", DEST_BRIDGE)),
        ]),
        tokens: BTreeMap::from([(
            usdc(),
            TokenPolicy {
                symbol: usdc(),
                bonder: BONDER,
                max_trade_amount: Decimal::from(1000),
                min_threshold: Decimal::ONE,
                routes: BTreeMap::from([(
                    DEST,
                    TokenRoute {
                        initial_stake: Decimal::from(500),
                        native_price: Decimal::from(2000),
                    },
                )]),
            },
        )]),
        timeouts: ChainTimeouts {
            rpc: Duration::from_secs(1),
            confirmation: Duration::from_secs(5),
        },
        watcher: WatcherSettings {
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            header_concurrency: 4,
        },
        engine: EngineSettings {
            poll_interval: Duration::from_millis(10),
            batch_size: 50,
            max_concurrent_bonds: 4,
            lock_lease: Duration::from_secs(60),
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(600),
        },
        sampler: SamplerSettings::default(),
        snapshot: None,
        arbitrage: ArbitrageSettings::default(),
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub config: Arc<BridgeConfig>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<MockChain>,
    pub dest: Arc<MockChain>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut BridgeConfig)) -> Self {
        let mut config = bridge_config();
        adjust(&mut config);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            store: Arc::new(MemoryStore::new()),
            source: MockChain::new(SOURCE, 1),
            dest: MockChain::new(DEST, 1),
            shutdown_tx,
        }
    }

    pub fn chains(&self) -> ChainRegistry {
        ChainRegistry::new()
            .with(self.source.clone())
            .with(self.dest.clone())
    }

    pub fn watcher(&self, chain_id: ChainId) -> ChainWatcher {
        let chain: Arc<dyn ChainAccess> = if chain_id == SOURCE {
            self.source.clone()
        } else {
            self.dest.clone()
        };
        ChainWatcher::new(
            self.config.networks[&chain_id].clone(),
            self.config.watcher,
            chain,
            self.store.clone(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// An engine with its ledgers created.
    pub async fn engine(&self) -> BondingEngine {
        let engine = BondingEngine::new(
            self.config.clone(),
            self.chains(),
            self.store.clone(),
            self.store.clone(),
            self.shutdown_tx.subscribe(),
        );
        engine.ensure_ledgers().await.unwrap();
        engine
    }

    pub async fn sample_gas(&self, chain_id: ChainId, gas_price: u128) {
        self.store
            .append_gas_sample(GasPriceSample {
                chain_id,
                sampled_at: OffsetDateTime::now_utc(),
                gas_price,
            })
            .await
            .unwrap();
    }

    /// Emit `TransferSent` on the source chain and confirm it.
    pub fn send(&self, event: &TransferSent) -> u64 {
        self.source.mine(1);
        let block = self.source.height();
        self.source
            .push_log(SOURCE_BRIDGE, encode::transfer_sent(event).unwrap(), block);
        self.source.mine(2);
        block
    }

    pub fn commit(&self, root: H256, total: i64) -> u64 {
        self.source.mine(1);
        let block = self.source.height();
        self.source.push_log(
            SOURCE_BRIDGE,
            encode::transfers_committed(&committed(root, total)).unwrap(),
            block,
        );
        self.source.mine(2);
        block
    }

    /// Tick `chain_id`'s watcher until it has nothing left to scan.
    pub async fn sync(&self, chain_id: ChainId) {
        let watcher = self.watcher(chain_id);
        for _ in 0..20 {
            match watcher.tick().await.unwrap() {
                bonder_core::processors::TickOutcome::Idle { .. } => return,
                _ => continue,
            }
        }
        panic!("watcher for {chain_id} did not settle");
    }

    pub async fn transfer(&self, n: u8) -> Transfer {
        self.store.transfer(&transfer_id(n)).await.unwrap().unwrap()
    }

    pub async fn state(&self, n: u8) -> TransferState {
        self.transfer(n).await.state
    }

    pub async fn ledger(&self) -> LiquidityLedger {
        self.store.ledger(&ledger_key()).await.unwrap().unwrap()
    }
}
