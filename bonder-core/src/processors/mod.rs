//! Long-running daemons.
//!
//! Each processor owns a `run(self)` loop that stops on the shared shutdown
//! signal, plus a single-step entry point for tests:
//!
//! - `ChainWatcher`: scans one chain, writes events and its checkpoint,
//!   emits `WorkNotice`
//! - `BondingEngine`: receives `WorkNotice`, bonds `Sent` transfers and
//!   settles `Committed` ones
//! - `GasSampler`: samples gas prices, optionally publishes the liquidity
//!   snapshot through `SnapshotPublisher`
//! - `ArbitrageEvaluator`: compares venue prices and trades the spread

pub mod arbitrage;
pub mod bonding_engine;
pub mod chain_watcher;
pub mod gas_sampler;
pub mod settlement;
pub mod snapshot_publisher;

pub use arbitrage::{
    ArbDecision, ArbError, ArbOpportunity, ArbitrageEvaluator, HttpPriceVenue, PriceVenue,
};
pub use bonding_engine::{BondOutcome, BondingEngine, CycleReport, EngineError};
pub use chain_watcher::{ChainWatcher, TickOutcome, WatcherError};
pub use gas_sampler::{GasSampler, SampleReport, SamplerError};
pub use settlement::SettleOutcome;
pub use snapshot_publisher::{PublishError, SnapshotPublisher};
