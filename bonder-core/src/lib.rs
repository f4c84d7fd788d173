#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod config;
pub mod entities;
pub mod events;
pub mod framework;
pub mod policy;
pub mod processors;
pub mod store;
pub mod utils;

pub use bonder_sdk::objects::{ChainId, SkipReason, TokenSymbol, TransferState};
