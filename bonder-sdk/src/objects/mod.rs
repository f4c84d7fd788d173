pub mod chains;
pub mod snapshot;
pub mod transfer;

pub use chains::{ChainId, TokenSymbol};
pub use snapshot::{LiquidityEntry, LiquiditySnapshot};
pub use transfer::{SkipReason, TransferState};
