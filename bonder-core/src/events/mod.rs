//! Protocol events and in-process notices.
//!
//! # Event Flow
//!
//! 1. A chain watcher decodes `BridgeEvent`s from confirmed logs and writes
//!    them to the store together with its checkpoint.
//! 2. After a write that recorded events the watcher sends a `WorkNotice`
//!    to the bonding engine so it does not wait for its next poll.
//!
//! Notices are ephemeral and carry identifiers only; the engine always
//! re-reads the store.

pub mod channels;
pub mod types;

pub use channels::{DEFAULT_CHANNEL_BUFFER, WorkNoticeReceiver, WorkNoticeSender, work_notice_channel};
pub use types::{
    BridgeEvent, EventMeta, ObservedEvent, TransferSent, TransfersCommitted, WithdrawalBondSettled,
    WithdrawalBonded, WorkNotice, decode_log, protocol_topics,
};
