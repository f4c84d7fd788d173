use super::types::WorkNotice;
use tokio::sync::mpsc;

/// Enough to absorb a burst of watcher writes; a full channel only drops
/// nudges, never data.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

pub type WorkNoticeSender = mpsc::Sender<WorkNotice>;
pub type WorkNoticeReceiver = mpsc::Receiver<WorkNotice>;

/// Watchers clone the sender; the bonding engine owns the receiver.
pub fn work_notice_channel() -> (WorkNoticeSender, WorkNoticeReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
