//! Chain watcher: checkpointing, restart and reorg handling.

mod helpers;

use bonder_core::entities::ChainCheckpoint;
use bonder_core::events::types::encode;
use bonder_core::events::{WorkNotice, work_notice_channel};
use bonder_core::processors::TickOutcome;
use bonder_core::store::{BlockRangeBatch, BridgeStore, StoreError};
use bonder_core::TransferState;
use helpers::*;

async fn sent_count(h: &Harness) -> usize {
    h.store
        .transfers_in_state(TransferState::Sent, 100)
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn first_tick_initialises_checkpoint_below_start_block() {
    let h = Harness::new();
    let watcher = h.watcher(SOURCE);
    let checkpoint = watcher.start().await.unwrap();
    assert_eq!(checkpoint.block_number, 0);
    assert_eq!(checkpoint.block_hash, h.source.hash_of(0));

    // Starting again returns the stored checkpoint.
    assert_eq!(watcher.start().await.unwrap(), checkpoint);
}

#[tokio::test]
async fn waits_for_confirmations() {
    let h = Harness::new();
    h.source.mine(1);
    let block = h.source.height();
    h.source
        .push_log(SOURCE_BRIDGE, encode::transfer_sent(&sent(1, 100, 10)).unwrap(), block);

    let watcher = h.watcher(SOURCE);
    assert!(matches!(watcher.tick().await.unwrap(), TickOutcome::Idle { .. }));
    assert_eq!(sent_count(&h).await, 0);

    h.source.mine(2);
    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced {
            from: 1,
            to: block,
            events: 1
        }
    );
    assert_eq!(sent_count(&h).await, 1);
}

#[tokio::test]
async fn checkpointing_is_idempotent_across_restarts() {
    let h = Harness::new();
    let block = h.send(&sent(1, 100, 10));
    h.sync(SOURCE).await;
    assert_eq!(sent_count(&h).await, 1);

    let checkpoint = h.store.checkpoint(SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.block_number, block);
    assert_eq!(checkpoint.block_hash, h.source.hash_of(block));

    // A restarted watcher resumes at the checkpoint and finds nothing new.
    let restarted = h.watcher(SOURCE);
    assert!(matches!(restarted.tick().await.unwrap(), TickOutcome::Idle { .. }));
    assert_eq!(sent_count(&h).await, 1);

    // Replaying an already-persisted range is refused and changes nothing.
    let err = h
        .store
        .apply_block_range(BlockRangeBatch {
            chain_id: SOURCE,
            from_block: 1,
            checkpoint: ChainCheckpoint {
                chain_id: SOURCE,
                block_number: block,
                block_hash: h.source.hash_of(block),
            },
            events: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CheckpointConflict { .. }));
    assert_eq!(h.store.checkpoint(SOURCE).await.unwrap(), Some(checkpoint));
}

#[tokio::test]
async fn duplicate_send_event_is_ignored() {
    let h = Harness::new();
    let first = h.send(&sent(1, 100, 10));
    h.send(&sent(1, 100, 10));
    h.sync(SOURCE).await;

    assert_eq!(sent_count(&h).await, 1);
    assert_eq!(h.transfer(1).await.sent_block, first);
}

#[tokio::test]
async fn undecodable_log_is_skipped() {
    let h = Harness::new();
    h.source.mine(1);
    let block = h.source.height();
    let (topics, mut data) = encode::transfer_sent(&sent(1, 100, 10)).unwrap();
    data.truncate(40);
    h.source.push_log(SOURCE_BRIDGE, (topics, data), block);
    h.source
        .push_log(SOURCE_BRIDGE, encode::transfer_sent(&sent(2, 100, 10)).unwrap(), block);
    h.source.mine(2);

    h.sync(SOURCE).await;
    assert_eq!(sent_count(&h).await, 1);
    assert_eq!(h.transfer(2).await.state, TransferState::Sent);
    assert_eq!(
        h.store.checkpoint(SOURCE).await.unwrap().unwrap().block_number,
        block
    );
}

#[tokio::test]
async fn logs_from_other_contracts_are_ignored() {
    let h = Harness::new();
    h.source.mine(1);
    let block = h.source.height();
    h.source.push_log(
        DEST_BRIDGE,
        encode::transfer_sent(&sent(1, 100, 10)).unwrap(),
        block,
    );
    h.source.mine(2);

    h.sync(SOURCE).await;
    assert_eq!(sent_count(&h).await, 0);
}

#[tokio::test]
async fn reorg_rolls_back_and_rescans_without_duplicates() {
    let h = Harness::new();
    h.source.mine(5);
    h.source
        .push_log(SOURCE_BRIDGE, encode::transfer_sent(&sent(1, 100, 10)).unwrap(), 6);
    h.source.mine(6);
    assert_eq!(h.source.height(), 12);

    let watcher = h.watcher(SOURCE);
    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced {
            from: 1,
            to: 10,
            events: 1
        }
    );
    let abandoned = h.source.hash_of(10);

    // Blocks 9.. are replaced; the replacement carries a different transfer.
    h.source.reorg(9, 1);
    h.source
        .push_log(SOURCE_BRIDGE, encode::transfer_sent(&sent(2, 100, 10)).unwrap(), 9);
    h.source.mine(1);
    assert_ne!(h.source.hash_of(10), abandoned);

    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::ReorgRolledBack { from: 10, to: 5 }
    );
    let checkpoint = h.store.checkpoint(SOURCE).await.unwrap().unwrap();
    assert_eq!(checkpoint.block_number, 5);
    assert_eq!(checkpoint.block_hash, h.source.hash_of(5));

    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced {
            from: 6,
            to: 11,
            events: 2
        }
    );
    assert_eq!(sent_count(&h).await, 2);
    assert_eq!(h.transfer(1).await.sent_block, 6);
    assert_eq!(h.transfer(2).await.sent_block, 9);
    assert_eq!(
        h.store.checkpoint(SOURCE).await.unwrap().unwrap().block_hash,
        h.source.hash_of(11)
    );
}

#[tokio::test]
async fn log_from_another_branch_retries_the_range() {
    let h = Harness::new();
    h.source.mine(1);
    h.source
        .push_stale_log(SOURCE_BRIDGE, encode::transfer_sent(&sent(1, 100, 10)).unwrap(), 1);
    h.source.mine(2);

    let watcher = h.watcher(SOURCE);
    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::Retry { at_block: 1 }
    );
    assert_eq!(sent_count(&h).await, 0);
    assert_eq!(h.store.checkpoint(SOURCE).await.unwrap().unwrap().block_number, 0);

    h.source.restamp_logs();
    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced {
            from: 1,
            to: 1,
            events: 1
        }
    );
    assert_eq!(sent_count(&h).await, 1);
}

#[tokio::test]
async fn rollback_stops_at_start_block() {
    let h = Harness::new();
    h.source.mine(3);
    let watcher = h.watcher(SOURCE);
    assert!(matches!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced { from: 1, to: 2, .. }
    ));

    h.source.reorg(1, 7);
    h.source.mine(1);
    assert_eq!(
        watcher.tick().await.unwrap(),
        TickOutcome::ReorgRolledBack { from: 2, to: 0 }
    );
    assert!(matches!(
        watcher.tick().await.unwrap(),
        TickOutcome::Advanced { from: 1, .. }
    ));
}

#[tokio::test]
async fn recorded_events_nudge_the_engine() {
    let h = Harness::new();
    let (tx, mut rx) = work_notice_channel();
    let watcher = h.watcher(SOURCE).with_notices(tx);

    h.source.mine(3);
    watcher.tick().await.unwrap();
    assert!(rx.try_recv().is_err());

    h.send(&sent(1, 100, 10));
    watcher.tick().await.unwrap();
    assert_eq!(
        rx.try_recv().unwrap(),
        WorkNotice::EventsRecorded {
            chain_id: SOURCE,
            count: 1
        }
    );
}
