//! Transfer lifecycle rules, applied to rows already loaded (and locked) by
//! a store backend. Nothing here performs I/O; a backend loads the transfer
//! and the one ledger a rule needs, calls the rule, then writes both back.
//!
//! Every rule validates before it mutates, so an `Err` leaves the inputs
//! untouched.

use super::{StoreError, SubmissionFailure};
use crate::chain::types::{Address, H256, TxHash};
use crate::entities::{
    AttemptKind, BondObservation, LedgerKey, LiquidityLedger, NewBondAttempt, Transfer,
};
use bonder_sdk::objects::{SkipReason, TransferState};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease is ours. Carries the audit row when an expired holder's
    /// reservation had to be released.
    Acquired(Option<NewBondAttempt>),
    Busy,
    StateMismatch,
}

fn ledger_op(
    ledger: &mut LiquidityLedger,
    op: impl FnOnce(&mut LiquidityLedger) -> Result<(), crate::entities::LedgerError>,
) -> Result<(), StoreError> {
    op(ledger).map_err(|source| StoreError::Ledger {
        key: ledger.key.clone(),
        source,
    })
}

fn require_ledger<'a>(
    ledger: Option<&'a mut LiquidityLedger>,
    key: &LedgerKey,
) -> Result<&'a mut LiquidityLedger, StoreError> {
    match ledger {
        Some(l) if &l.key == key => Ok(l),
        _ => Err(StoreError::LedgerMissing(key.clone())),
    }
}

fn require_lease(t: &Transfer, owner: Uuid) -> Result<(), StoreError> {
    if t.holds_lease(owner) {
        Ok(())
    } else {
        Err(StoreError::LeaseLost(t.transfer_id))
    }
}

fn check_edge(t: &Transfer, next: TransferState) -> Result<(), StoreError> {
    if t.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            transfer_id: t.transfer_id,
            from: t.state,
            to: next,
        })
    }
}

/// Enter `Bonded`, continuing to `Committed` when the root is already known.
fn enter_bonded(t: &mut Transfer) {
    t.state = TransferState::Bonded;
    if t.committed_root.is_some() {
        t.state = TransferState::Committed;
    }
}

/// The ledger key a rule needs for `t`, given the bonder it is about to act for.
pub fn ledger_key_for_bond(t: &Transfer, bonder: Address) -> LedgerKey {
    t.reserved_ledger_key()
        .unwrap_or_else(|| t.ledger_key_for(bonder))
}

pub fn acquire_lease(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    owner: Uuid,
    expected: TransferState,
    lease: Duration,
    now: OffsetDateTime,
) -> Result<LeaseOutcome, StoreError> {
    if t.state != expected {
        return Ok(LeaseOutcome::StateMismatch);
    }
    let mut audit = None;
    if let Some(holder) = t.lock_owner.filter(|h| *h != owner) {
        if !t.lease_free(now) {
            return Ok(LeaseOutcome::Busy);
        }
        if t.state == TransferState::Sent {
            if let Some(key) = t.reserved_ledger_key() {
                let ledger = require_ledger(ledger, &key)?;
                ledger_op(ledger, |l| l.release(t.amount))?;
                t.bond_reserved = false;
                t.bonder = None;
                audit = Some(NewBondAttempt {
                    transfer_id: t.transfer_id,
                    kind: AttemptKind::LeaseExpired,
                    tx_hash: t.bond_tx_hash,
                    error: format!("lease held by {holder} expired with liquidity reserved"),
                    attempted_at: now,
                });
            }
        }
    }
    t.lock_owner = Some(owner);
    t.lock_expires_at = Some(now + lease);
    t.updated_at = now;
    Ok(LeaseOutcome::Acquired(audit))
}

pub fn unlock(t: &mut Transfer, owner: Uuid, now: OffsetDateTime) {
    if t.holds_lease(owner) {
        t.clear_lease();
        t.updated_at = now;
    }
}

pub fn reserve_bond(
    t: &mut Transfer,
    ledger: &mut LiquidityLedger,
    owner: Uuid,
    bonder: Address,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    require_lease(t, owner)?;
    check_edge(t, TransferState::Bonded)?;
    if t.bond_reserved {
        return Err(StoreError::Integrity {
            transfer_id: t.transfer_id,
            reason: "liquidity already reserved".to_owned(),
        });
    }
    let key = t.ledger_key_for(bonder);
    if ledger.key != key {
        return Err(StoreError::LedgerMissing(key));
    }
    ledger_op(ledger, |l| l.reserve(t.amount))?;
    t.bonder = Some(bonder);
    t.bond_reserved = true;
    t.bond_tx_hash = None;
    t.updated_at = now;
    Ok(())
}

pub fn record_bond_tx(
    t: &mut Transfer,
    owner: Uuid,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    require_lease(t, owner)?;
    t.bond_tx_hash = Some(tx_hash);
    t.updated_at = now;
    Ok(())
}

pub fn confirm_bond(
    t: &mut Transfer,
    owner: Uuid,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    require_lease(t, owner)?;
    match t.state {
        TransferState::Sent if t.bond_reserved => {
            enter_bonded(t);
            t.bond_tx_hash = Some(tx_hash);
        }
        // The watcher saw our bond land before we did.
        TransferState::Bonded | TransferState::Committed | TransferState::Settled
            if t.bond_reserved || t.bond_tx_hash == Some(tx_hash) => {}
        _ => {
            return Err(StoreError::Integrity {
                transfer_id: t.transfer_id,
                reason: format!("cannot confirm bond {tx_hash} in state {}", t.state),
            });
        }
    }
    t.attempts = 0;
    t.next_attempt_at = None;
    t.clear_lease();
    t.updated_at = now;
    Ok(())
}

pub fn release_bond(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    owner: Uuid,
    failure: SubmissionFailure,
    now: OffsetDateTime,
) -> Result<NewBondAttempt, StoreError> {
    require_lease(t, owner)?;
    if t.state == TransferState::Sent {
        if let Some(key) = t.reserved_ledger_key() {
            let ledger = require_ledger(ledger, &key)?;
            ledger_op(ledger, |l| l.release(t.amount))?;
            t.bond_reserved = false;
            t.bonder = None;
        }
    }
    t.attempts = t.attempts.saturating_add(1);
    t.next_attempt_at = Some(failure.retry_at);
    t.clear_lease();
    t.updated_at = now;
    Ok(NewBondAttempt {
        transfer_id: t.transfer_id,
        kind: AttemptKind::Bond,
        tx_hash: failure.tx_hash,
        error: failure.error,
        attempted_at: now,
    })
}

pub fn mark_unbondable(
    t: &mut Transfer,
    owner: Uuid,
    reason: SkipReason,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    require_lease(t, owner)?;
    check_edge(t, TransferState::Unbondable)?;
    if t.bond_reserved {
        return Err(StoreError::Integrity {
            transfer_id: t.transfer_id,
            reason: "cannot reject a transfer with liquidity reserved".to_owned(),
        });
    }
    t.state = TransferState::Unbondable;
    t.unbondable_reason = Some(reason);
    t.clear_lease();
    t.updated_at = now;
    Ok(())
}

pub fn record_settle_tx(
    t: &mut Transfer,
    owner: Uuid,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    require_lease(t, owner)?;
    t.settle_tx_hash = Some(tx_hash);
    t.updated_at = now;
    Ok(())
}

/// Move a bonded or committed transfer to `Settled`. Returns `false` when it
/// already was settled.
pub fn settle(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    tx_hash: TxHash,
    root: Option<H256>,
    now: OffsetDateTime,
) -> Result<bool, StoreError> {
    if t.state == TransferState::Settled {
        return Ok(false);
    }
    check_edge(t, TransferState::Settled)?;
    if let Some(key) = t.reserved_ledger_key() {
        let ledger = require_ledger(ledger, &key)?;
        ledger_op(ledger, |l| l.settle(t.amount))?;
        t.bond_reserved = false;
    }
    t.state = TransferState::Settled;
    t.settle_tx_hash = Some(tx_hash);
    if t.committed_root.is_none() {
        t.committed_root = root;
    }
    t.next_attempt_at = None;
    t.clear_lease();
    t.updated_at = now;
    Ok(true)
}

pub fn confirm_settlement(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    owner: Uuid,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<(), StoreError> {
    if t.state == TransferState::Settled {
        unlock(t, owner, now);
        return Ok(());
    }
    require_lease(t, owner)?;
    settle(t, ledger, tx_hash, None, now)?;
    t.attempts = 0;
    Ok(())
}

pub fn record_settle_failure(
    t: &mut Transfer,
    owner: Uuid,
    failure: SubmissionFailure,
    now: OffsetDateTime,
) -> Result<NewBondAttempt, StoreError> {
    require_lease(t, owner)?;
    t.attempts = t.attempts.saturating_add(1);
    t.next_attempt_at = Some(failure.retry_at);
    t.clear_lease();
    t.updated_at = now;
    Ok(NewBondAttempt {
        transfer_id: t.transfer_id,
        kind: AttemptKind::Settle,
        tx_hash: failure.tx_hash,
        error: failure.error,
        attempted_at: now,
    })
}

/// Attach a commitment root. `Bonded` transfers become `Committed`; `Sent`
/// ones keep their state. Returns whether anything changed.
pub fn attach_root(t: &mut Transfer, root: H256, now: OffsetDateTime) -> bool {
    if t.committed_root.is_some() {
        return false;
    }
    t.committed_root = Some(root);
    if t.state == TransferState::Bonded {
        t.state = TransferState::Committed;
    }
    t.updated_at = now;
    true
}

/// Apply a bond seen on the destination chain.
///
/// `ledger` must be the ledger for [`ledger_key_for_bond`]`(t, bonder)` when
/// one exists; a bond by a bonder without a ledger here is foreign.
pub fn observe_bond(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    bonder: Address,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<bool, StoreError> {
    if !matches!(t.state, TransferState::Sent | TransferState::Unbondable) {
        return Ok(false);
    }
    check_edge(t, TransferState::Bonded)?;

    match (t.reserved_ledger_key(), ledger) {
        // Our reservation and our bond: the reservation becomes the bond.
        (Some(_), _) if t.bonder == Some(bonder) => {}
        // Someone else bonded while we had liquidity reserved.
        (Some(key), ledger) => {
            let ledger = require_ledger(ledger, &key)?;
            ledger_op(ledger, |l| l.release(t.amount))?;
            t.bond_reserved = false;
        }
        // Our bond landed after the reservation was already released.
        (None, Some(ledger)) if ledger.key == t.ledger_key_for(bonder) => {
            let shortfall = ledger
                .reserve_observed(t.amount)
                .map_err(|source| StoreError::Ledger {
                    key: ledger.key.clone(),
                    source,
                })?;
            if shortfall > rust_decimal::Decimal::ZERO {
                warn!(
                    transfer_id = %t.transfer_id,
                    ledger = %ledger.key,
                    shortfall = %shortfall,
                    "Observed bond exceeded recorded liquidity; raising ledger total"
                );
            }
            t.bond_reserved = true;
        }
        (None, _) => {}
    }

    t.bonder = Some(bonder);
    t.bond_tx_hash = Some(tx_hash);
    enter_bonded(t);
    t.attempts = 0;
    t.next_attempt_at = None;
    t.updated_at = now;
    Ok(true)
}

/// Apply a settlement seen on the destination chain.
pub fn observe_settlement(
    t: &mut Transfer,
    ledger: Option<&mut LiquidityLedger>,
    root: H256,
    tx_hash: TxHash,
    now: OffsetDateTime,
) -> Result<bool, StoreError> {
    match t.state {
        TransferState::Bonded | TransferState::Committed => settle(t, ledger, tx_hash, Some(root), now),
        TransferState::Settled => Ok(false),
        TransferState::Sent | TransferState::Unbondable => {
            warn!(
                transfer_id = %t.transfer_id,
                state = %t.state,
                "Settlement observed for a transfer without a recorded bond"
            );
            Ok(false)
        }
    }
}

/// Build a new transfer row, replaying any bond and settlement seen before it.
///
/// `ledger` is the ledger of the observed bonder, when this node has one.
pub fn new_transfer_with_observation(
    mut t: Transfer,
    observation: Option<&BondObservation>,
    mut ledger: Option<&mut LiquidityLedger>,
    now: OffsetDateTime,
) -> Result<Transfer, StoreError> {
    if let Some(obs) = observation {
        observe_bond(&mut t, ledger.as_deref_mut(), obs.bonder, obs.bond_tx_hash, now)?;
        if let (Some(root), Some(tx)) = (obs.settled_root, obs.settle_tx_hash) {
            observe_settlement(&mut t, ledger, root, tx, now)?;
        }
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::transfer::fixtures::new_transfer;
    use rust_decimal::Decimal;

    const BONDER: Address = Address([0xb0; 20]);
    const OTHER: Address = Address([0xcc; 20]);
    const LEASE: Duration = Duration::from_secs(60);

    fn setup(amount: i64, total: i64) -> (Transfer, LiquidityLedger, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        let t = new_transfer(1, amount).into_transfer(now);
        let ledger = LiquidityLedger::new(t.ledger_key_for(BONDER), Decimal::from(total));
        (t, ledger, now)
    }

    fn failure(now: OffsetDateTime) -> SubmissionFailure {
        SubmissionFailure {
            tx_hash: None,
            error: "reverted".to_owned(),
            retry_at: now,
        }
    }

    #[test]
    fn bond_then_confirm() {
        let (mut t, mut l, now) = setup(100, 500);
        let owner = Uuid::new_v4();
        assert_eq!(
            acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap(),
            LeaseOutcome::Acquired(None)
        );
        reserve_bond(&mut t, &mut l, owner, BONDER, now).unwrap();
        assert_eq!(l.available(), Decimal::from(400));
        confirm_bond(&mut t, owner, H256([5; 32]), now).unwrap();
        assert_eq!(t.state, TransferState::Bonded);
        assert_eq!(t.lock_owner, None);
        assert!(t.bond_reserved);
    }

    #[test]
    fn second_owner_is_busy_until_expiry() {
        let (mut t, _, now) = setup(100, 500);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        acquire_lease(&mut t, None, first, TransferState::Sent, LEASE, now).unwrap();
        assert_eq!(
            acquire_lease(&mut t, None, second, TransferState::Sent, LEASE, now).unwrap(),
            LeaseOutcome::Busy
        );
        assert_eq!(
            acquire_lease(&mut t, None, second, TransferState::Bonded, LEASE, now).unwrap(),
            LeaseOutcome::StateMismatch
        );
        let later = now + LEASE;
        assert!(matches!(
            acquire_lease(&mut t, None, second, TransferState::Sent, LEASE, later).unwrap(),
            LeaseOutcome::Acquired(None)
        ));
        assert!(t.holds_lease(second));
    }

    #[test]
    fn expired_lease_with_reservation_is_released_on_takeover() {
        let (mut t, mut l, now) = setup(100, 500);
        let crashed = Uuid::new_v4();
        acquire_lease(&mut t, None, crashed, TransferState::Sent, LEASE, now).unwrap();
        reserve_bond(&mut t, &mut l, crashed, BONDER, now).unwrap();

        let later = now + LEASE;
        let outcome = acquire_lease(
            &mut t,
            Some(&mut l),
            Uuid::new_v4(),
            TransferState::Sent,
            LEASE,
            later,
        )
        .unwrap();
        let LeaseOutcome::Acquired(Some(audit)) = outcome else {
            panic!("expected takeover audit, got {outcome:?}");
        };
        assert_eq!(audit.kind, AttemptKind::LeaseExpired);
        assert_eq!(l.available(), Decimal::from(500));
        assert!(!t.bond_reserved);

        // The crashed holder can no longer act on the transfer.
        assert!(matches!(
            confirm_bond(&mut t, crashed, H256::ZERO, later),
            Err(StoreError::LeaseLost(_))
        ));
    }

    #[test]
    fn release_restores_ledger_and_schedules_retry() {
        let (mut t, mut l, now) = setup(100, 500);
        let owner = Uuid::new_v4();
        acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap();
        reserve_bond(&mut t, &mut l, owner, BONDER, now).unwrap();
        let retry_at = now + Duration::from_secs(30);
        let attempt = release_bond(
            &mut t,
            Some(&mut l),
            owner,
            SubmissionFailure {
                retry_at,
                ..failure(now)
            },
            now,
        )
        .unwrap();
        assert_eq!(attempt.kind, AttemptKind::Bond);
        assert_eq!(l.available(), Decimal::from(500));
        assert_eq!(t.state, TransferState::Sent);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.next_attempt_at, Some(retry_at));
        assert!(t.lock_owner.is_none());
    }

    #[test]
    fn failed_reservation_leaves_transfer_untouched() {
        let (mut t, mut l, now) = setup(100, 50);
        let owner = Uuid::new_v4();
        acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap();
        let before = t.clone();
        assert!(matches!(
            reserve_bond(&mut t, &mut l, owner, BONDER, now),
            Err(StoreError::Ledger { .. })
        ));
        assert_eq!(t, before);
        assert_eq!(l.in_flight, Decimal::ZERO);
    }

    #[test]
    fn unbondable_requires_no_reservation() {
        let (mut t, _, now) = setup(100, 500);
        let owner = Uuid::new_v4();
        acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap();
        mark_unbondable(&mut t, owner, SkipReason::ExceedsMaxTradeAmount, now).unwrap();
        assert_eq!(t.state, TransferState::Unbondable);
        assert_eq!(t.unbondable_reason, Some(SkipReason::ExceedsMaxTradeAmount));
    }

    #[test]
    fn commit_then_settle_moves_in_flight_to_settled() {
        let (mut t, mut l, now) = setup(100, 500);
        let owner = Uuid::new_v4();
        acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap();
        reserve_bond(&mut t, &mut l, owner, BONDER, now).unwrap();
        confirm_bond(&mut t, owner, H256([5; 32]), now).unwrap();

        assert!(attach_root(&mut t, H256([9; 32]), now));
        assert!(!attach_root(&mut t, H256([8; 32]), now));
        assert_eq!(t.state, TransferState::Committed);

        acquire_lease(&mut t, None, owner, TransferState::Committed, LEASE, now).unwrap();
        confirm_settlement(&mut t, Some(&mut l), owner, H256([6; 32]), now).unwrap();
        assert_eq!(t.state, TransferState::Settled);
        assert_eq!(l.available(), Decimal::from(400));
        assert_eq!(l.in_flight, Decimal::ZERO);
        assert_eq!(l.settled, Decimal::from(100));

        // Re-observing the settlement is a no-op.
        assert!(!observe_settlement(&mut t, Some(&mut l), H256([9; 32]), H256([6; 32]), now).unwrap());
        assert_eq!(l.settled, Decimal::from(100));
    }

    #[test]
    fn foreign_bond_releases_our_reservation() {
        let (mut t, mut l, now) = setup(100, 500);
        let owner = Uuid::new_v4();
        acquire_lease(&mut t, None, owner, TransferState::Sent, LEASE, now).unwrap();
        reserve_bond(&mut t, &mut l, owner, BONDER, now).unwrap();

        assert!(observe_bond(&mut t, Some(&mut l), OTHER, H256([7; 32]), now).unwrap());
        assert_eq!(t.state, TransferState::Bonded);
        assert_eq!(t.bonder, Some(OTHER));
        assert!(!t.bond_reserved);
        assert_eq!(l.available(), Decimal::from(500));

        // Our own failure report afterwards must not touch the ledger again.
        release_bond(&mut t, Some(&mut l), owner, failure(now), now).unwrap();
        assert_eq!(l.available(), Decimal::from(500));
        assert_eq!(t.state, TransferState::Bonded);
    }

    #[test]
    fn late_observed_own_bond_is_recharged() {
        let (mut t, mut l, now) = setup(100, 500);
        assert!(observe_bond(&mut t, Some(&mut l), BONDER, H256([7; 32]), now).unwrap());
        assert!(t.bond_reserved);
        assert_eq!(l.in_flight, Decimal::from(100));
        assert!(!observe_bond(&mut t, Some(&mut l), BONDER, H256([7; 32]), now).unwrap());
        assert_eq!(l.in_flight, Decimal::from(100));
    }

    #[test]
    fn observation_replayed_on_insert() {
        let (t, mut l, now) = setup(100, 500);
        let obs = BondObservation {
            transfer_id: t.transfer_id,
            chain_id: t.destination_chain,
            bonder: BONDER,
            amount: t.amount,
            bond_tx_hash: H256([7; 32]),
            settled_root: Some(H256([9; 32])),
            settle_tx_hash: Some(H256([6; 32])),
        };
        let t = new_transfer_with_observation(t, Some(&obs), Some(&mut l), now).unwrap();
        assert_eq!(t.state, TransferState::Settled);
        assert_eq!(t.committed_root, Some(H256([9; 32])));
        assert_eq!(l.settled, Decimal::from(100));
        assert_eq!(l.in_flight, Decimal::ZERO);
    }
}
