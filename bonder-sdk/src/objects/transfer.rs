use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a cross-chain transfer.
///
/// ```text
/// Sent ──► Bonded ──► Committed ──► Settled
///   │        ▲  └───────────────────►┘
///   ▼        │
/// Unbondable ┘
/// ```
///
/// A failed bond or settlement submission never leaves a resting state of
/// its own: the transfer keeps its previous state and the failure is recorded
/// as an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Sent,
    Bonded,
    Committed,
    Settled,
    Unbondable,
}

impl TransferState {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransferState::Sent => "sent",
            TransferState::Bonded => "bonded",
            TransferState::Committed => "committed",
            TransferState::Settled => "settled",
            TransferState::Unbondable => "unbondable",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    ///
    /// `Unbondable -> Bonded` only happens when another bonder's bond is
    /// observed on chain, and `Bonded -> Settled` when the destination chain
    /// reports the settlement before the source commit has been scanned.
    pub const fn can_transition_to(self, next: TransferState) -> bool {
        matches!(
            (self, next),
            (TransferState::Sent, TransferState::Bonded)
                | (TransferState::Sent, TransferState::Unbondable)
                | (TransferState::Unbondable, TransferState::Bonded)
                | (TransferState::Bonded, TransferState::Committed)
                | (TransferState::Bonded, TransferState::Settled)
                | (TransferState::Committed, TransferState::Settled)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, TransferState::Settled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transfer state: {0}")]
pub struct UnknownTransferState(pub String);

impl FromStr for TransferState {
    type Err = UnknownTransferState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(TransferState::Sent),
            "bonded" => Ok(TransferState::Bonded),
            "committed" => Ok(TransferState::Committed),
            "settled" => Ok(TransferState::Settled),
            "unbondable" => Ok(TransferState::Unbondable),
            other => Err(UnknownTransferState(other.to_owned())),
        }
    }
}

/// Why the bonding policy refused to advance funds for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    ExceedsMaxTradeAmount,
    InsufficientLiquidity,
    BelowMinThreshold,
    DeadlineExpired,
    AlreadyCommitted,
    UnsupportedRoute,
    InvalidAmount,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            SkipReason::ExceedsMaxTradeAmount => "exceeds-max-trade-amount",
            SkipReason::InsufficientLiquidity => "insufficient-liquidity",
            SkipReason::BelowMinThreshold => "below-min-threshold",
            SkipReason::DeadlineExpired => "deadline-expired",
            SkipReason::AlreadyCommitted => "already-committed",
            SkipReason::UnsupportedRoute => "unsupported-route",
            SkipReason::InvalidAmount => "invalid-amount",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipReason {
    type Err = UnknownTransferState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exceeds-max-trade-amount" => Ok(SkipReason::ExceedsMaxTradeAmount),
            "insufficient-liquidity" => Ok(SkipReason::InsufficientLiquidity),
            "below-min-threshold" => Ok(SkipReason::BelowMinThreshold),
            "deadline-expired" => Ok(SkipReason::DeadlineExpired),
            "already-committed" => Ok(SkipReason::AlreadyCommitted),
            "unsupported-route" => Ok(SkipReason::UnsupportedRoute),
            "invalid-amount" => Ok(SkipReason::InvalidAmount),
            other => Err(UnknownTransferState(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use TransferState::*;
        assert!(Sent.can_transition_to(Bonded));
        assert!(Sent.can_transition_to(Unbondable));
        assert!(Bonded.can_transition_to(Committed));
        assert!(Committed.can_transition_to(Settled));

        assert!(!Sent.can_transition_to(Settled));
        assert!(!Bonded.can_transition_to(Sent));
        assert!(!Settled.can_transition_to(Committed));
        assert!(!Unbondable.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Sent));
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [
            TransferState::Sent,
            TransferState::Bonded,
            TransferState::Committed,
            TransferState::Settled,
            TransferState::Unbondable,
        ] {
            assert_eq!(state.as_str().parse::<TransferState>().unwrap(), state);
        }
        assert!("failed".parse::<TransferState>().is_err());
    }

    #[test]
    fn skip_reason_wire_format() {
        let json = serde_json::to_string(&SkipReason::ExceedsMaxTradeAmount).unwrap();
        assert_eq!(json, "\"exceeds-max-trade-amount\"");
        assert_eq!(
            "insufficient-liquidity".parse::<SkipReason>().unwrap(),
            SkipReason::InsufficientLiquidity
        );
        assert_eq!(SkipReason::InvalidAmount.to_string(), "invalid-amount");
        assert_eq!(
            "invalid-amount".parse::<SkipReason>().unwrap(),
            SkipReason::InvalidAmount
        );
    }
}
