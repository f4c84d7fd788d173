//! Minimal Solidity ABI support: event topics, call selectors and static
//! 32-byte words. The bridge only uses static types, so no dynamic
//! encoding is needed.

use crate::chain::types::{Address, H256};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sha3::{Digest, Keccak256};

pub const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("data too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("missing topic {0}")]
    MissingTopic(usize),
    #[error("value does not fit: {0}")]
    Overflow(&'static str),
    #[error("dirty padding in {0}")]
    DirtyPadding(&'static str),
    #[error("amount is not an unsigned integer: {0}")]
    InvalidAmount(Decimal),
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// `topic0` of an event, e.g. `event_topic("Transfer(address,address,uint256)")`.
pub fn event_topic(signature: &str) -> H256 {
    H256(keccak256(signature.as_bytes()))
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Read-only view over ABI-encoded static words.
pub struct Words<'a> {
    data: &'a [u8],
}

impl<'a> Words<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn word(&self, index: usize) -> Result<&'a [u8; WORD], AbiError> {
        let start = index * WORD;
        let end = start + WORD;
        self.data
            .get(start..end)
            .and_then(|w| w.try_into().ok())
            .ok_or(AbiError::Truncated {
                need: end,
                got: self.data.len(),
            })
    }

    pub fn u128(&self, index: usize) -> Result<u128, AbiError> {
        word_to_u128(self.word(index)?)
    }

    pub fn amount(&self, index: usize) -> Result<Decimal, AbiError> {
        word_to_amount(self.word(index)?)
    }

    pub fn h256(&self, index: usize) -> Result<H256, AbiError> {
        Ok(H256(*self.word(index)?))
    }
}

pub fn word_to_u128(word: &[u8; WORD]) -> Result<u128, AbiError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow("uint256 > u128"));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_u64(word: &[u8; WORD]) -> Result<u64, AbiError> {
    u64::try_from(word_to_u128(word)?).map_err(|_| AbiError::Overflow("uint256 > u64"))
}

/// Unix timestamps saturate at `i64::MAX`; contracts use `type(uint256).max`
/// for "never".
pub fn word_to_timestamp(word: &[u8; WORD]) -> i64 {
    word_to_u128(word)
        .ok()
        .and_then(|v| i64::try_from(v).ok())
        .unwrap_or(i64::MAX)
}

/// Token amounts are carried as integral base units in a `Decimal`.
pub fn word_to_amount(word: &[u8; WORD]) -> Result<Decimal, AbiError> {
    let raw = word_to_u128(word)?;
    let signed = i128::try_from(raw).map_err(|_| AbiError::Overflow("amount"))?;
    Decimal::try_from_i128_with_scale(signed, 0).map_err(|_| AbiError::Overflow("amount"))
}

pub fn word_to_address(word: &[u8; WORD]) -> Result<Address, AbiError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(AbiError::DirtyPadding("address"));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&word[12..]);
    Ok(Address(out))
}

/// Builds calldata for a function with static arguments only.
pub struct CallBuilder {
    buf: Vec<u8>,
}

impl CallBuilder {
    pub fn new(signature: &str) -> Self {
        let mut buf = Vec::with_capacity(4 + WORD * 6);
        buf.extend_from_slice(&selector(signature));
        Self { buf }
    }

    pub fn uint(mut self, value: u128) -> Self {
        self.buf.extend_from_slice(&[0u8; 16]);
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn amount(self, value: Decimal) -> Result<Self, AbiError> {
        if value.is_sign_negative() || value.fract() != Decimal::ZERO {
            return Err(AbiError::InvalidAmount(value));
        }
        let raw = value.to_u128().ok_or(AbiError::InvalidAmount(value))?;
        Ok(self.uint(raw))
    }

    /// Inverse of [`word_to_timestamp`]: `i64::MAX` is written as
    /// `type(uint256).max`, negatives as zero.
    pub fn timestamp(mut self, value: i64) -> Self {
        if value == i64::MAX {
            self.buf.extend_from_slice(&[0xff; WORD]);
            return self;
        }
        self.uint(u128::try_from(value).unwrap_or_default())
    }

    pub fn address(mut self, value: &Address) -> Self {
        self.buf.extend_from_slice(&[0u8; 12]);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn bytes32(mut self, value: &H256) -> Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erc20_transfer_topic_matches_known_value() {
        assert_eq!(
            event_topic("Transfer(address,address,uint256)").to_string(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn call_builder_lays_out_words() {
        let to = Address([0xaa; 20]);
        let data = CallBuilder::new("transfer(address,uint256)")
            .address(&to)
            .amount(Decimal::from(1000))
            .unwrap()
            .finish();
        assert_eq!(data.len(), 4 + 2 * WORD);

        let words = Words::new(&data[4..]);
        assert_eq!(word_to_address(words.word(0).unwrap()).unwrap(), to);
        assert_eq!(words.amount(1).unwrap(), Decimal::from(1000));
    }

    #[test]
    fn timestamps_saturate() {
        let data = CallBuilder::new("f(uint256,uint256,uint256)")
            .timestamp(1_900_000_000)
            .timestamp(i64::MAX)
            .timestamp(-1)
            .finish();
        let words = Words::new(&data[4..]);
        assert_eq!(words.word(1).unwrap(), &[0xff; WORD]);
        assert_eq!(word_to_timestamp(words.word(0).unwrap()), 1_900_000_000);
        assert_eq!(word_to_timestamp(words.word(1).unwrap()), i64::MAX);
        assert_eq!(word_to_timestamp(words.word(2).unwrap()), 0);

        // Above i64 but inside u128.
        let mut word = [0u8; WORD];
        word[16] = 0x80;
        assert_eq!(word_to_timestamp(&word), i64::MAX);
    }

    #[test]
    fn rejects_fractional_and_oversized_amounts() {
        assert!(CallBuilder::new("f(uint256)").amount(Decimal::new(15, 1)).is_err());
        assert!(CallBuilder::new("f(uint256)").amount(Decimal::from(-1)).is_err());

        let mut word = [0u8; WORD];
        word[0] = 1;
        assert!(word_to_amount(&word).is_err());
        let words = Words::new(&word[..10]);
        assert!(matches!(words.word(0), Err(AbiError::Truncated { need: 32, got: 10 })));
    }
}
