//! Primitive chain types shared by the watcher, the engine and the stores.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("missing 0x prefix: {0}")]
    MissingPrefix(String),
    #[error("invalid hex: {0}")]
    Invalid(String),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("quantity out of range: {0}")]
    Overflow(String),
}

fn strip_0x(s: &str) -> Result<&str, HexError> {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| HexError::MissingPrefix(s.to_owned()))
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HexError> {
    let raw = hex::decode(strip_0x(s)?).map_err(|_| HexError::Invalid(s.to_owned()))?;
    let got = raw.len();
    raw.try_into().map_err(|_| HexError::Length { expected: N, got })
}

/// Parse a JSON-RPC quantity (`0x`-prefixed, no leading zero padding required).
pub fn parse_quantity(s: &str) -> Result<u128, HexError> {
    let digits = strip_0x(s)?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|_| HexError::Overflow(s.to_owned()))
}

pub fn parse_u64_quantity(s: &str) -> Result<u64, HexError> {
    let value = parse_quantity(s)?;
    u64::try_from(value).map_err(|_| HexError::Overflow(s.to_owned()))
}

pub fn format_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

pub fn decode_bytes(s: &str) -> Result<Vec<u8>, HexError> {
    hex::decode(strip_0x(s)?).map_err(|_| HexError::Invalid(s.to_owned()))
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

macro_rules! fixed_bytes {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const ZERO: Self = Self([0u8; $len]);

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl FromStr for $name {
            type Err = HexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(H256, 32);
fixed_bytes!(Address, 20);

pub type TxHash = H256;

/// The parts of a block header needed for reorg detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: SmallVec<[H256; 4]>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: TxHash,
    pub log_index: u64,
}

/// Logs emitted by any of `addresses` whose first topic is one of `topics0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics0: Vec<H256>,
}

impl LogFilter {
    pub fn matches(&self, log: &RawLog) -> bool {
        (self.addresses.is_empty() || self.addresses.contains(&log.address))
            && (self.topics0.is_empty()
                || log.topics.first().is_some_and(|t| self.topics0.contains(t)))
    }
}

pub type BlockRange = RangeInclusive<u64>;

/// An unsigned call the chain-access collaborator signs and broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub value: u128,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
}
