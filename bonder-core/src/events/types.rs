//! Bridge contract events and their decoding from raw logs.

use crate::chain::abi::{AbiError, Words, event_topic, word_to_address, word_to_timestamp, word_to_u64};
use crate::chain::types::{Address, H256, RawLog, TxHash};
use crate::entities::NewTransfer;
use bonder_sdk::objects::{ChainId, TokenSymbol};
use lazy_static::lazy_static;
use rust_decimal::Decimal;

pub const TRANSFER_SENT: &str =
    "TransferSent(bytes32,uint256,address,uint256,bytes32,uint256,uint256,uint256,uint256)";
pub const TRANSFERS_COMMITTED: &str = "TransfersCommitted(uint256,bytes32,uint256,uint256)";
pub const WITHDRAWAL_BONDED: &str = "WithdrawalBonded(address,bytes32,uint256)";
pub const WITHDRAWAL_BOND_SETTLED: &str = "WithdrawalBondSettled(address,bytes32,bytes32)";

struct ProtocolTopics {
    transfer_sent: H256,
    transfers_committed: H256,
    withdrawal_bonded: H256,
    withdrawal_bond_settled: H256,
}

lazy_static! {
    static ref TOPICS: ProtocolTopics = ProtocolTopics {
        transfer_sent: event_topic(TRANSFER_SENT),
        transfers_committed: event_topic(TRANSFERS_COMMITTED),
        withdrawal_bonded: event_topic(WITHDRAWAL_BONDED),
        withdrawal_bond_settled: event_topic(WITHDRAWAL_BOND_SETTLED),
    };
}

/// `topic0` of every event the watcher subscribes to.
pub fn protocol_topics() -> Vec<H256> {
    vec![
        TOPICS.transfer_sent,
        TOPICS.transfers_committed,
        TOPICS.withdrawal_bonded,
        TOPICS.withdrawal_bond_settled,
    ]
}

/// Where an event was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub chain_id: ChainId,
    /// Token of the bridge contract that emitted the log.
    pub token: TokenSymbol,
    pub contract: Address,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: TxHash,
    pub log_index: u64,
}

/// Emitted on the source chain when a user sends funds across.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSent {
    pub transfer_id: H256,
    pub destination_chain: ChainId,
    pub recipient: Address,
    pub amount: Decimal,
    pub transfer_nonce: H256,
    pub bonder_fee: Decimal,
    pub index: u128,
    pub amount_out_min: Decimal,
    pub deadline: i64,
}

/// Emitted on the source chain when a batch of transfers to one destination
/// is rolled into a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransfersCommitted {
    pub destination_chain: ChainId,
    pub root_hash: H256,
    pub total_amount: Decimal,
    pub committed_at: i64,
}

/// Emitted on the destination chain when a bonder advances a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalBonded {
    pub bonder: Address,
    pub transfer_id: H256,
    pub amount: Decimal,
}

/// Emitted on the destination chain when a bond is settled against a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalBondSettled {
    pub bonder: Address,
    pub transfer_id: H256,
    pub root_hash: H256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    TransferSent(TransferSent),
    TransfersCommitted(TransfersCommitted),
    WithdrawalBonded(WithdrawalBonded),
    WithdrawalBondSettled(WithdrawalBondSettled),
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::TransferSent(_) => "TransferSent",
            BridgeEvent::TransfersCommitted(_) => "TransfersCommitted",
            BridgeEvent::WithdrawalBonded(_) => "WithdrawalBonded",
            BridgeEvent::WithdrawalBondSettled(_) => "WithdrawalBondSettled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub meta: EventMeta,
    pub event: BridgeEvent,
}

impl ObservedEvent {
    pub fn transfer_id(&self) -> Option<H256> {
        match &self.event {
            BridgeEvent::TransferSent(e) => Some(e.transfer_id),
            BridgeEvent::WithdrawalBonded(e) => Some(e.transfer_id),
            BridgeEvent::WithdrawalBondSettled(e) => Some(e.transfer_id),
            BridgeEvent::TransfersCommitted(_) => None,
        }
    }
}

impl TransferSent {
    pub fn to_new_transfer(&self, meta: &EventMeta) -> NewTransfer {
        NewTransfer {
            transfer_id: self.transfer_id,
            source_chain: meta.chain_id,
            destination_chain: self.destination_chain,
            token: meta.token.clone(),
            amount: self.amount,
            recipient: self.recipient,
            deadline: self.deadline,
            bonder_fee: self.bonder_fee,
            transfer_nonce: self.transfer_nonce,
            amount_out_min: self.amount_out_min,
            sent_block: meta.block_number,
            sent_tx_hash: meta.tx_hash,
        }
    }
}

fn topic(log: &RawLog, index: usize) -> Result<&H256, AbiError> {
    log.topics.get(index).ok_or(AbiError::MissingTopic(index))
}

/// Decode a log emitted by the bridge contract of `token` on `chain_id`.
///
/// Logs with an unknown `topic0` decode to `Ok(None)`.
pub fn decode_log(
    chain_id: ChainId,
    token: &TokenSymbol,
    log: &RawLog,
) -> Result<Option<ObservedEvent>, AbiError> {
    let topic0 = topic(log, 0)?;
    let data = Words::new(&log.data);

    let event = if *topic0 == TOPICS.transfer_sent {
        BridgeEvent::TransferSent(TransferSent {
            transfer_id: *topic(log, 1)?,
            destination_chain: ChainId(word_to_u64(&topic(log, 2)?.0)?),
            recipient: word_to_address(&topic(log, 3)?.0)?,
            amount: data.amount(0)?,
            transfer_nonce: data.h256(1)?,
            bonder_fee: data.amount(2)?,
            index: data.u128(3)?,
            amount_out_min: data.amount(4)?,
            deadline: word_to_timestamp(data.word(5)?),
        })
    } else if *topic0 == TOPICS.transfers_committed {
        BridgeEvent::TransfersCommitted(TransfersCommitted {
            destination_chain: ChainId(word_to_u64(&topic(log, 1)?.0)?),
            root_hash: *topic(log, 2)?,
            total_amount: data.amount(0)?,
            committed_at: word_to_timestamp(data.word(1)?),
        })
    } else if *topic0 == TOPICS.withdrawal_bonded {
        BridgeEvent::WithdrawalBonded(WithdrawalBonded {
            bonder: word_to_address(&topic(log, 1)?.0)?,
            transfer_id: *topic(log, 2)?,
            amount: data.amount(0)?,
        })
    } else if *topic0 == TOPICS.withdrawal_bond_settled {
        BridgeEvent::WithdrawalBondSettled(WithdrawalBondSettled {
            bonder: word_to_address(&topic(log, 1)?.0)?,
            transfer_id: *topic(log, 2)?,
            root_hash: *topic(log, 3)?,
        })
    } else {
        return Ok(None);
    };

    Ok(Some(ObservedEvent {
        meta: EventMeta {
            chain_id,
            token: token.clone(),
            contract: log.address,
            block_number: log.block_number,
            block_hash: log.block_hash,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
        },
        event,
    }))
}

/// Nudge from a watcher to the bonding engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkNotice {
    EventsRecorded { chain_id: ChainId, count: usize },
}

/// Log encoders used by tests and local tooling.
pub mod encode {
    use super::*;
    use crate::chain::abi::CallBuilder;
    use smallvec::smallvec;

    fn uint_topic(value: u64) -> H256 {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        H256(word)
    }

    fn address_topic(address: &Address) -> H256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_bytes());
        H256(word)
    }

    /// ABI words without a selector.
    fn words(build: impl FnOnce(CallBuilder) -> Result<CallBuilder, AbiError>) -> Result<Vec<u8>, AbiError> {
        let data = build(CallBuilder::new(""))?.finish();
        Ok(data[4..].to_vec())
    }

    pub fn transfer_sent(event: &TransferSent) -> Result<(Vec<H256>, Vec<u8>), AbiError> {
        let data = words(|b| {
            Ok(b.amount(event.amount)?
                .bytes32(&event.transfer_nonce)
                .amount(event.bonder_fee)?
                .uint(event.index)
                .amount(event.amount_out_min)?
                .timestamp(event.deadline))
        })?;
        Ok((
            vec![
                TOPICS.transfer_sent,
                event.transfer_id,
                uint_topic(event.destination_chain.get()),
                address_topic(&event.recipient),
            ],
            data,
        ))
    }

    pub fn transfers_committed(event: &TransfersCommitted) -> Result<(Vec<H256>, Vec<u8>), AbiError> {
        let data = words(|b| {
            Ok(b.amount(event.total_amount)?
                .timestamp(event.committed_at))
        })?;
        Ok((
            vec![
                TOPICS.transfers_committed,
                uint_topic(event.destination_chain.get()),
                event.root_hash,
            ],
            data,
        ))
    }

    pub fn withdrawal_bonded(event: &WithdrawalBonded) -> Result<(Vec<H256>, Vec<u8>), AbiError> {
        let data = words(|b| b.amount(event.amount))?;
        Ok((
            vec![
                TOPICS.withdrawal_bonded,
                address_topic(&event.bonder),
                event.transfer_id,
            ],
            data,
        ))
    }

    pub fn withdrawal_bond_settled(event: &WithdrawalBondSettled) -> (Vec<H256>, Vec<u8>) {
        (
            vec![
                TOPICS.withdrawal_bond_settled,
                address_topic(&event.bonder),
                event.transfer_id,
                event.root_hash,
            ],
            Vec::new(),
        )
    }

    /// Assemble a raw log for the given topics and data.
    pub fn raw_log(
        address: Address,
        (topics, data): (Vec<H256>, Vec<u8>),
        block_number: u64,
        block_hash: H256,
        log_index: u64,
    ) -> RawLog {
        let mut tx = [0u8; 32];
        tx[..8].copy_from_slice(&block_number.to_be_bytes());
        tx[8..16].copy_from_slice(&log_index.to_be_bytes());
        let mut out = RawLog {
            address,
            topics: smallvec![],
            data,
            block_number,
            block_hash,
            tx_hash: H256(tx),
            log_index,
        };
        out.topics.extend(topics);
        out
    }
}
