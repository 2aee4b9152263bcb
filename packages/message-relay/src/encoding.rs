//! Canonical payload encodings
//!
//! - `send(...)` calldata submitted to the destination bridge
//! - the deposit payload carried by UTXO-sourced messages
//! - decoding of the bridge `Call`/`Send` event data
//!
//! All layouts follow standard ABI head/tail encoding. Field order is part of
//! the signed payload; changing it breaks existing signatures.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{sol_data, SolType};
use eyre::{eyre, Result, WrapErr};

use crate::hash::{address_word, event_topic, pad_to_word, selector, u256_word, u64_word};

pub const SEND_FUNCTION_SIGNATURE: &str = "send(uint256,uint256,address,address,bytes,bytes[])";
pub const CALL_EVENT_SIGNATURE: &str = "Call(uint256,uint256,address,uint256,address,bytes)";
pub const SEND_EVENT_SIGNATURE: &str = "Send(uint256,uint256,address,uint256,address,bytes)";

/// Arguments of the destination bridge `send` call
#[derive(Debug, Clone)]
pub struct SendCall<'a> {
    pub from_chain_id: u64,
    pub from_id: U256,
    pub from_sender: Address,
    pub contract_address: Address,
    pub payload: &'a [u8],
    pub signatures: &'a [Vec<u8>],
}

/// Encode `send(from_chain_id, from_id, from_sender, contract_address, bytes, bytes[])`
pub fn encode_send_call(call: &SendCall<'_>) -> Vec<u8> {
    let padded_payload = pad_to_word(call.payload);
    // head is six words; the payload tail starts right after it
    let payload_offset = 6 * 32;
    let signatures_offset = payload_offset + 32 + padded_payload.len();

    let mut out = Vec::with_capacity(4 + signatures_offset + 64 * (call.signatures.len() + 1));
    out.extend_from_slice(&selector(SEND_FUNCTION_SIGNATURE));
    out.extend_from_slice(&u64_word(call.from_chain_id));
    out.extend_from_slice(&u256_word(call.from_id));
    out.extend_from_slice(&address_word(call.from_sender));
    out.extend_from_slice(&address_word(call.contract_address));
    out.extend_from_slice(&u64_word(payload_offset as u64));
    out.extend_from_slice(&u64_word(signatures_offset as u64));

    out.extend_from_slice(&u64_word(call.payload.len() as u64));
    out.extend_from_slice(&padded_payload);

    // bytes[]: count, one offset per element relative to the first offset word,
    // then each element as length + padded data
    let count = call.signatures.len();
    out.extend_from_slice(&u64_word(count as u64));
    let mut element_offset = 32 * count;
    for signature in call.signatures {
        out.extend_from_slice(&u64_word(element_offset as u64));
        element_offset += 32 + pad_to_word(signature).len();
    }
    for signature in call.signatures {
        out.extend_from_slice(&u64_word(signature.len() as u64));
        out.extend_from_slice(&pad_to_word(signature));
    }
    out
}

/// A native-asset deposit as carried in a message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositPayload {
    pub tx_id: B256,
    /// Source-chain depositor address, as its textual encoding
    pub from_address: String,
    pub to_address: Address,
    pub amount: U256,
}

const DEPOSIT_HEAD_LEN: usize = 4 * 32;

/// Encode `(bytes32 tx_id, string from_address, address to_address, uint256 amount)`
pub fn encode_deposit_payload(deposit: &DepositPayload) -> Vec<u8> {
    let from = deposit.from_address.as_bytes();
    let mut out = Vec::with_capacity(DEPOSIT_HEAD_LEN + 32 + from.len() + 32);
    out.extend_from_slice(deposit.tx_id.as_slice());
    out.extend_from_slice(&u64_word(DEPOSIT_HEAD_LEN as u64));
    out.extend_from_slice(&address_word(deposit.to_address));
    out.extend_from_slice(&u256_word(deposit.amount));
    out.extend_from_slice(&u64_word(from.len() as u64));
    out.extend_from_slice(&pad_to_word(from));
    out
}

/// Inverse of [`encode_deposit_payload`]
pub fn decode_deposit_payload(data: &[u8]) -> Result<DepositPayload> {
    if data.len() < DEPOSIT_HEAD_LEN + 32 {
        return Err(eyre!("deposit payload too short: {} bytes", data.len()));
    }
    let word = |index: usize| &data[index * 32..(index + 1) * 32];

    let tx_id = B256::from_slice(word(0));
    let offset = word_to_usize(word(1)).wrap_err("invalid from_address offset")?;
    if offset != DEPOSIT_HEAD_LEN {
        return Err(eyre!("unexpected from_address offset {}", offset));
    }
    let to_word = word(2);
    if to_word[..12].iter().any(|b| *b != 0) {
        return Err(eyre!("to_address word has non-zero high bytes"));
    }
    let to_address = Address::from_slice(&to_word[12..]);
    let amount = U256::from_be_slice(word(3));

    let length = word_to_usize(word(4)).wrap_err("invalid from_address length")?;
    let start = DEPOSIT_HEAD_LEN + 32;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| eyre!("from_address length {} overruns payload", length))?;
    let from_address = String::from_utf8(data[start..end].to_vec())
        .wrap_err("from_address is not valid UTF-8")?;

    Ok(DepositPayload {
        tx_id,
        from_address,
        to_address,
        amount,
    })
}

fn word_to_usize(word: &[u8]) -> Result<usize> {
    let value = U256::from_be_slice(word);
    usize::try_from(value).map_err(|_| eyre!("word {} does not fit in usize", value))
}

/// Which bridge event a log carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEventKind {
    Call,
    Send,
}

impl BridgeEventKind {
    pub fn from_topic(topic: &B256) -> Option<Self> {
        if *topic == event_topic(CALL_EVENT_SIGNATURE) {
            Some(BridgeEventKind::Call)
        } else if *topic == event_topic(SEND_EVENT_SIGNATURE) {
            Some(BridgeEventKind::Send)
        } else {
            None
        }
    }

    pub fn topic(&self) -> B256 {
        match self {
            BridgeEventKind::Call => event_topic(CALL_EVENT_SIGNATURE),
            BridgeEventKind::Send => event_topic(SEND_EVENT_SIGNATURE),
        }
    }
}

/// Decoded fields shared by the `Call` and `Send` events (all non-indexed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEventData {
    pub from_chain_id: U256,
    pub from_id: U256,
    pub from_sender: Address,
    pub to_chain_id: U256,
    pub contract_address: Address,
    pub data: Bytes,
}

type BridgeEventTuple = (
    sol_data::Uint<256>,
    sol_data::Uint<256>,
    sol_data::Address,
    sol_data::Uint<256>,
    sol_data::Address,
    sol_data::Bytes,
);

/// Decode the data section of a bridge `Call`/`Send` log
pub fn decode_bridge_event(data: &[u8]) -> Result<BridgeEventData> {
    let (from_chain_id, from_id, from_sender, to_chain_id, contract_address, payload) =
        BridgeEventTuple::abi_decode_params(data, true)
            .map_err(|e| eyre!("failed to decode bridge event data: {}", e))?;
    Ok(BridgeEventData {
        from_chain_id,
        from_id,
        from_sender,
        to_chain_id,
        contract_address,
        data: payload,
    })
}
