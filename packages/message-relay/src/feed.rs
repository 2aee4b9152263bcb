//! Chain events normalized into ledger messages

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result};
use tracing::warn;

use crate::clients::LogRecord;
use crate::config::Bridges;
use crate::db::models::NewMessage;
use crate::encoding::{
    decode_bridge_event, encode_deposit_payload, BridgeEventData, BridgeEventKind, DepositPayload,
};
use crate::hash::bytes32_to_hex;
use crate::types::{ledger_int, MessageStatus, MessageType};

/// Where an event sits on its chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAnchor {
    pub chain_id: i64,
    pub block_number: i64,
    pub block_time: i64,
    /// Log index, or the transaction's position in its block for deposits
    pub log_index: i64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Emitted by the source bridge when a message is sent out
    Call {
        anchor: EventAnchor,
        contract: Address,
        event: BridgeEventData,
    },
    /// Emitted by the destination bridge when a message is delivered
    Send {
        anchor: EventAnchor,
        contract: Address,
        event: BridgeEventData,
    },
    /// A native-asset transfer to the UTXO listen address
    Deposit {
        anchor: EventAnchor,
        deposit: DepositPayload,
    },
}

impl BridgeEvent {
    /// Decode a bridge log. `Ok(None)` for logs that are not bridge events.
    pub fn from_log(chain_id: i64, log: &LogRecord) -> Result<Option<Self>> {
        let Some(kind) = log.topics.first().and_then(BridgeEventKind::from_topic) else {
            return Ok(None);
        };
        let anchor = EventAnchor {
            chain_id,
            block_number: ledger_int(
                log.block_number
                    .ok_or_else(|| eyre!("Missing block number"))?,
                "block number",
            )?,
            block_time: ledger_int(log.block_timestamp.unwrap_or_default(), "block time")?,
            log_index: ledger_int(
                log.log_index.ok_or_else(|| eyre!("Missing log index"))?,
                "log index",
            )?,
            tx_hash: format!(
                "{:#x}",
                log.tx_hash.ok_or_else(|| eyre!("Missing transaction hash"))?
            ),
        };
        let event = decode_bridge_event(&log.data)?;
        let contract = log.address;
        Ok(Some(match kind {
            BridgeEventKind::Call => BridgeEvent::Call {
                anchor,
                contract,
                event,
            },
            BridgeEventKind::Send => BridgeEvent::Send {
                anchor,
                contract,
                event,
            },
        }))
    }

    pub fn anchor(&self) -> &EventAnchor {
        match self {
            BridgeEvent::Call { anchor, .. }
            | BridgeEvent::Send { anchor, .. }
            | BridgeEvent::Deposit { anchor, .. } => anchor,
        }
    }
}

/// Destination for deposits seen on a UTXO chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRoute {
    pub listen_address: String,
    pub to_chain_id: i64,
    pub to_contract_address: String,
}

/// Turns events into messages, filling bridge addresses from `BRIDGES`
#[derive(Debug, Clone)]
pub struct Normalizer {
    bridges: Bridges,
    deposit_route: Option<DepositRoute>,
}

fn chain_id_of(value: U256, field: &str) -> Option<i64> {
    match i64::try_from(value) {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(field, value = %value, "Chain id out of range, skipping event");
            None
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

impl Normalizer {
    pub fn new(bridges: Bridges, deposit_route: Option<DepositRoute>) -> Self {
        Self {
            bridges,
            deposit_route,
        }
    }

    fn bridge(&self, chain_id: i64, anchor: &EventAnchor) -> Option<String> {
        let bridge = self.bridges.get(chain_id).map(str::to_lowercase);
        if bridge.is_none() {
            warn!(
                chain_id,
                tx_hash = %anchor.tx_hash,
                log_index = anchor.log_index,
                "No bridge configured for chain, skipping event"
            );
        }
        bridge
    }

    /// `None` when the event cannot be routed
    pub fn normalize(&self, event: &BridgeEvent) -> Option<NewMessage> {
        match event {
            BridgeEvent::Call {
                anchor,
                contract,
                event,
            } => {
                let to_chain_id = chain_id_of(event.to_chain_id, "to_chain_id")?;
                Some(self.from_log(
                    anchor,
                    event,
                    MessageType::Call,
                    MessageStatus::Validating,
                    format!("{:#x}", contract),
                    self.bridge(to_chain_id, anchor)?,
                )?)
            }
            BridgeEvent::Send {
                anchor,
                contract,
                event,
            } => {
                let from_chain_id = chain_id_of(event.from_chain_id, "from_chain_id")?;
                Some(self.from_log(
                    anchor,
                    event,
                    MessageType::Send,
                    MessageStatus::Pending,
                    self.bridge(from_chain_id, anchor)?,
                    format!("{:#x}", contract),
                )?)
            }
            BridgeEvent::Deposit { anchor, deposit } => self.from_deposit(anchor, deposit),
        }
    }

    fn from_log(
        &self,
        anchor: &EventAnchor,
        event: &BridgeEventData,
        message_type: MessageType,
        status: MessageStatus,
        from_message_bridge: String,
        to_message_bridge: String,
    ) -> Option<NewMessage> {
        Some(NewMessage {
            chain_id: anchor.chain_id,
            message_type,
            from_chain_id: chain_id_of(event.from_chain_id, "from_chain_id")?,
            from_sender: format!("{:#x}", event.from_sender),
            from_message_bridge,
            from_id: bytes32_to_hex(&event.from_id.to_be_bytes::<32>()),
            to_chain_id: chain_id_of(event.to_chain_id, "to_chain_id")?,
            to_message_bridge,
            to_contract_address: format!("{:#x}", event.contract_address),
            to_bytes: hex_bytes(&event.data),
            signatures: "[]".to_string(),
            status,
            event_id: 0,
            block_time: anchor.block_time,
            block_number: anchor.block_number,
            log_index: anchor.log_index,
            tx_hash: anchor.tx_hash.clone(),
        })
    }

    fn from_deposit(&self, anchor: &EventAnchor, deposit: &DepositPayload) -> Option<NewMessage> {
        let Some(route) = &self.deposit_route else {
            warn!(tx_hash = %anchor.tx_hash, "No deposit route configured, skipping deposit");
            return None;
        };
        let tx_id = bytes32_to_hex(&deposit.tx_id.0);
        Some(NewMessage {
            chain_id: anchor.chain_id,
            message_type: MessageType::Call,
            from_chain_id: anchor.chain_id,
            from_sender: format!("{:#x}", Address::ZERO),
            from_message_bridge: route.listen_address.clone(),
            from_id: tx_id.clone(),
            to_chain_id: route.to_chain_id,
            to_message_bridge: self.bridge(route.to_chain_id, anchor)?,
            to_contract_address: route.to_contract_address.to_lowercase(),
            to_bytes: hex_bytes(&encode_deposit_payload(deposit)),
            signatures: "{}".to_string(),
            status: MessageStatus::Validating,
            event_id: 0,
            block_time: anchor.block_time,
            block_number: anchor.block_number,
            log_index: anchor.log_index,
            tx_hash: tx_id,
        })
    }
}
