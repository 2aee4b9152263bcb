//! Proposer/validator wire protocol
//!
//! Newline-delimited JSON over one long-lived TCP stream per validator. Each
//! line is a [`Frame`] envelope whose `data` field holds the JSON-encoded
//! inner payload as a string.

use std::str::FromStr;

use alloy::primitives::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::db::models::Message;
use crate::eip712::SendTypedData;
use crate::hash::{decode_hex, parse_u256};

pub mod session;
pub mod transport;

pub use session::{ClaimError, ConnectionId, SessionRegistry, OUTBOUND_QUEUE};
pub use transport::{accept, connect, FramedStream};

/// Protocol id exchanged as the first line of every stream
pub const PROTOCOL_ID: &str = "/chat/1.0.0";

/// Upper bound for one frame line
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame type {0}")]
    UnknownKind(u8),
    #[error("expected a {expected:?} frame, got {actual:?}")]
    UnexpectedKind { expected: FrameKind, actual: FrameKind },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Frame type carried in the envelope's `message_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FrameKind {
    Login = 1,
    Proposal = 2,
    Sign = 3,
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Login),
            2 => Ok(FrameKind::Proposal),
            3 => Ok(FrameKind::Sign),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub message_type: FrameKind,
    pub data: String,
}

impl Frame {
    pub fn new<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self, FrameError> {
        Ok(Frame {
            message_type: kind,
            data: serde_json::to_string(payload)?,
        })
    }

    /// Parse one line
    pub fn decode(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the inner payload, checking the frame type first
    pub fn payload<T: DeserializeOwned>(&self, expected: FrameKind) -> Result<T, FrameError> {
        if self.message_type != expected {
            return Err(FrameError::UnexpectedKind {
                expected,
                actual: self.message_type,
            });
        }
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Validator login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub chain_id: u64,
    pub account: String,
    pub timestamp: u64,
    pub signature: String,
}

/// Message fields shared by proposals and the signatures sent back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFields {
    pub message_id: i64,
    /// EIP-712 domain chain id: the destination chain, where the signature
    /// is checked
    pub chain_id: i64,
    pub from_chain_id: i64,
    pub from_message_contract: String,
    pub from_id: String,
    pub from_sender: String,
    pub to_chain_id: i64,
    pub to_message_contract: String,
    pub to_contract_address: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalPayload {
    #[serde(flatten)]
    pub fields: MessageFields,
    pub tx_hash: String,
    pub log_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignPayload {
    #[serde(flatten)]
    pub fields: MessageFields,
    pub signature: String,
}

impl MessageFields {
    pub fn from_message(message: &Message) -> Self {
        MessageFields {
            message_id: message.id,
            chain_id: message.to_chain_id,
            from_chain_id: message.from_chain_id,
            from_message_contract: message.from_message_bridge.clone(),
            from_id: message.from_id.clone(),
            from_sender: message.from_sender.clone(),
            to_chain_id: message.to_chain_id,
            to_message_contract: message.to_message_bridge.clone(),
            to_contract_address: message.to_contract_address.clone(),
            data: message.to_bytes.clone(),
        }
    }

    /// Whether these fields describe `message` as stored
    pub fn matches(&self, message: &Message) -> bool {
        let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
        self.message_id == message.id
            && self.chain_id == message.to_chain_id
            && self.from_chain_id == message.from_chain_id
            && self.to_chain_id == message.to_chain_id
            && same(&self.from_message_contract, &message.from_message_bridge)
            && same(&self.from_id, &message.from_id)
            && same(&self.from_sender, &message.from_sender)
            && same(&self.to_message_contract, &message.to_message_bridge)
            && same(&self.to_contract_address, &message.to_contract_address)
            && same(&self.data, &message.to_bytes)
    }

    /// The typed data a validator signs for this message
    pub fn send_typed_data(&self) -> Result<SendTypedData, FrameError> {
        Ok(SendTypedData {
            chain_id: chain_id(self.chain_id, "chain_id")?,
            verifying_contract: address(&self.to_message_contract, "to_message_contract")?,
            from_chain_id: chain_id(self.from_chain_id, "from_chain_id")?,
            from_id: parse_u256(&self.from_id).map_err(|e| invalid("from_id", e))?,
            from_sender: address(&self.from_sender, "from_sender")?,
            to_chain_id: chain_id(self.to_chain_id, "to_chain_id")?,
            to_business_contract: address(&self.to_contract_address, "to_contract_address")?,
            to_message: decode_hex(&self.data).map_err(|e| invalid("data", e))?,
        })
    }
}

impl ProposalPayload {
    pub fn from_message(message: &Message) -> Self {
        ProposalPayload {
            fields: MessageFields::from_message(message),
            tx_hash: message.tx_hash.clone(),
            log_index: message.log_index,
        }
    }
}

fn invalid(field: &'static str, reason: impl ToString) -> FrameError {
    FrameError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn chain_id(value: i64, field: &'static str) -> Result<u64, FrameError> {
    u64::try_from(value).map_err(|_| invalid(field, "negative chain id"))
}

fn address(value: &str, field: &'static str) -> Result<Address, FrameError> {
    Address::from_str(value).map_err(|e| invalid(field, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_message;
    use serde_json::json;

    #[test]
    fn test_envelope_uses_numeric_type() {
        let login = LoginPayload {
            chain_id: 1,
            account: "0x1111111111111111111111111111111111111111".to_string(),
            timestamp: 1_700_000_000,
            signature: "0xabcd".to_string(),
        };
        let frame = Frame::new(FrameKind::Login, &login).unwrap();
        let encoded: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(encoded["message_type"], json!(1));
        assert!(encoded["data"].is_string());

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload::<LoginPayload>(FrameKind::Login).unwrap(), login);
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let err = Frame::decode(r#"{"message_type":9,"data":"{}"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown frame type 9"));
    }

    #[test]
    fn test_payload_checks_kind() {
        let frame = Frame {
            message_type: FrameKind::Sign,
            data: "{}".to_string(),
        };
        assert!(matches!(
            frame.payload::<LoginPayload>(FrameKind::Login),
            Err(FrameError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_proposal_fields_are_flat() {
        let message = sample_message();
        let proposal = ProposalPayload::from_message(&message);
        let value = serde_json::to_value(&proposal).unwrap();

        assert_eq!(value["message_id"], json!(message.id));
        // the destination chain, not the chain the row lives on
        assert_eq!(value["chain_id"], json!(2));
        assert_ne!(message.chain_id, 2);
        assert_eq!(value["from_message_contract"], json!(message.from_message_bridge));
        assert_eq!(value["data"], json!(message.to_bytes));
        assert_eq!(value["log_index"], json!(message.log_index));
        assert!(value.get("fields").is_none());
    }

    #[test]
    fn test_fields_match_ignores_hex_case() {
        let message = sample_message();
        let mut fields = MessageFields::from_message(&message);
        fields.from_sender = fields.from_sender.to_uppercase().replacen("0X", "0x", 1);
        assert!(fields.matches(&message));

        fields.data = "0x00".to_string();
        assert!(!fields.matches(&message));
    }

    #[test]
    fn test_fields_match_requires_destination_domain() {
        let message = sample_message();
        let mut fields = MessageFields::from_message(&message);
        fields.chain_id = message.chain_id;
        assert!(!fields.matches(&message));
    }

    #[test]
    fn test_domain_chain_id_comes_from_chain_id_field() {
        let message = sample_message();
        let mut fields = MessageFields::from_message(&message);
        fields.chain_id = 7;
        let typed = fields.send_typed_data().unwrap();
        assert_eq!(typed.chain_id, 7);
        assert_eq!(typed.to_chain_id, 2);
    }

    #[test]
    fn test_send_typed_data_from_fields() {
        let message = sample_message();
        let typed = MessageFields::from_message(&message).send_typed_data().unwrap();

        assert_eq!(typed.chain_id, 2);
        assert_eq!(typed.to_chain_id, 2);
        assert_eq!(typed.from_id, parse_u256(&message.from_id).unwrap());
        assert_eq!(typed.to_message, decode_hex(&message.to_bytes).unwrap());
    }
}
