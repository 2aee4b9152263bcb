use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{ChainType, MessageStatus, MessageType, SignatureStatus, SyncTaskStatus};

// Addresses, hashes and payloads are stored as 0x-prefixed lowercase hex
// strings. `from_id` is always the full 32-byte form.

/// A cross-chain message (one leg of a relay)
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Chain this row was observed on
    pub chain_id: i64,
    #[sqlx(try_from = "String")]
    pub message_type: MessageType,
    pub from_chain_id: i64,
    pub from_sender: String,
    pub from_message_bridge: String,
    pub from_id: String,
    pub to_chain_id: i64,
    pub to_message_bridge: String,
    pub to_contract_address: String,
    pub to_bytes: String,
    /// JSON array of the validator signatures used by the last build
    pub signatures: String,
    pub signatures_count: i32,
    #[sqlx(try_from = "String")]
    pub status: MessageStatus,
    pub event_id: i64,
    pub block_time: i64,
    pub block_number: i64,
    pub log_index: i64,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting new messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chain_id: i64,
    pub message_type: MessageType,
    pub from_chain_id: i64,
    pub from_sender: String,
    pub from_message_bridge: String,
    pub from_id: String,
    pub to_chain_id: i64,
    pub to_message_bridge: String,
    pub to_contract_address: String,
    pub to_bytes: String,
    pub signatures: String,
    pub status: MessageStatus,
    pub event_id: i64,
    pub block_time: i64,
    pub block_number: i64,
    pub log_index: i64,
    pub tx_hash: String,
}

/// One validator's attestation over a message
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MessageSignature {
    pub id: i64,
    pub message_id: i64,
    pub signer: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// A signed destination-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Signature {
    pub id: i64,
    pub chain_id: i64,
    /// `from_id` of the message this transaction delivers
    pub refer_id: String,
    #[sqlx(try_from = "String")]
    pub message_type: MessageType,
    pub address: String,
    pub nonce: i64,
    /// Calldata, hex without prefix
    pub data: String,
    pub value: String,
    /// Raw signed transaction, hex without prefix
    pub signature: String,
    #[sqlx(try_from = "String")]
    pub status: SignatureStatus,
    pub tx_hash: String,
    pub block_number: i64,
    pub block_time: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting new signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignature {
    pub chain_id: i64,
    pub refer_id: String,
    pub message_type: MessageType,
    pub address: String,
    pub nonce: i64,
    pub data: String,
    pub value: String,
    pub signature: String,
    pub status: SignatureStatus,
    pub tx_hash: String,
}

/// Per-chain ingestion cursor
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub chain_type: ChainType,
    pub chain_id: i64,
    /// Next block to scan
    pub latest_block: i64,
    pub latest_tx: i64,
    pub start_block: i64,
    /// Last block to scan; 0 follows the chain head forever
    pub end_block: i64,
    /// Blocks per scan window; 0 means unbounded
    pub handle_num: i64,
    #[sqlx(try_from = "String")]
    pub status: SyncTaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncTask {
    pub chain_type: ChainType,
    pub chain_id: i64,
    pub start_block: i64,
    pub end_block: i64,
    pub handle_num: i64,
}

impl SyncTask {
    /// Inclusive block window to scan next, given the highest final block.
    /// `None` when the cursor has caught up.
    pub fn next_window(&self, safe_head: u64) -> Option<(u64, u64)> {
        let start = self.latest_block.max(self.start_block).max(0) as u64;
        let mut end = safe_head;
        if self.handle_num > 0 {
            end = end.min(start.saturating_add(self.handle_num as u64 - 1));
        }
        if self.end_block > 0 {
            end = end.min(self.end_block as u64);
        }
        (start <= end).then_some((start, end))
    }

    /// Status after the cursor moves to `latest_block`
    pub fn status_after(&self, latest_block: i64) -> SyncTaskStatus {
        if self.end_block > 0 && latest_block > self.end_block {
            SyncTaskStatus::Done
        } else {
            SyncTaskStatus::Pending
        }
    }
}
