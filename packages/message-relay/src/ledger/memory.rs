//! In-process [`Ledger`] with the same guarded transitions as Postgres.
//! Used by tests and by single-process deployments without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use tokio::sync::Mutex;

use super::{
    check_nonce_free, BuildDraft, BuildError, Ledger, SignatureInsert, TxAssembler,
};
use crate::db::models::{
    Message, MessageSignature, NewMessage, NewSyncTask, Signature, SyncTask,
};
use crate::types::{
    ledger_int, ChainType, MessageStatus, MessageType, SignatureStatus, SyncTaskStatus,
};

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    message_signatures: Vec<MessageSignature>,
    signatures: Vec<Signature>,
    sync_tasks: Vec<SyncTask>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn message_mut(&mut self, id: i64) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored transaction, in insertion order
    pub async fn all_signatures(&self) -> Vec<Signature> {
        self.state.lock().await.signatures.clone()
    }
}

fn limit_to_usize(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        if state
            .messages
            .iter()
            .any(|m| m.tx_hash == message.tx_hash && m.log_index == message.log_index)
        {
            return Ok(None);
        }

        let id = state.next_id();
        let now = Utc::now();
        state.messages.push(Message {
            id,
            chain_id: message.chain_id,
            message_type: message.message_type,
            from_chain_id: message.from_chain_id,
            from_sender: message.from_sender.clone(),
            from_message_bridge: message.from_message_bridge.clone(),
            from_id: message.from_id.clone(),
            to_chain_id: message.to_chain_id,
            to_message_bridge: message.to_message_bridge.clone(),
            to_contract_address: message.to_contract_address.clone(),
            to_bytes: message.to_bytes.clone(),
            signatures: message.signatures.clone(),
            signatures_count: 0,
            status: message.status,
            event_id: message.event_id,
            block_time: message.block_time,
            block_number: message.block_number,
            log_index: message.log_index,
            tx_hash: message.tx_hash.clone(),
            created_at: now,
            updated_at: now,
        });
        Ok(Some(id))
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn validating_calls(&self, chain_id: i64, weight: i32, limit: i64) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut found: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| {
                m.chain_id == chain_id
                    && m.message_type == MessageType::Call
                    && m.status == MessageStatus::Validating
                    && m.signatures_count < weight
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.signatures_count, m.id));
        found.truncate(limit_to_usize(limit));
        Ok(found)
    }

    async fn mark_message_invalid(&self, id: i64, expected: MessageStatus) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.message_mut(id) {
            Some(message) if message.status == expected => {
                message.status = MessageStatus::Invalid;
                message.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_message_signature(
        &self,
        message_id: i64,
        signer: &str,
        signature: &str,
    ) -> Result<SignatureInsert> {
        let mut state = self.state.lock().await;
        if state
            .message_signatures
            .iter()
            .any(|s| s.message_id == message_id && s.signer == signer)
        {
            return Ok(SignatureInsert::Duplicate);
        }

        let message = state
            .message_mut(message_id)
            .ok_or_else(|| eyre!("message {} not found", message_id))?;
        message.signatures_count += 1;
        message.updated_at = Utc::now();

        let id = state.next_id();
        state.message_signatures.push(MessageSignature {
            id,
            message_id,
            signer: signer.to_string(),
            signature: signature.to_string(),
            created_at: Utc::now(),
        });
        Ok(SignatureInsert::Inserted)
    }

    async fn promote_ready(&self, chain_id: i64, weight: i32) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut promoted = 0;
        for message in state.messages.iter_mut().filter(|m| {
            m.chain_id == chain_id
                && m.message_type == MessageType::Call
                && m.status == MessageStatus::Validating
                && m.signatures_count >= weight
        }) {
            message.status = MessageStatus::Pending;
            message.updated_at = Utc::now();
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn ready_calls(&self, to_chain_id: i64, weight: i32, limit: i64) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                m.to_chain_id == to_chain_id
                    && m.message_type == MessageType::Call
                    && m.signatures_count >= weight
                    && m.status == MessageStatus::Pending
            })
            .take(limit_to_usize(limit))
            .cloned()
            .collect())
    }

    async fn message_signatures(&self, message_id: i64) -> Result<Vec<MessageSignature>> {
        let state = self.state.lock().await;
        Ok(state
            .message_signatures
            .iter()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn commit_build(
        &self,
        draft: BuildDraft<'_>,
        assembler: &dyn TxAssembler,
    ) -> Result<Signature> {
        // held across the assembler calls, like the row locks in Postgres
        let mut state = self.state.lock().await;
        let message = draft.message;

        let latest = state
            .signatures
            .iter()
            .filter(|s| s.address == draft.address && s.status != SignatureStatus::Invalid)
            .max_by_key(|s| s.nonce);
        check_nonce_free(latest, draft.address)?;

        match state.messages.iter().find(|m| m.id == message.id) {
            Some(current) if current.status == MessageStatus::Pending => {}
            _ => return Err(BuildError::MessageNotPending(message.id).into()),
        }

        let nonce = assembler.chain_nonce().await?;
        let signed = assembler.sign(nonce).await?;
        let nonce = ledger_int(nonce, "nonce")?;

        if state.signatures.iter().any(|s| {
            s.address == draft.address && s.nonce == nonce && s.status != SignatureStatus::Invalid
        }) {
            return Err(eyre!(
                "duplicate live transaction for {} nonce {}",
                draft.address,
                nonce
            ));
        }

        let now = Utc::now();
        let id = state.next_id();
        let signature = Signature {
            id,
            chain_id: message.to_chain_id,
            refer_id: message.from_id.clone(),
            message_type: MessageType::Send,
            address: draft.address.to_string(),
            nonce,
            data: signed.data,
            value: "0".to_string(),
            signature: signed.raw,
            status: SignatureStatus::Pending,
            tx_hash: signed.tx_hash,
            block_number: 0,
            block_time: 0,
            created_at: now,
            updated_at: now,
        };
        state.signatures.push(signature.clone());

        if let Some(current) = state.message_mut(message.id) {
            current.status = MessageStatus::Broadcast;
            current.signatures = draft.signatures_json.to_string();
            current.updated_at = now;
        }
        Ok(signature)
    }

    async fn pending_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>> {
        Ok(self.signatures_with_status(chain_id, SignatureStatus::Pending, limit).await)
    }

    async fn broadcast_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>> {
        Ok(self.signatures_with_status(chain_id, SignatureStatus::Broadcast, limit).await)
    }

    async fn mark_signature(
        &self,
        id: i64,
        expected: SignatureStatus,
        next: SignatureStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.signatures.iter_mut().find(|s| s.id == id) {
            Some(signature) if signature.status == expected => {
                signature.status = next;
                signature.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_sends(&self, to_chain_id: i64, limit: i64) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                m.to_chain_id == to_chain_id
                    && m.message_type == MessageType::Send
                    && m.status == MessageStatus::Pending
            })
            .take(limit_to_usize(limit))
            .cloned()
            .collect())
    }

    async fn confirm_send(&self, send: &Message) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(call) = state.messages.iter_mut().find(|m| {
            m.message_type == MessageType::Call
                && m.from_chain_id == send.from_chain_id
                && m.from_id == send.from_id
        }) else {
            return Ok(false);
        };
        if call.status == MessageStatus::Broadcast {
            call.status = MessageStatus::Valid;
            call.updated_at = now;
        }

        let mut confirmed = false;
        if let Some(current) = state.message_mut(send.id) {
            if current.status == MessageStatus::Pending {
                current.status = MessageStatus::Valid;
                current.updated_at = now;
                confirmed = true;
            }
        }

        for signature in state.signatures.iter_mut().filter(|s| {
            s.chain_id == send.chain_id && s.refer_id == send.from_id && s.status.is_in_flight()
        }) {
            signature.status = SignatureStatus::Success;
            signature.block_number = send.block_number;
            signature.block_time = send.block_time;
            signature.updated_at = now;
        }
        Ok(confirmed)
    }

    async fn ensure_sync_task(&self, task: &NewSyncTask) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .sync_tasks
            .iter()
            .any(|t| t.chain_type == task.chain_type && t.chain_id == task.chain_id)
        {
            return Ok(());
        }

        let id = state.next_id();
        let now = Utc::now();
        state.sync_tasks.push(SyncTask {
            id,
            chain_type: task.chain_type,
            chain_id: task.chain_id,
            latest_block: task.start_block,
            latest_tx: 0,
            start_block: task.start_block,
            end_block: task.end_block,
            handle_num: task.handle_num,
            status: SyncTaskStatus::Pending,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    async fn active_sync_tasks(&self, chain_type: ChainType, chain_id: i64) -> Result<Vec<SyncTask>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_tasks
            .iter()
            .filter(|t| {
                t.chain_type == chain_type
                    && t.chain_id == chain_id
                    && t.status == SyncTaskStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn save_sync_progress(&self, id: i64, latest_block: i64, status: SyncTaskStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state
            .sync_tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| eyre!("sync task {} not found", id))?;
        task.latest_block = latest_block;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }
}

impl MemoryLedger {
    async fn signatures_with_status(
        &self,
        chain_id: i64,
        status: SignatureStatus,
        limit: i64,
    ) -> Vec<Signature> {
        let state = self.state.lock().await;
        state
            .signatures
            .iter()
            .filter(|s| s.chain_id == chain_id && s.status == status)
            .take(limit_to_usize(limit))
            .cloned()
            .collect()
    }
}
