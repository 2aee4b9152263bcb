//! The message ledger
//!
//! Every role talks to persistent state through [`Ledger`]. Status changes are
//! compare-and-swap updates guarded on the expected current status, so roles
//! running in separate processes can race on the same rows safely.
//!
//! [`crate::db::PgLedger`] is the production implementation; [`MemoryLedger`]
//! keeps the same guards in process memory.

use async_trait::async_trait;
use eyre::Result;

use crate::db::models::{
    Message, MessageSignature, NewMessage, NewSyncTask, Signature, SyncTask,
};
use crate::types::{ChainType, MessageStatus, SignatureStatus, SyncTaskStatus};

pub mod memory;

pub use memory::MemoryLedger;

/// Outcome of recording a validator signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureInsert {
    Inserted,
    /// The signer already attested to this message; nothing changed
    Duplicate,
}

/// A transaction signed for the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Calldata, hex without prefix
    pub data: String,
    /// Raw signed transaction, hex without prefix
    pub raw: String,
    pub tx_hash: String,
}

/// Signs the destination transaction once the ledger has settled the nonce.
/// Called from inside the ledger transaction that persists the result.
#[async_trait]
pub trait TxAssembler: Send + Sync {
    /// Nonce reported by the destination chain for the leased account
    async fn chain_nonce(&self) -> Result<u64>;

    async fn sign(&self, nonce: u64) -> Result<SignedTransaction>;
}

/// Inputs to [`Ledger::commit_build`]
#[derive(Debug, Clone, Copy)]
pub struct BuildDraft<'a> {
    pub message: &'a Message,
    /// Leased account, lowercase 0x hex
    pub address: &'a str,
    /// JSON array of the validator signatures included in the call
    pub signatures_json: &'a str,
}

/// Build attempt rejected by the ledger
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("The current user has pending transactions: {address} nonce {nonce} is still {status}")]
    PendingNonce {
        address: String,
        nonce: i64,
        status: SignatureStatus,
    },
    #[error("message {0} is no longer pending")]
    MessageNotPending(i64),
}

/// Decide whether a new transaction may be signed for `address`, given the
/// latest non-invalid transaction already on record for it.
pub fn check_nonce_free(latest: Option<&Signature>, address: &str) -> Result<(), BuildError> {
    match latest {
        Some(signature) if signature.status.is_in_flight() => Err(BuildError::PendingNonce {
            address: address.to_string(),
            nonce: signature.nonce,
            status: signature.status,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a message; `None` when `(tx_hash, log_index)` already exists
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<i64>>;

    async fn get_message(&self, id: i64) -> Result<Option<Message>>;

    /// Call messages on `chain_id` still collecting signatures, fewest first
    async fn validating_calls(&self, chain_id: i64, weight: i32, limit: i64)
        -> Result<Vec<Message>>;

    /// Guarded `expected -> Invalid`
    async fn mark_message_invalid(&self, id: i64, expected: MessageStatus) -> Result<bool>;

    /// Record one validator signature and bump `signatures_count`, atomically
    async fn add_message_signature(
        &self,
        message_id: i64,
        signer: &str,
        signature: &str,
    ) -> Result<SignatureInsert>;

    /// Guarded `Validating -> Pending` for every call with enough signatures
    async fn promote_ready(&self, chain_id: i64, weight: i32) -> Result<u64>;

    /// Pending calls destined for `to_chain_id` that have reached `weight`
    async fn ready_calls(&self, to_chain_id: i64, weight: i32, limit: i64) -> Result<Vec<Message>>;

    /// Validator signatures for a message in insertion order
    async fn message_signatures(&self, message_id: i64) -> Result<Vec<MessageSignature>>;

    /// Resolve the nonce, sign, persist the `Signature` and flip the message
    /// `Pending -> Broadcast`, all in one transaction.
    ///
    /// Checks run in a fixed order before the assembler is called: an
    /// in-flight nonce on `address` fails with [`BuildError::PendingNonce`],
    /// then a message that left `Pending` fails with
    /// [`BuildError::MessageNotPending`].
    async fn commit_build(
        &self,
        draft: BuildDraft<'_>,
        assembler: &dyn TxAssembler,
    ) -> Result<Signature>;

    /// Pending transactions for `chain_id`, oldest first
    async fn pending_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>>;

    /// Broadcast transactions for `chain_id`, oldest first
    async fn broadcast_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>>;

    /// Guarded `expected -> next` on one transaction
    async fn mark_signature(
        &self,
        id: i64,
        expected: SignatureStatus,
        next: SignatureStatus,
    ) -> Result<bool>;

    /// Send messages observed on `to_chain_id` awaiting their paired call
    async fn pending_sends(&self, to_chain_id: i64, limit: i64) -> Result<Vec<Message>>;

    /// Settle a Send leg: the paired Call and the Send become Valid and the
    /// delivering transactions Success, in one transaction. Returns false when
    /// the Call has not been ingested yet.
    async fn confirm_send(&self, send: &Message) -> Result<bool>;

    /// Create the cursor for a chain if it has none
    async fn ensure_sync_task(&self, task: &NewSyncTask) -> Result<()>;

    async fn active_sync_tasks(&self, chain_type: ChainType, chain_id: i64)
        -> Result<Vec<SyncTask>>;

    async fn save_sync_progress(
        &self,
        id: i64,
        latest_block: i64,
        status: SyncTaskStatus,
    ) -> Result<()>;
}
