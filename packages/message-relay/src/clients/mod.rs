//! Chain and lookup-service clients
//!
//! Roles depend on the traits here, never on a concrete client, so tests can
//! substitute in-memory fakes.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::Result;

pub mod bitcoin;
pub mod classify;
pub mod evm;
pub mod particle;

pub use bitcoin::{BitcoinRpcClient, RawTransaction, ScriptPubKey, TxInput, TxOutput, UtxoBlock};
pub use classify::{classify_error, ErrorClass};
pub use evm::AlloyEvmClient;
pub use particle::ParticleClient;

/// A log as returned by a receipt or a log filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub log_index: Option<u64>,
    pub tx_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<u64>,
}

/// Unsigned destination call, for gas estimation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCall {
    pub from: Address,
    pub to: Address,
    pub gas_price: u128,
    pub input: Vec<u8>,
}

/// How the destination node answered a raw transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted,
    /// The node already has this exact transaction
    AlreadyKnown,
    /// The nonce was consumed, so the transaction (or its twin) already landed
    NonceTooLow,
    /// The node refused the transaction; worth retrying next tick
    Rejected(String),
}

impl BroadcastOutcome {
    /// Whether the transaction can be considered submitted
    pub fn is_landed(&self) -> bool {
        !matches!(self, BroadcastOutcome::Rejected(_))
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            BroadcastOutcome::Accepted => "accepted",
            BroadcastOutcome::AlreadyKnown => "already_known",
            BroadcastOutcome::NonceTooLow => "nonce_too_low",
            BroadcastOutcome::Rejected(_) => "rejected",
        }
    }
}

#[async_trait]
pub trait EvmChain: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// Logs of a mined transaction; `None` if the receipt does not exist (yet)
    async fn receipt_logs(&self, tx_hash: B256) -> Result<Option<Vec<LogRecord>>>;

    /// `Some(true)` for success, `Some(false)` for a revert
    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>>;

    /// `Call`/`Send` logs emitted by `bridge` in the inclusive block range
    async fn bridge_logs(&self, bridge: Address, from_block: u64, to_block: u64)
        -> Result<Vec<LogRecord>>;

    async fn gas_price(&self) -> Result<u128>;

    async fn estimate_gas(&self, call: &DestinationCall) -> Result<u64>;

    async fn account_nonce(&self, address: Address) -> Result<u64>;

    /// Submit a signed transaction. Transport failures are `Err`; anything the
    /// node actually answered is a [`BroadcastOutcome`].
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<BroadcastOutcome>;
}

#[async_trait]
pub trait UtxoChain: Send + Sync {
    async fn block_count(&self) -> Result<u64>;

    /// Verbose transaction; `None` when the node does not know it
    async fn raw_transaction(&self, txid: &str) -> Result<Option<RawTransaction>>;

    async fn block_at(&self, height: u64) -> Result<UtxoBlock>;
}

/// Maps a BTC depositor to the EVM smart account that receives the deposit
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// `None` when the address has no registered account
    async fn smart_account(&self, btc_address: &str) -> Result<Option<Address>>;
}
