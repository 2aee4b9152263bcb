//! In-memory chain fakes and fixtures for unit tests

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use tokio::sync::Mutex;

use crate::clients::{
    BroadcastOutcome, DestinationCall, EvmChain, LogRecord, RawTransaction, ScriptPubKey,
    TxInput, TxOutput, UtxoBlock, UtxoChain,
};
use crate::db::models::{Message, NewMessage};
use crate::encoding::BridgeEventKind;
use crate::hash::{decode_hex, parse_bytes32, parse_u256};
use crate::types::{MessageStatus, MessageType};
use crate::verification::{ProofClaim, SourceProof};

pub const LISTEN_ADDRESS: &str = "tb1qlisten";
pub const FUNDING_TXID: &str = "cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";
pub const DEPOSIT_TXID: &str = "abababababababababababababababababababababababababababababababab";

/// A Call message from chain 1 to chain 2, as ingested
pub fn sample_message() -> Message {
    Message {
        id: 1,
        chain_id: 1,
        message_type: MessageType::Call,
        from_chain_id: 1,
        from_sender: "0x1111111111111111111111111111111111111111".to_string(),
        from_message_bridge: "0x2222222222222222222222222222222222222222".to_string(),
        from_id: format!("0x{:064x}", 42),
        to_chain_id: 2,
        to_message_bridge: "0x3333333333333333333333333333333333333333".to_string(),
        to_contract_address: "0x4444444444444444444444444444444444444444".to_string(),
        to_bytes: "0xdeadbeef".to_string(),
        signatures: "[]".to_string(),
        signatures_count: 0,
        status: MessageStatus::Validating,
        event_id: 0,
        block_time: 1_700_000_000,
        block_number: 10,
        log_index: 3,
        tx_hash: format!("0x{}", "aa".repeat(32)),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Insertable form of a fixture message
pub fn new_message(message: &Message) -> NewMessage {
    NewMessage {
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
        status: message.status,
        event_id: message.event_id,
        block_time: message.block_time,
        block_number: message.block_number,
        log_index: message.log_index,
        tx_hash: message.tx_hash.clone(),
    }
}

/// The bridge `Call` log that `message` was ingested from
pub fn call_log(message: &Message) -> LogRecord {
    let data = (
        U256::from(message.from_chain_id as u64),
        parse_u256(&message.from_id).unwrap(),
        Address::from_str(&message.from_sender).unwrap(),
        U256::from(message.to_chain_id as u64),
        Address::from_str(&message.to_contract_address).unwrap(),
        Bytes::from(decode_hex(&message.to_bytes).unwrap()),
    )
        .abi_encode_params();
    LogRecord {
        address: Address::from_str(&message.from_message_bridge).unwrap(),
        topics: vec![BridgeEventKind::Call.topic()],
        data,
        log_index: Some(message.log_index as u64),
        tx_hash: Some(parse_bytes32(&message.tx_hash).unwrap()),
        block_number: Some(message.block_number as u64),
        block_timestamp: Some(message.block_time as u64),
    }
}

#[derive(Default)]
struct EvmState {
    block_number: u64,
    receipts: HashMap<B256, Vec<LogRecord>>,
    statuses: HashMap<B256, bool>,
    bridge_logs: Vec<LogRecord>,
    gas_price: u128,
    nonces: HashMap<Address, u64>,
    broadcast_results: VecDeque<Result<BroadcastOutcome, String>>,
    sent: Vec<Vec<u8>>,
}

/// Scriptable [`EvmChain`]
#[derive(Default)]
pub struct FakeEvmChain {
    state: Mutex<EvmState>,
}

impl FakeEvmChain {
    pub async fn set_block_number(&self, block: u64) {
        self.state.lock().await.block_number = block;
    }

    pub async fn set_receipt(&self, tx_hash: B256, logs: Vec<LogRecord>) {
        self.state.lock().await.receipts.insert(tx_hash, logs);
    }

    pub async fn set_status(&self, tx_hash: B256, success: bool) {
        self.state.lock().await.statuses.insert(tx_hash, success);
    }

    pub async fn push_bridge_log(&self, log: LogRecord) {
        self.state.lock().await.bridge_logs.push(log);
    }

    pub async fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().await.nonces.insert(address, nonce);
    }

    /// Queue the node's answer to the next broadcast; `Err` is a transport failure
    pub async fn push_broadcast_result(&self, result: Result<BroadcastOutcome, String>) {
        self.state.lock().await.broadcast_results.push_back(result);
    }

    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl EvmChain for FakeEvmChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.state.lock().await.block_number)
    }

    async fn receipt_logs(&self, tx_hash: B256) -> Result<Option<Vec<LogRecord>>> {
        Ok(self.state.lock().await.receipts.get(&tx_hash).cloned())
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        Ok(self.state.lock().await.statuses.get(&tx_hash).copied())
    }

    async fn bridge_logs(
        &self,
        bridge: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .bridge_logs
            .iter()
            .filter(|log| log.address == bridge)
            .filter(|log| {
                log.block_number
                    .is_some_and(|b| (from_block..=to_block).contains(&b))
            })
            .cloned()
            .collect())
    }

    async fn gas_price(&self) -> Result<u128> {
        let price = self.state.lock().await.gas_price;
        Ok(if price == 0 { 1_000_000_000 } else { price })
    }

    async fn estimate_gas(&self, _call: &DestinationCall) -> Result<u64> {
        Ok(210_000)
    }

    async fn account_nonce(&self, address: Address) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .await
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<BroadcastOutcome> {
        let mut state = self.state.lock().await;
        state.sent.push(raw.to_vec());
        match state.broadcast_results.pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => Err(eyre!(e)),
            None => Ok(BroadcastOutcome::Accepted),
        }
    }
}

#[derive(Default)]
struct UtxoState {
    txs: HashMap<String, RawTransaction>,
    blocks: Vec<UtxoBlock>,
}

/// Scriptable [`UtxoChain`]
#[derive(Default)]
pub struct FakeUtxoChain {
    state: Mutex<UtxoState>,
}

impl FakeUtxoChain {
    pub async fn insert(&self, tx: RawTransaction) {
        self.state.lock().await.txs.insert(tx.txid.clone(), tx);
    }

    pub async fn push_block(&self, block: UtxoBlock) {
        let mut state = self.state.lock().await;
        for tx in &block.tx {
            state.txs.entry(tx.txid.clone()).or_insert_with(|| tx.clone());
        }
        state.blocks.push(block);
    }
}

#[async_trait]
impl UtxoChain for FakeUtxoChain {
    async fn block_count(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.blocks.iter().map(|b| b.height).max().unwrap_or_default())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Option<RawTransaction>> {
        let txid = txid.trim_start_matches("0x");
        Ok(self.state.lock().await.txs.get(txid).cloned())
    }

    async fn block_at(&self, height: u64) -> Result<UtxoBlock> {
        let state = self.state.lock().await;
        state
            .blocks
            .iter()
            .find(|b| b.height == height)
            .cloned()
            .ok_or_else(|| eyre!("no block at {}", height))
    }
}

fn output(n: u32, satoshis: u64, address: &str) -> TxOutput {
    TxOutput {
        value: satoshis as f64 / 100_000_000.0,
        n,
        script_pub_key: ScriptPubKey {
            hex: "0014".to_string(),
            kind: "witness_v0_keyhash".to_string(),
            address: Some(address.to_string()),
            addresses: vec![],
        },
    }
}

/// The transaction whose first output funded [`deposit_tx`]
pub fn funding_tx(depositor: &str) -> RawTransaction {
    RawTransaction {
        txid: FUNDING_TXID.to_string(),
        vin: vec![TxInput {
            txid: None,
            vout: None,
            coinbase: Some("03abcdef".to_string()),
        }],
        vout: vec![output(0, 1_000_000, depositor)],
    }
}

/// A deposit of `satoshis` to [`LISTEN_ADDRESS`] with change going back
pub fn deposit_tx(satoshis: u64) -> RawTransaction {
    RawTransaction {
        txid: DEPOSIT_TXID.to_string(),
        vin: vec![TxInput {
            txid: Some(FUNDING_TXID.to_string()),
            vout: Some(0),
            coinbase: None,
        }],
        vout: vec![
            output(0, satoshis, LISTEN_ADDRESS),
            output(1, 1_000, "tb1qchange"),
        ],
    }
}

/// `OP_RETURN <push> <text>`
pub fn op_return_output(text: &str) -> TxOutput {
    let mut script = vec![0x6a, text.len() as u8];
    script.extend_from_slice(text.as_bytes());
    TxOutput {
        value: 0.0,
        n: 9,
        script_pub_key: ScriptPubKey {
            hex: hex::encode(script),
            kind: "nulldata".to_string(),
            address: None,
            addresses: vec![],
        },
    }
}

/// Proof check with a fixed answer that counts its calls
pub struct StaticProof {
    answer: Result<bool, String>,
    calls: AtomicUsize,
}

impl StaticProof {
    pub fn valid() -> Self {
        Self::with(Ok(true))
    }

    pub fn invalid() -> Self {
        Self::with(Ok(false))
    }

    pub fn failing(error: &str) -> Self {
        Self::with(Err(error.to_string()))
    }

    fn with(answer: Result<bool, String>) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProof for StaticProof {
    async fn verify(&self, _claim: &ProofClaim) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(|e| eyre!(e))
    }
}
