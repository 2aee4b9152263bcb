use alloy::network::{ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};

use super::classify::broadcast_outcome;
use super::{BroadcastOutcome, DestinationCall, EvmChain, LogRecord};
use crate::encoding::BridgeEventKind;

/// JSON-RPC client for one EVM chain
pub struct AlloyEvmClient {
    provider: RootProvider<Http<Client>>,
    chain_id: u64,
}

impl AlloyEvmClient {
    pub fn new(rpc_url: &str, chain_id: u64) -> Result<Self> {
        let url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        Ok(Self { provider, chain_id })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

fn to_record(log: &Log) -> LogRecord {
    LogRecord {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.to_vec(),
        log_index: log.log_index,
        tx_hash: log.transaction_hash,
        block_number: log.block_number,
        block_timestamp: log.block_timestamp,
    }
}

#[async_trait]
impl EvmChain for AlloyEvmClient {
    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")
    }

    async fn receipt_logs(&self, tx_hash: B256) -> Result<Option<Vec<LogRecord>>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .wrap_err_with(|| format!("Failed to get receipt for {}", tx_hash))?;
        Ok(receipt.map(|r| r.inner.logs().iter().map(to_record).collect()))
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .wrap_err_with(|| format!("Failed to get receipt for {}", tx_hash))?;
        Ok(receipt.map(|r| r.status()))
    }

    async fn bridge_logs(
        &self,
        bridge: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogRecord>> {
        let filter = Filter::new()
            .address(bridge)
            .event_signature(vec![
                BridgeEventKind::Call.topic(),
                BridgeEventKind::Send.topic(),
            ])
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get logs")?;
        Ok(logs.iter().map(to_record).collect())
    }

    async fn gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .wrap_err("Failed to get gas price")
    }

    async fn estimate_gas(&self, call: &DestinationCall) -> Result<u64> {
        let request = TransactionRequest::default()
            .with_from(call.from)
            .with_to(call.to)
            .with_gas_price(call.gas_price)
            .with_input(Bytes::from(call.input.clone()));
        self.provider
            .estimate_gas(&request)
            .await
            .wrap_err("Failed to estimate gas")
    }

    async fn account_nonce(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .await
            .wrap_err_with(|| format!("Failed to get nonce for {}", address))
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<BroadcastOutcome> {
        match self.provider.send_raw_transaction(raw).await {
            Ok(pending) => {
                tracing::debug!(
                    chain_id = self.chain_id,
                    tx_hash = %pending.tx_hash(),
                    "Transaction accepted by node"
                );
                Ok(BroadcastOutcome::Accepted)
            }
            Err(e) => {
                let message = e.to_string();
                broadcast_outcome(&message).ok_or_else(|| {
                    eyre::eyre!("Failed to send raw transaction: {}", message)
                })
            }
        }
    }
}
