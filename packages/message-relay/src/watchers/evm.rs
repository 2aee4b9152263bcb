use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;
use tracing::info;

use super::{log_skipped, WindowScanner};
use crate::clients::EvmChain;
use crate::feed::{BridgeEvent, Normalizer};
use crate::ledger::Ledger;

/// Ingests bridge `Call`/`Send` logs from one EVM chain
pub struct EvmWatcher {
    chain: Arc<dyn EvmChain>,
    ledger: Arc<dyn Ledger>,
    normalizer: Normalizer,
    bridge: Address,
    chain_id: i64,
    safe_block_number: u64,
}

impl EvmWatcher {
    pub fn new(
        chain: Arc<dyn EvmChain>,
        ledger: Arc<dyn Ledger>,
        normalizer: Normalizer,
        bridge: Address,
        chain_id: i64,
        safe_block_number: u64,
    ) -> Self {
        Self {
            chain,
            ledger,
            normalizer,
            bridge,
            chain_id,
            safe_block_number,
        }
    }
}

#[async_trait]
impl WindowScanner for EvmWatcher {
    async fn safe_head(&self) -> Result<u64> {
        let block = self.chain.block_number().await?;
        Ok(block.saturating_sub(self.safe_block_number))
    }

    async fn scan(&self, from_block: u64, to_block: u64) -> Result<usize> {
        let logs = self.chain.bridge_logs(self.bridge, from_block, to_block).await?;

        let mut inserted = 0;
        for log in &logs {
            let event = match BridgeEvent::from_log(self.chain_id, log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    let tx_hash = log.tx_hash.map(|h| format!("{:#x}", h)).unwrap_or_default();
                    log_skipped(self.chain_id, &tx_hash, &e);
                    continue;
                }
            };
            let Some(message) = self.normalizer.normalize(&event) else {
                continue;
            };

            if let Some(id) = self.ledger.insert_message(&message).await? {
                inserted += 1;
                info!(
                    chain_id = self.chain_id,
                    message_id = id,
                    message_type = %message.message_type,
                    tx_hash = %message.tx_hash,
                    log_index = message.log_index,
                    from_id = %message.from_id,
                    "New bridge message detected"
                );
            }
        }
        Ok(inserted)
    }
}
