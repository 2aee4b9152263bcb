use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, info};

use super::WindowScanner;
use crate::clients::{AccountResolver, UtxoChain};
use crate::feed::{BridgeEvent, EventAnchor, Normalizer};
use crate::hash::bytes32_to_hex;
use crate::ledger::Ledger;
use crate::verification::inspect_deposit;
use crate::types::ledger_int;
use crate::verification::utxo::paid_to;

/// Ingests deposits to the listen address of one UTXO chain
pub struct UtxoWatcher {
    chain: Arc<dyn UtxoChain>,
    resolver: Arc<dyn AccountResolver>,
    ledger: Arc<dyn Ledger>,
    normalizer: Normalizer,
    listen_address: String,
    chain_id: i64,
    safe_block_number: u64,
}

impl UtxoWatcher {
    pub fn new(
        chain: Arc<dyn UtxoChain>,
        resolver: Arc<dyn AccountResolver>,
        ledger: Arc<dyn Ledger>,
        normalizer: Normalizer,
        listen_address: String,
        chain_id: i64,
        safe_block_number: u64,
    ) -> Self {
        Self {
            chain,
            resolver,
            ledger,
            normalizer,
            listen_address,
            chain_id,
            safe_block_number,
        }
    }
}

#[async_trait]
impl WindowScanner for UtxoWatcher {
    async fn safe_head(&self) -> Result<u64> {
        let count = self.chain.block_count().await?;
        Ok(count.saturating_sub(self.safe_block_number))
    }

    async fn scan(&self, from_block: u64, to_block: u64) -> Result<usize> {
        let mut inserted = 0;
        for height in from_block..=to_block {
            let block = self.chain.block_at(height).await?;

            for (index, tx) in block.tx.iter().enumerate() {
                if paid_to(tx, &self.listen_address) == 0 {
                    continue;
                }
                let deposit = inspect_deposit(
                    self.chain.as_ref(),
                    self.resolver.as_ref(),
                    &self.listen_address,
                    tx,
                )
                .await?;
                let Some(deposit) = deposit else {
                    debug!(
                        chain_id = self.chain_id,
                        txid = %tx.txid,
                        "Depositor has no destination account, skipping"
                    );
                    continue;
                };

                let event = BridgeEvent::Deposit {
                    anchor: EventAnchor {
                        chain_id: self.chain_id,
                        block_number: ledger_int(height, "block height")?,
                        block_time: ledger_int(block.time, "block time")?,
                        log_index: ledger_int(index as u64, "transaction index")?,
                        tx_hash: bytes32_to_hex(&deposit.tx_id.0),
                    },
                    deposit,
                };
                let Some(message) = self.normalizer.normalize(&event) else {
                    continue;
                };

                if let Some(id) = self.ledger.insert_message(&message).await? {
                    inserted += 1;
                    info!(
                        chain_id = self.chain_id,
                        message_id = id,
                        txid = %tx.txid,
                        block = height,
                        "New deposit detected"
                    );
                }
            }
        }
        Ok(inserted)
    }
}
