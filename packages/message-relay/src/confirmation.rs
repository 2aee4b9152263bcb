//! Settles relays on the destination chain
//!
//! A Call is only final once the destination bridge has emitted the matching
//! Send. The pairing pass joins the two legs; the receipt pass catches
//! delivering transactions that reverted, which will never produce a Send.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clients::EvmChain;
use crate::hash::parse_bytes32;
use crate::ledger::Ledger;
use crate::metrics;
use crate::types::{ledger_int, SignatureStatus};

const BATCH_SIZE: i64 = 100;

pub struct Confirmer {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn EvmChain>,
    chain_id: u64,
    interval: Duration,
    label: String,
}

impl Confirmer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn EvmChain>,
        chain_id: u64,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            chain,
            chain_id,
            interval,
            label: chain_id.to_string(),
        }
    }

    /// Pair observed Send legs with their Calls. Returns how many settled.
    pub async fn settle_sends(&self) -> Result<usize> {
        let sends = self
            .ledger
            .pending_sends(ledger_int(self.chain_id, "chain id")?, BATCH_SIZE)
            .await?;

        let mut settled = 0;
        for send in &sends {
            if self.ledger.confirm_send(send).await? {
                info!(
                    from_chain_id = send.from_chain_id,
                    from_id = %send.from_id,
                    tx_hash = %send.tx_hash,
                    "Relay confirmed"
                );
                metrics::record_confirmed(&self.label);
                settled += 1;
            } else {
                debug!(from_id = %send.from_id, "Send observed before its Call, waiting");
            }
        }
        Ok(settled)
    }

    /// Mark reverted deliveries Failed. Returns how many were marked.
    pub async fn check_receipts(&self) -> Result<usize> {
        let broadcast = self
            .ledger
            .broadcast_signatures(ledger_int(self.chain_id, "chain id")?, BATCH_SIZE)
            .await?;

        let mut failed = 0;
        for signature in &broadcast {
            let tx_hash = match parse_bytes32(&signature.tx_hash) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(signature_id = signature.id, error = %e, "Stored tx hash is malformed");
                    continue;
                }
            };
            match self.chain.receipt_status(tx_hash).await {
                Ok(Some(false)) => {
                    if self
                        .ledger
                        .mark_signature(signature.id, SignatureStatus::Broadcast, SignatureStatus::Failed)
                        .await?
                    {
                        warn!(
                            signature_id = signature.id,
                            tx_hash = %signature.tx_hash,
                            nonce = signature.nonce,
                            "Destination transaction reverted"
                        );
                        metrics::record_failed_transaction(&self.label);
                        failed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(signature_id = signature.id, error = %e, "Failed to fetch receipt");
                }
            }
        }
        Ok(failed)
    }

    /// Run both passes every interval until shutdown
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(chain_id = self.chain_id, "Starting confirmation pass");

        let mut cycle_count: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(chain_id = self.chain_id, "Shutdown signal received, stopping confirmer");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            cycle_count += 1;
            if let Err(e) = self.settle_sends().await {
                warn!(chain_id = self.chain_id, error = %e, "Pairing pass failed");
                metrics::record_error(&self.label, "confirmation");
            }
            if let Err(e) = self.check_receipts().await {
                warn!(chain_id = self.chain_id, error = %e, "Receipt pass failed");
                metrics::record_error(&self.label, "receipt");
            }

            if cycle_count % 20 == 1 {
                info!(chain_id = self.chain_id, cycle = cycle_count, "Confirmer heartbeat");
            }
        }
    }
}
