//! Builder: turns threshold-signed Calls into destination-chain transactions
//!
//! Two loops per destination chain. The build loop signs one transaction per
//! Pending message and stores it in the same ledger transaction that moves
//! the message to Broadcast. The broadcast loop pushes every Pending
//! transaction to the node until the node has it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients::{BroadcastOutcome, DestinationCall, EvmChain};
use crate::db::models::{Message, Signature};
use crate::encoding::{encode_send_call, SendCall};
use crate::hash::{decode_hex, parse_u256};
use crate::ledger::{BuildDraft, BuildError, Ledger, SignedTransaction, TxAssembler};
use crate::metrics;
use crate::types::{ledger_int, SignatureStatus};

pub mod accounts;

pub use accounts::{Account, AccountLease, AccountPool, LeaseError};

const BUILD_BATCH_SIZE: i64 = 10;
const BROADCAST_BATCH_SIZE: i64 = 100;
const BROADCAST_CONCURRENCY: usize = 16;

/// Signs the destination call once the ledger hands over the nonce
struct DestinationTx<'a> {
    chain: &'a dyn EvmChain,
    account: &'a Account,
    to: Address,
    input: Bytes,
    gas_price: u128,
    gas_limit: u64,
    chain_id: u64,
}

#[async_trait]
impl TxAssembler for DestinationTx<'_> {
    async fn chain_nonce(&self) -> Result<u64> {
        self.chain.account_nonce(self.account.address).await
    }

    async fn sign(&self, nonce: u64) -> Result<SignedTransaction> {
        let request = TransactionRequest::default()
            .with_from(self.account.address)
            .with_to(self.to)
            .with_input(self.input.clone())
            .with_value(U256::ZERO)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id)
            .with_gas_price(self.gas_price)
            .with_gas_limit(self.gas_limit);

        let envelope = request
            .build(&self.account.wallet)
            .await
            .map_err(|e| eyre!("Failed to sign transaction: {}", e))?;

        Ok(SignedTransaction {
            data: hex::encode(&self.input),
            raw: hex::encode(envelope.encoded_2718()),
            tx_hash: format!("{:#x}", envelope.tx_hash()),
        })
    }
}

/// The `send(...)` calldata for a message and its collected signatures
pub fn send_calldata(message: &Message, signatures: &[String]) -> Result<Vec<u8>> {
    let from_chain_id =
        u64::try_from(message.from_chain_id).wrap_err("from_chain_id is negative")?;
    let from_id = parse_u256(&message.from_id).wrap_err("Invalid from_id")?;
    let from_sender = Address::from_str(&message.from_sender).wrap_err("Invalid from_sender")?;
    let contract_address = Address::from_str(&message.to_contract_address)
        .wrap_err("Invalid to_contract_address")?;
    let payload = decode_hex(&message.to_bytes).wrap_err("Invalid to_bytes")?;
    let signatures = signatures
        .iter()
        .map(|s| decode_hex(s).wrap_err("Invalid validator signature"))
        .collect::<Result<Vec<_>>>()?;

    Ok(encode_send_call(&SendCall {
        from_chain_id,
        from_id,
        from_sender,
        contract_address,
        payload: &payload,
        signatures: &signatures,
    }))
}

pub struct Builder {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn EvmChain>,
    accounts: AccountPool,
    chain_id: u64,
    weight: i32,
    interval: Duration,
    label: String,
}

impl Builder {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn EvmChain>,
        accounts: AccountPool,
        chain_id: u64,
        weight: i32,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            chain,
            accounts,
            chain_id,
            weight,
            interval,
            label: chain_id.to_string(),
        }
    }

    /// Sign and persist the destination transaction for one Pending message
    pub async fn build_message(&self, message: &Message) -> Result<Signature> {
        let account = self.accounts.borrow()?;
        let address = account.ledger_address();
        debug!(message_id = message.id, account = %address, "Leased builder account");

        let gas_price = self.chain.gas_price().await?;
        let signatures: Vec<String> = self
            .ledger
            .message_signatures(message.id)
            .await?
            .into_iter()
            .map(|s| s.signature)
            .collect();

        let input = send_calldata(message, &signatures)?;
        let to = Address::from_str(&message.to_message_bridge)
            .wrap_err("Invalid to_message_bridge")?;
        let gas_limit = self
            .chain
            .estimate_gas(&DestinationCall {
                from: account.address,
                to,
                gas_price,
                input: input.clone(),
            })
            .await
            .wrap_err("Failed to estimate gas")?;

        let assembler = DestinationTx {
            chain: self.chain.as_ref(),
            account: &*account,
            to,
            input: Bytes::from(input),
            gas_price,
            gas_limit,
            chain_id: self.chain_id,
        };
        let signatures_json = serde_json::to_string(&signatures)?;
        let signature = self
            .ledger
            .commit_build(
                BuildDraft {
                    message,
                    address: &address,
                    signatures_json: &signatures_json,
                },
                &assembler,
            )
            .await?;

        info!(
            message_id = message.id,
            account = %address,
            nonce = signature.nonce,
            tx_hash = %signature.tx_hash,
            gas_limit,
            "Built destination transaction"
        );
        Ok(signature)
    }

    /// Build every ready message, one at a time. Returns how many were built.
    pub async fn build_ready(&self) -> Result<usize> {
        let messages = self
            .ledger
            .ready_calls(ledger_int(self.chain_id, "chain id")?, self.weight, BUILD_BATCH_SIZE)
            .await?;

        let mut built = 0;
        for message in &messages {
            match self.build_message(message).await {
                Ok(_) => {
                    built += 1;
                    metrics::record_build(&self.label, true);
                }
                Err(e) if is_contention(&e) => {
                    warn!(message_id = message.id, error = %e, "Build deferred");
                }
                Err(e) => {
                    error!(message_id = message.id, error = %e, "Build failed");
                    metrics::record_build(&self.label, false);
                }
            }
        }
        Ok(built)
    }

    async fn broadcast_one(&self, signature: &Signature) -> Result<BroadcastOutcome> {
        let raw = decode_hex(&signature.signature).wrap_err("Stored transaction is not hex")?;
        let outcome = self.chain.send_raw_transaction(&raw).await?;
        if outcome.is_landed() {
            self.ledger
                .mark_signature(signature.id, SignatureStatus::Pending, SignatureStatus::Broadcast)
                .await?;
        }
        Ok(outcome)
    }

    /// Push every Pending transaction concurrently. Returns how many landed.
    pub async fn broadcast_pending(&self) -> Result<usize> {
        let signatures = self
            .ledger
            .pending_signatures(ledger_int(self.chain_id, "chain id")?, BROADCAST_BATCH_SIZE)
            .await?;
        if signatures.is_empty() {
            return Ok(0);
        }

        let results: Vec<(i64, String, Result<BroadcastOutcome>)> = stream::iter(signatures)
            .map(|signature| async move {
                let result = self.broadcast_one(&signature).await;
                (signature.id, signature.tx_hash, result)
            })
            .buffer_unordered(BROADCAST_CONCURRENCY)
            .collect()
            .await;

        let mut landed = 0;
        for (id, tx_hash, result) in results {
            match result {
                Ok(outcome) => {
                    metrics::record_broadcast(&self.label, outcome.as_label());
                    match outcome {
                        BroadcastOutcome::Rejected(reason) => {
                            warn!(signature_id = id, tx_hash = %tx_hash, reason = %reason, "Broadcast rejected, will retry");
                        }
                        outcome => {
                            debug!(signature_id = id, tx_hash = %tx_hash, outcome = outcome.as_label(), "Transaction broadcast");
                            landed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(signature_id = id, tx_hash = %tx_hash, error = %e, "Broadcast failed, will retry");
                    metrics::record_error(&self.label, "broadcast");
                }
            }
        }
        Ok(landed)
    }

    async fn build_loop(&self) {
        let mut cycle_count: u64 = 0;
        loop {
            tokio::time::sleep(self.interval).await;
            cycle_count += 1;
            match self.build_ready().await {
                Ok(built) if built > 0 => info!(chain_id = self.chain_id, built, "Build round complete"),
                Ok(_) => {}
                Err(e) => {
                    error!(chain_id = self.chain_id, error = %e, "Build round failed");
                    metrics::record_error(&self.label, "build");
                }
            }
            if cycle_count % 20 == 1 {
                info!(chain_id = self.chain_id, cycle = cycle_count, accounts = self.accounts.len(), "Builder heartbeat");
            }
        }
    }

    async fn broadcast_loop(&self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.broadcast_pending().await {
                error!(chain_id = self.chain_id, error = %e, "Broadcast round failed");
                metrics::record_error(&self.label, "broadcast");
            }
        }
    }

    /// Run both loops until shutdown
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            chain_id = self.chain_id,
            weight = self.weight,
            accounts = self.accounts.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting builder"
        );

        tokio::select! {
            _ = shutdown.recv() => {
                info!(chain_id = self.chain_id, "Shutdown signal received, stopping builder");
            }
            _ = self.build_loop() => {}
            _ = self.broadcast_loop() => {}
        }
        Ok(())
    }
}

/// Lease and nonce conflicts clear up on their own; retry next tick
fn is_contention(error: &eyre::Report) -> bool {
    error.downcast_ref::<LeaseError>().is_some() || error.downcast_ref::<BuildError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::testing::{new_message, sample_message, FakeEvmChain};
    use crate::types::MessageStatus;
    use alloy::signers::local::PrivateKeySigner;

    struct Harness {
        builder: Builder,
        ledger: Arc<MemoryLedger>,
        chain: Arc<FakeEvmChain>,
        address: Address,
    }

    fn harness() -> Harness {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        let ledger = Arc::new(MemoryLedger::new());
        let chain = Arc::new(FakeEvmChain::default());
        let builder = Builder::new(
            ledger.clone(),
            chain.clone(),
            AccountPool::new(vec![signer]).unwrap(),
            2,
            2,
            Duration::from_millis(10),
        );
        Harness {
            builder,
            ledger,
            chain,
            address,
        }
    }

    /// Insert the fixture Call with two validator signatures and promote it
    async fn ready_message(h: &Harness, tx_byte: u8) -> Message {
        let mut message = sample_message();
        message.tx_hash = format!("0x{}", hex::encode([tx_byte; 32]));
        let id = h
            .ledger
            .insert_message(&new_message(&message))
            .await
            .unwrap()
            .unwrap();
        for (signer, signature) in [("0xv1", "0x01"), ("0xv2", "0x02")] {
            h.ledger.add_message_signature(id, signer, signature).await.unwrap();
        }
        h.ledger.promote_ready(1, 2).await.unwrap();
        h.ledger.get_message(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_build_stores_transaction_and_flips_message() {
        let h = harness();
        h.chain.set_nonce(h.address, 7).await;
        let message = ready_message(&h, 0xaa).await;

        assert_eq!(h.builder.build_ready().await.unwrap(), 1);

        let stored = h.ledger.all_signatures().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].nonce, 7);
        assert_eq!(stored[0].chain_id, 2);
        assert_eq!(stored[0].refer_id, message.from_id);
        assert_eq!(stored[0].address, format!("{:#x}", h.address));
        assert_eq!(stored[0].status, SignatureStatus::Pending);
        assert_eq!(
            stored[0].data,
            hex::encode(send_calldata(&message, &["0x01".to_string(), "0x02".to_string()]).unwrap())
        );

        let message = h.ledger.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Broadcast);
        assert_eq!(message.signatures, r#"["0x01","0x02"]"#);
    }

    #[tokio::test]
    async fn test_in_flight_nonce_defers_next_build() {
        let h = harness();
        ready_message(&h, 0xaa).await;
        let second = ready_message(&h, 0xbb).await;

        // both are ready; the second finds the first still pending on the account
        assert_eq!(h.builder.build_ready().await.unwrap(), 1);
        assert_eq!(h.ledger.all_signatures().await.len(), 1);

        let second = h.ledger.get_message(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_locked_account_fails_fast() {
        let h = harness();
        let message = ready_message(&h, 0xaa).await;

        let _lease = h.builder.accounts.borrow().unwrap();
        let err = h.builder.build_message(&message).await.unwrap_err();

        assert_eq!(err.downcast_ref::<LeaseError>(), Some(&LeaseError::AccountLocked));
        assert!(h.ledger.all_signatures().await.is_empty());
    }

    #[tokio::test]
    async fn test_nonce_too_low_counts_as_broadcast() {
        let h = harness();
        ready_message(&h, 0xaa).await;
        h.builder.build_ready().await.unwrap();
        h.chain.push_broadcast_result(Ok(BroadcastOutcome::NonceTooLow)).await;

        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 1);

        let stored = h.ledger.all_signatures().await;
        assert_eq!(stored[0].status, SignatureStatus::Broadcast);
        assert_eq!(h.chain.sent().await, vec![hex::decode(&stored[0].signature).unwrap()]);
    }

    #[tokio::test]
    async fn test_already_known_counts_as_broadcast() {
        let h = harness();
        let message = ready_message(&h, 0xaa).await;
        h.builder.build_ready().await.unwrap();
        h.chain.push_broadcast_result(Ok(BroadcastOutcome::AlreadyKnown)).await;

        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 1);

        let stored = h.ledger.all_signatures().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, SignatureStatus::Broadcast);
        assert_eq!(h.chain.sent().await.len(), 1);
        // nothing left to resend
        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 0);
        assert_eq!(h.chain.sent().await.len(), 1);

        let message = h.ledger.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Broadcast);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_stays_pending() {
        let h = harness();
        ready_message(&h, 0xaa).await;
        h.builder.build_ready().await.unwrap();
        h.chain
            .push_broadcast_result(Ok(BroadcastOutcome::Rejected("insufficient funds".into())))
            .await;
        h.chain.push_broadcast_result(Err("connection reset".into())).await;

        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 0);
        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 0);
        assert_eq!(h.ledger.all_signatures().await[0].status, SignatureStatus::Pending);

        // the node takes it on the third attempt
        assert_eq!(h.builder.broadcast_pending().await.unwrap(), 1);
        assert_eq!(h.ledger.all_signatures().await[0].status, SignatureStatus::Broadcast);
    }
}
