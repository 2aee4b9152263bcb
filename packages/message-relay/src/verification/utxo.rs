use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use tracing::debug;

use super::{ProofClaim, SourceProof};
use crate::clients::{AccountResolver, RawTransaction, UtxoChain};
use crate::encoding::{encode_deposit_payload, DepositPayload};
use crate::hash::{decode_hex, parse_bytes32};

/// Total paid to `listen_address`, in satoshis
pub fn paid_to(tx: &RawTransaction, listen_address: &str) -> u64 {
    tx.vout
        .iter()
        .filter(|out| out.script_pub_key.address() == Some(listen_address))
        .map(|out| out.satoshis())
        .sum()
}

/// EVM address embedded in the first `OP_RETURN` output, if any.
/// The script is `OP_RETURN <push len> <ascii 0x...>`.
pub fn op_return_address(tx: &RawTransaction) -> Option<Address> {
    let script = tx
        .vout
        .iter()
        .find(|out| out.script_pub_key.is_null_data())
        .and_then(|out| hex::decode(&out.script_pub_key.hex).ok())?;
    let text = std::str::from_utf8(script.get(2..)?).ok()?.trim();
    if text.len() != 42 || !text.starts_with("0x") {
        return None;
    }
    Address::from_str(text).ok()
}

/// Address that funded the first resolvable input
pub async fn first_input_address(
    chain: &dyn UtxoChain,
    tx: &RawTransaction,
) -> Result<Option<String>> {
    for input in &tx.vin {
        let (Some(prev_txid), Some(vout)) = (&input.txid, input.vout) else {
            continue;
        };
        let prev = chain
            .raw_transaction(prev_txid)
            .await?
            .ok_or_else(|| eyre!("previous transaction {} not found", prev_txid))?;
        let address = prev
            .vout
            .iter()
            .find(|out| out.n == vout)
            .and_then(|out| out.script_pub_key.address());
        if let Some(address) = address {
            return Ok(Some(address.to_string()));
        }
    }
    Ok(None)
}

/// Rebuild the deposit a transaction makes to `listen_address`. `None` when
/// nothing was paid to it, or the depositor or its destination account
/// cannot be determined.
pub async fn inspect_deposit(
    chain: &dyn UtxoChain,
    resolver: &dyn AccountResolver,
    listen_address: &str,
    tx: &RawTransaction,
) -> Result<Option<DepositPayload>> {
    let amount = paid_to(tx, listen_address);
    if amount == 0 {
        return Ok(None);
    }
    let Some(from_address) = first_input_address(chain, tx).await? else {
        return Ok(None);
    };

    let to_address = match op_return_address(tx) {
        Some(address) => address,
        None => match resolver.smart_account(&from_address).await? {
            Some(address) => address,
            None => return Ok(None),
        },
    };

    Ok(Some(DepositPayload {
        tx_id: parse_bytes32(&tx.txid)?,
        from_address,
        to_address,
        amount: U256::from(amount),
    }))
}

/// Checks a deposit claim by rebuilding its payload from the raw transaction
pub struct UtxoSourceVerifier {
    chain: Arc<dyn UtxoChain>,
    resolver: Arc<dyn AccountResolver>,
    listen_address: String,
}

impl UtxoSourceVerifier {
    pub fn new(
        chain: Arc<dyn UtxoChain>,
        resolver: Arc<dyn AccountResolver>,
        listen_address: String,
    ) -> Self {
        Self {
            chain,
            resolver,
            listen_address,
        }
    }
}

#[async_trait]
impl SourceProof for UtxoSourceVerifier {
    async fn verify(&self, claim: &ProofClaim) -> Result<bool> {
        let (Ok(tx_hash), Ok(from_id), Ok(data)) = (
            parse_bytes32(&claim.tx_hash),
            parse_bytes32(&claim.from_id),
            decode_hex(&claim.to_bytes),
        ) else {
            return Ok(false);
        };
        if from_id != tx_hash {
            return Ok(false);
        }

        let txid = hex::encode(tx_hash);
        let tx = self
            .chain
            .raw_transaction(&txid)
            .await?
            .ok_or_else(|| eyre!("transaction {} not found", txid))?;

        let Some(deposit) =
            inspect_deposit(self.chain.as_ref(), self.resolver.as_ref(), &self.listen_address, &tx)
                .await?
        else {
            debug!(txid = %txid, "Deposit could not be reconstructed");
            return Ok(false);
        };
        Ok(encode_deposit_payload(&deposit) == data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockAccountResolver;
    use crate::testing::{deposit_tx, funding_tx, op_return_output, FakeUtxoChain, LISTEN_ADDRESS};

    const DEPOSITOR: &str = "tb1qdepositor";

    fn evm(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    async fn chain_with(tx: &RawTransaction) -> FakeUtxoChain {
        let chain = FakeUtxoChain::default();
        chain.insert(funding_tx(DEPOSITOR)).await;
        chain.insert(tx.clone()).await;
        chain
    }

    #[tokio::test]
    async fn test_op_return_skips_lookup() {
        let mut tx = deposit_tx(150_000);
        tx.vout.push(op_return_output(&format!("{:#x}", evm(0x42))));
        let chain = chain_with(&tx).await;

        let mut resolver = MockAccountResolver::new();
        resolver.expect_smart_account().times(0);

        let deposit = inspect_deposit(&chain, &resolver, LISTEN_ADDRESS, &tx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.to_address, evm(0x42));
        assert_eq!(deposit.from_address, DEPOSITOR);
        assert_eq!(deposit.amount, U256::from(150_000u64));
    }

    #[tokio::test]
    async fn test_lookup_used_once_without_op_return() {
        let tx = deposit_tx(2_000);
        let chain = chain_with(&tx).await;

        let mut resolver = MockAccountResolver::new();
        resolver
            .expect_smart_account()
            .withf(|address| address == DEPOSITOR)
            .times(1)
            .returning(|_| Ok(Some(Address::repeat_byte(0x77))));

        let deposit = inspect_deposit(&chain, &resolver, LISTEN_ADDRESS, &tx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.to_address, evm(0x77));
    }

    #[tokio::test]
    async fn test_unregistered_depositor_yields_nothing() {
        let tx = deposit_tx(2_000);
        let chain = chain_with(&tx).await;

        let mut resolver = MockAccountResolver::new();
        resolver.expect_smart_account().times(1).returning(|_| Ok(None));

        assert!(inspect_deposit(&chain, &resolver, LISTEN_ADDRESS, &tx)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_op_return_is_ignored() {
        let mut tx = deposit_tx(1);
        tx.vout.push(op_return_output("hello"));
        assert_eq!(op_return_address(&tx), None);
    }

    async fn claim_for(tx: &RawTransaction, to: Address, amount: u64) -> ProofClaim {
        let payload = encode_deposit_payload(&DepositPayload {
            tx_id: parse_bytes32(&tx.txid).unwrap(),
            from_address: DEPOSITOR.to_string(),
            to_address: to,
            amount: U256::from(amount),
        });
        ProofClaim {
            tx_hash: format!("0x{}", tx.txid),
            log_index: 0,
            from_chain_id: 3,
            from_id: format!("0x{}", tx.txid),
            from_sender: format!("{:#x}", Address::ZERO),
            from_message_bridge: LISTEN_ADDRESS.to_string(),
            to_chain_id: 2,
            to_contract_address: format!("{:#x}", evm(0x55)),
            to_bytes: format!("0x{}", hex::encode(payload)),
        }
    }

    fn verifier(chain: FakeUtxoChain, resolver: MockAccountResolver) -> UtxoSourceVerifier {
        UtxoSourceVerifier::new(Arc::new(chain), Arc::new(resolver), LISTEN_ADDRESS.to_string())
    }

    #[tokio::test]
    async fn test_verify_accepts_exact_payload() {
        let mut tx = deposit_tx(5_000);
        tx.vout.push(op_return_output(&format!("{:#x}", evm(0x42))));
        let claim = claim_for(&tx, evm(0x42), 5_000).await;
        let mut resolver = MockAccountResolver::new();
        resolver.expect_smart_account().times(0);

        let verifier = verifier(chain_with(&tx).await, resolver);
        assert!(verifier.verify(&claim).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_zero_value_deposit() {
        let mut tx = deposit_tx(0);
        tx.vout.push(op_return_output(&format!("{:#x}", evm(0x42))));
        let claim = claim_for(&tx, evm(0x42), 0).await;
        let mut resolver = MockAccountResolver::new();
        resolver.expect_smart_account().times(0);
        let chain = chain_with(&tx).await;

        assert!(inspect_deposit(&chain, &resolver, LISTEN_ADDRESS, &tx)
            .await
            .unwrap()
            .is_none());
        let verifier = verifier(chain, resolver);
        assert!(!verifier.verify(&claim).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_amount_or_id() {
        let mut tx = deposit_tx(5_000);
        tx.vout.push(op_return_output(&format!("{:#x}", evm(0x42))));
        let mut resolver = MockAccountResolver::new();
        resolver.expect_smart_account().times(0);
        let verifier = verifier(chain_with(&tx).await, resolver);

        let inflated = claim_for(&tx, evm(0x42), 6_000).await;
        assert!(!verifier.verify(&inflated).await.unwrap());

        let mut other_id = claim_for(&tx, evm(0x42), 5_000).await;
        other_id.from_id = format!("0x{}", "11".repeat(32));
        assert!(!verifier.verify(&other_id).await.unwrap());
    }
}
