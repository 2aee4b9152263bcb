use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use tracing::debug;

use super::{ProofClaim, SourceProof};
use crate::clients::{EvmChain, LogRecord};
use crate::encoding::{decode_bridge_event, BridgeEventKind};
use crate::hash::{decode_hex, parse_bytes32, parse_u256};

/// Checks a claim against the `Call` log it names
pub struct EvmSourceVerifier {
    chain: Arc<dyn EvmChain>,
}

/// Claim fields in their on-chain types
struct ExpectedCall {
    bridge: Address,
    from_chain_id: U256,
    from_id: U256,
    from_sender: Address,
    to_chain_id: U256,
    to_contract_address: Address,
    to_bytes: Vec<u8>,
}

impl ExpectedCall {
    fn parse(claim: &ProofClaim) -> Result<Self> {
        Ok(ExpectedCall {
            bridge: Address::from_str(&claim.from_message_bridge)?,
            from_chain_id: U256::from(u64::try_from(claim.from_chain_id)?),
            from_id: parse_u256(&claim.from_id)?,
            from_sender: Address::from_str(&claim.from_sender)?,
            to_chain_id: U256::from(u64::try_from(claim.to_chain_id)?),
            to_contract_address: Address::from_str(&claim.to_contract_address)?,
            to_bytes: decode_hex(&claim.to_bytes)?,
        })
    }

    fn matches(&self, log: &LogRecord) -> bool {
        if log.address != self.bridge {
            return false;
        }
        if log.topics.first().and_then(BridgeEventKind::from_topic) != Some(BridgeEventKind::Call)
        {
            return false;
        }
        match decode_bridge_event(&log.data) {
            Ok(event) => {
                event.from_chain_id == self.from_chain_id
                    && event.from_id == self.from_id
                    && event.from_sender == self.from_sender
                    && event.to_chain_id == self.to_chain_id
                    && event.contract_address == self.to_contract_address
                    && event.data.as_ref() == self.to_bytes.as_slice()
            }
            Err(_) => false,
        }
    }
}

impl EvmSourceVerifier {
    pub fn new(chain: Arc<dyn EvmChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl SourceProof for EvmSourceVerifier {
    async fn verify(&self, claim: &ProofClaim) -> Result<bool> {
        let expected = match ExpectedCall::parse(claim) {
            Ok(expected) => expected,
            Err(e) => {
                debug!(tx_hash = %claim.tx_hash, error = %e, "Malformed claim");
                return Ok(false);
            }
        };
        let (Ok(tx_hash), Ok(log_index)) =
            (parse_bytes32(&claim.tx_hash), u64::try_from(claim.log_index))
        else {
            return Ok(false);
        };

        let logs = self
            .chain
            .receipt_logs(tx_hash)
            .await?
            .ok_or_else(|| eyre!("receipt for {} not found", tx_hash))?;

        Ok(logs
            .iter()
            .filter(|log| log.log_index == Some(log_index))
            .any(|log| expected.matches(log)))
    }
}
