//! Source-chain proof checks shared by the proposer and validators
//!
//! `Ok(false)` means the claim contradicts the chain and must not be signed.
//! `Err` means the chain could not be consulted; callers retry later and
//! change nothing.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{eyre, Result};

use crate::clients::{AlloyEvmClient, BitcoinRpcClient, ParticleClient};
use crate::config::Config;
use crate::db::models::Message;
use crate::p2p::ProposalPayload;
use crate::types::ChainType;

pub mod evm;
pub mod utxo;

pub use evm::EvmSourceVerifier;
pub use utxo::{inspect_deposit, UtxoSourceVerifier};

/// What a message claims happened on its source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofClaim {
    pub tx_hash: String,
    pub log_index: i64,
    pub from_chain_id: i64,
    pub from_id: String,
    pub from_sender: String,
    pub from_message_bridge: String,
    pub to_chain_id: i64,
    pub to_contract_address: String,
    pub to_bytes: String,
}

impl ProofClaim {
    pub fn from_message(message: &Message) -> Self {
        ProofClaim {
            tx_hash: message.tx_hash.clone(),
            log_index: message.log_index,
            from_chain_id: message.from_chain_id,
            from_id: message.from_id.clone(),
            from_sender: message.from_sender.clone(),
            from_message_bridge: message.from_message_bridge.clone(),
            to_chain_id: message.to_chain_id,
            to_contract_address: message.to_contract_address.clone(),
            to_bytes: message.to_bytes.clone(),
        }
    }

    pub fn from_proposal(proposal: &ProposalPayload) -> Self {
        let fields = &proposal.fields;
        ProofClaim {
            tx_hash: proposal.tx_hash.clone(),
            log_index: proposal.log_index,
            from_chain_id: fields.from_chain_id,
            from_id: fields.from_id.clone(),
            from_sender: fields.from_sender.clone(),
            from_message_bridge: fields.from_message_contract.clone(),
            to_chain_id: fields.to_chain_id,
            to_contract_address: fields.to_contract_address.clone(),
            to_bytes: fields.data.clone(),
        }
    }
}

#[async_trait]
pub trait SourceProof: Send + Sync {
    async fn verify(&self, claim: &ProofClaim) -> Result<bool>;
}

/// Verifier for the chain this process serves
pub fn source_verifier(config: &Config) -> Result<Arc<dyn SourceProof>> {
    let chain = &config.chain;
    match chain.chain_type {
        ChainType::Evm => {
            let client = AlloyEvmClient::new(&chain.rpc_url, chain.chain_id)?;
            Ok(Arc::new(EvmSourceVerifier::new(Arc::new(client))))
        }
        ChainType::Utxo => {
            let particle = config
                .particle
                .clone()
                .ok_or_else(|| eyre!("{}: PARTICLE_* settings are required", chain.name))?;
            let client =
                BitcoinRpcClient::new(&chain.rpc_url, chain.btc_user.clone(), chain.btc_pass.clone())?;
            Ok(Arc::new(UtxoSourceVerifier::new(
                Arc::new(client),
                Arc::new(ParticleClient::new(particle)?),
                chain.listen_address.clone(),
            )))
        }
    }
}
