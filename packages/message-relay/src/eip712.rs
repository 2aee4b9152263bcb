//! EIP-712 typed data used on the relay's P2P channel
//!
//! `Login(address account,uint256 timestamp)` under the `MessageSharingLogin`
//! domain authenticates a validator connection. `Send(...)` under the
//! `B2MessageSharing` domain, bound to the destination bridge, is what each
//! validator attests to and what the destination bridge checks on-chain.

use std::borrow::Cow;

use alloy::primitives::{Address, PrimitiveSignature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::Eip712Domain;
use eyre::{eyre, Result, WrapErr};

use crate::hash::{address_word, decode_hex, keccak256, u256_word, u64_word};

pub const LOGIN_DOMAIN_NAME: &str = "MessageSharingLogin";
pub const SEND_DOMAIN_NAME: &str = "B2MessageSharing";
pub const DOMAIN_VERSION: &str = "1";

const LOGIN_TYPE: &str = "Login(address account,uint256 timestamp)";
const SEND_TYPE: &str = "Send(uint256 from_chain_id,uint256 from_id,address from_sender,uint256 to_chain_id,address to_business_contract,bytes to_message)";

/// Validator login attestation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTypedData {
    pub chain_id: u64,
    pub account: Address,
    pub timestamp: u64,
}

impl LoginTypedData {
    pub fn domain(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some(Cow::Borrowed(LOGIN_DOMAIN_NAME)),
            Some(Cow::Borrowed(DOMAIN_VERSION)),
            Some(U256::from(self.chain_id)),
            None,
            None,
        )
    }

    pub fn struct_hash(&self) -> B256 {
        let mut encoded = Vec::with_capacity(3 * 32);
        encoded.extend_from_slice(&keccak256(LOGIN_TYPE.as_bytes()));
        encoded.extend_from_slice(&address_word(self.account));
        encoded.extend_from_slice(&u64_word(self.timestamp));
        B256::from(keccak256(&encoded))
    }

    pub fn signing_hash(&self) -> B256 {
        signing_hash(&self.domain(), self.struct_hash())
    }
}

/// The payload a validator signs for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTypedData {
    /// Destination chain id, used for the domain
    pub chain_id: u64,
    /// Destination bridge contract, used as `verifyingContract`
    pub verifying_contract: Address,
    pub from_chain_id: u64,
    pub from_id: U256,
    pub from_sender: Address,
    pub to_chain_id: u64,
    pub to_business_contract: Address,
    pub to_message: Vec<u8>,
}

impl SendTypedData {
    pub fn domain(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some(Cow::Borrowed(SEND_DOMAIN_NAME)),
            Some(Cow::Borrowed(DOMAIN_VERSION)),
            Some(U256::from(self.chain_id)),
            Some(self.verifying_contract),
            None,
        )
    }

    pub fn struct_hash(&self) -> B256 {
        let mut encoded = Vec::with_capacity(7 * 32);
        encoded.extend_from_slice(&keccak256(SEND_TYPE.as_bytes()));
        encoded.extend_from_slice(&u64_word(self.from_chain_id));
        encoded.extend_from_slice(&u256_word(self.from_id));
        encoded.extend_from_slice(&address_word(self.from_sender));
        encoded.extend_from_slice(&u64_word(self.to_chain_id));
        encoded.extend_from_slice(&address_word(self.to_business_contract));
        encoded.extend_from_slice(&keccak256(&self.to_message));
        B256::from(keccak256(&encoded))
    }

    pub fn signing_hash(&self) -> B256 {
        signing_hash(&self.domain(), self.struct_hash())
    }
}

fn signing_hash(domain: &Eip712Domain, struct_hash: B256) -> B256 {
    let mut digest_input = Vec::with_capacity(2 + 64);
    digest_input.extend_from_slice(&[0x19, 0x01]);
    digest_input.extend_from_slice(domain.separator().as_slice());
    digest_input.extend_from_slice(struct_hash.as_slice());
    B256::from(keccak256(&digest_input))
}

/// Sign a typed-data hash, returning 65 bytes hex with the recovery byte as 27/28
pub fn sign_hash(signer: &PrivateKeySigner, hash: B256) -> Result<String> {
    let signature = signer
        .sign_hash_sync(&hash)
        .map_err(|e| eyre!("failed to sign typed data: {}", e))?;
    let mut bytes = signature.as_bytes();
    if bytes[64] < 27 {
        bytes[64] += 27;
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Recover the signer of a typed-data hash. Accepts a recovery byte of 0/1 or 27/28.
pub fn recover_signer(hash: B256, signature_hex: &str) -> Result<Address> {
    let bytes = decode_hex(signature_hex).wrap_err("signature is not hex")?;
    if bytes.len() != 65 {
        return Err(eyre!("signature must be 65 bytes, got {}", bytes.len()));
    }
    let v = match bytes[64] {
        0 | 27 => false,
        1 | 28 => true,
        other => return Err(eyre!("invalid recovery byte {}", other)),
    };
    let signature = PrimitiveSignature::new(
        U256::from_be_slice(&bytes[..32]),
        U256::from_be_slice(&bytes[32..64]),
        v,
    );
    signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| eyre!("failed to recover signer: {}", e))
}
