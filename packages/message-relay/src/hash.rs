//! Keccak hashing and 32-byte word helpers
//!
//! The relay builds its ABI payloads by hand, so these helpers deal in raw
//! words rather than going through a full ABI encoder.

use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result, WrapErr};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic0 of an event signature
pub fn event_topic(signature: &str) -> B256 {
    B256::from(keccak256(signature.as_bytes()))
}

pub fn u256_word(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

pub fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Left-pad a 20-byte address into a 32-byte word
pub fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

/// Right-pad bytes with zeros up to the next 32-byte boundary
pub fn pad_to_word(bytes: &[u8]) -> Vec<u8> {
    let padded_len = bytes.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(bytes);
    out.resize(padded_len, 0);
    out
}

/// Convert bytes32 to 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode hex with or without a 0x prefix
pub fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(stripped).wrap_err_with(|| format!("invalid hex: {}", value))
}

/// Parse a hex string into 32 bytes, keeping the rightmost bytes and
/// left-padding shorter input. `0x01` and a full 64-digit hash both parse.
pub fn parse_bytes32(value: &str) -> Result<B256> {
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let even = if stripped.len() % 2 == 1 {
        format!("0{}", stripped)
    } else {
        stripped.to_string()
    };
    let bytes = hex::decode(&even).wrap_err_with(|| format!("invalid bytes32 hex: {}", value))?;
    if bytes.is_empty() {
        return Err(eyre!("empty bytes32 value"));
    }
    let mut word = [0u8; 32];
    let take = bytes.len().min(32);
    word[32 - take..].copy_from_slice(&bytes[bytes.len() - take..]);
    Ok(B256::from(word))
}

/// Parse a 256-bit identifier (e.g. a message `from_id`)
pub fn parse_u256(value: &str) -> Result<U256> {
    Ok(U256::from_be_bytes(parse_bytes32(value)?.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_selector_matches_erc20_transfer() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_address_word_left_pads() {
        let address: Address = "0xdead000000000000000000000000000000000001".parse().unwrap();
        let word = address_word(address);
        assert!(word[..12].iter().all(|b| *b == 0));
        assert_eq!(word[12], 0xde);
        assert_eq!(word[31], 0x01);
    }

    #[test]
    fn test_pad_to_word() {
        assert!(pad_to_word(&[]).is_empty());
        assert_eq!(pad_to_word(&[1]).len(), 32);
        assert_eq!(pad_to_word(&[0u8; 32]).len(), 32);
        assert_eq!(pad_to_word(&[0u8; 33]).len(), 64);
    }

    #[test]
    fn test_parse_bytes32_short_and_full() {
        let short = parse_bytes32("0x01").unwrap();
        assert_eq!(short.0[31], 1);
        assert!(short.0[..31].iter().all(|b| *b == 0));

        let odd = parse_bytes32("0x123").unwrap();
        assert_eq!(&odd.0[30..], &[0x01, 0x23]);

        let full_hex = format!("0x{}", "ab".repeat(32));
        assert_eq!(bytes32_to_hex(&parse_bytes32(&full_hex).unwrap().0), full_hex);

        assert!(parse_bytes32("0x").is_err());
        assert!(parse_bytes32("zz").is_err());
    }

    #[test]
    fn test_u64_word() {
        let word = u64_word(0x0102);
        assert_eq!(&word[30..], &[0x01, 0x02]);
        assert_eq!(U256::from_be_bytes(word), U256::from(0x0102u64));
    }
}
