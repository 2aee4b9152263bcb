//! Account-abstraction lookup for BTC depositors
//!
//! Two hops: the depositor's public key is looked up by address, then the
//! AA service is asked for the smart account bound to that key.

use std::str::FromStr;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::AccountResolver;
use crate::config::ParticleConfig;

/// Pubkey API code for an address it has never seen
const PUBKEY_NOT_FOUND: &str = "1001";

#[derive(Debug, Deserialize)]
struct PubkeyResponse {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    data: Option<PubkeyData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PubkeyData {
    pubkey: String,
}

#[derive(Debug, Deserialize)]
struct AaResponse {
    #[serde(default)]
    result: Vec<AaAccount>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AaAccount {
    smart_account_address: String,
}

pub struct ParticleClient {
    client: Client,
    config: ParticleConfig,
}

impl ParticleClient {
    pub fn new(config: ParticleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    async fn public_key(&self, btc_address: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/v1/btc/pubkey/{}",
            self.config.aa_pubkey_api.trim_end_matches('/'),
            btc_address
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("pubkey lookup failed")?
            .json::<PubkeyResponse>()
            .await
            .wrap_err("pubkey lookup returned an unreadable response")?;

        let code = response.code.as_ref().map(|c| match c {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        match (code.as_deref(), response.data) {
            (Some(PUBKEY_NOT_FOUND), _) => Ok(None),
            (Some("0") | None, Some(data)) if !data.pubkey.is_empty() => Ok(Some(data.pubkey)),
            (code, _) => Err(eyre!(
                "pubkey lookup for {} failed: code {:?} {}",
                btc_address,
                code,
                response.message.unwrap_or_default()
            )),
        }
    }
}

#[async_trait]
impl AccountResolver for ParticleClient {
    async fn smart_account(&self, btc_address: &str) -> Result<Option<Address>> {
        let Some(pubkey) = self.public_key(btc_address).await? else {
            return Ok(None);
        };

        let url = format!(
            "{}?chainId={}&projectUuid={}&projectKey={}",
            self.config.url,
            self.config.chain_id,
            self.config.project_uuid,
            self.config.project_key.expose()
        );
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "particle_aa_getBTCAccount",
            "params": [{
                "name": "BTC",
                "version": "2.0.0",
                "btcPublicKey": pubkey,
            }],
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .wrap_err("smart account lookup failed")?
            .json::<AaResponse>()
            .await
            .wrap_err("smart account lookup returned an unreadable response")?;

        if let Some(error) = response.error {
            return Err(eyre!("smart account lookup error: {}", error));
        }
        let [account] = response.result.as_slice() else {
            return Err(eyre!(
                "expected one smart account for {}, got {}",
                btc_address,
                response.result.len()
            ));
        };
        Address::from_str(&account.smart_account_address)
            .map(Some)
            .wrap_err("smart account is not an EVM address")
    }
}
