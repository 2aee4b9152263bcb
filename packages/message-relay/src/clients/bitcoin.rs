//! Bitcoin Core JSON-RPC client

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::UtxoChain;
use crate::redact::Secret;

/// `RPC_INVALID_ADDRESS_OR_KEY`, returned for unknown transactions
const RPC_NOT_FOUND: i64 = -5;

const SATOSHIS_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in BTC
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    pub hex: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    /// Older nodes report a list instead of `address`
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ScriptPubKey {
    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .or_else(|| self.addresses.first().map(String::as_str))
    }

    pub fn is_null_data(&self) -> bool {
        self.kind == "nulldata" || self.hex.starts_with("6a")
    }
}

impl TxOutput {
    pub fn satoshis(&self) -> u64 {
        (self.value * SATOSHIS_PER_BTC).round() as u64
    }
}

/// A block with its decoded transactions (`getblock` verbosity 2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoBlock {
    pub hash: String,
    pub height: u64,
    pub time: u64,
    #[serde(default)]
    pub tx: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct BitcoinRpcClient {
    client: Client,
    url: String,
    user: Option<String>,
    pass: Option<Secret>,
}

impl BitcoinRpcClient {
    pub fn new(url: &str, user: Option<String>, pass: Option<Secret>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            user,
            pass,
        })
    }

    /// Call a method; `Ok(None)` when the node reports "not found"
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "message-relay",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_ref().map(|p| p.expose()));
        }

        // bitcoind answers errors with HTTP 500 and a JSON body, so the
        // status code is not checked
        let response = request
            .send()
            .await
            .wrap_err_with(|| format!("{} request failed", method))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("{} returned an unreadable response", method))?;

        if let Some(error) = response.error {
            if error.code == RPC_NOT_FOUND {
                return Ok(None);
            }
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }
        Ok(response.result)
    }
}

#[async_trait]
impl UtxoChain for BitcoinRpcClient {
    async fn block_count(&self) -> Result<u64> {
        self.call("getblockcount", json!([]))
            .await?
            .ok_or_else(|| eyre!("No block count returned"))
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Option<RawTransaction>> {
        let txid = txid.trim_start_matches("0x");
        self.call("getrawtransaction", json!([txid, true])).await
    }

    async fn block_at(&self, height: u64) -> Result<UtxoBlock> {
        let hash: String = self
            .call("getblockhash", json!([height]))
            .await?
            .ok_or_else(|| eyre!("No block at height {}", height))?;
        self.call("getblock", json!([hash, 2]))
            .await?
            .ok_or_else(|| eyre!("Block {} not found", hash))
    }
}
