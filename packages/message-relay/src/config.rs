//! Relay configuration, loaded from environment variables (and `.env`).
//!
//! One process serves one role on one chain. Chain settings are read from
//! variables prefixed with the upper-cased chain name:
//!
//! ```text
//! RELAY_ROLE=proposer            # proposer | validator | builder | listener
//! RELAY_CHAIN=b2                 # selects the B2_* variables below
//! DATABASE_URL=postgres://...    # required for every role except validator
//! BRIDGES=1:0x...,1123:0x...     # bridge contract per chain id
//!
//! B2_CHAIN_TYPE=evm              # evm | utxo
//! B2_CHAIN_ID=1123
//! B2_RPC_URL=https://...
//! B2_LISTEN_ADDRESS=0x...        # bridge contract, or BTC deposit address
//! B2_BLOCK_INTERVAL_MS=3000
//! B2_SIGNATURE_WEIGHT=2
//! B2_VALIDATORS=0x...,0x...,0x...
//! B2_BUILDERS=0x<key>,0x<key>
//! B2_NODE_PORT=20001
//! B2_NODE_KEY=0x<key>             # validator signing key
//! B2_ENDPOINT=127.0.0.1:20001     # proposer address, for validators
//! ```

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::redact::Secret;
use crate::types::{ledger_int, ChainType};

/// Which role this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Proposer,
    Validator,
    Builder,
    Listener,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Proposer => "proposer",
            Role::Validator => "validator",
            Role::Builder => "builder",
            Role::Listener => "listener",
        }
    }

    pub fn needs_database(&self) -> bool {
        !matches!(self, Role::Validator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "proposer" => Ok(Role::Proposer),
            "validator" => Ok(Role::Validator),
            "builder" => Ok(Role::Builder),
            "listener" => Ok(Role::Listener),
            other => Err(eyre!(
                "unknown role {:?} (expected proposer, validator, builder or listener)",
                other
            )),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub database: Option<DatabaseConfig>,
    pub chain: ChainConfig,
    pub bridges: Bridges,
    pub particle: Option<ParticleConfig>,
    pub api: ApiConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

/// Settings for the chain this process serves
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_type: ChainType,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Bridge contract (EVM) or deposit address (UTXO)
    pub listen_address: String,
    pub block_interval_ms: u64,
    /// Blocks behind head considered final
    pub safe_block_number: u64,
    pub mainnet: bool,
    /// Destination of UTXO deposits
    pub to_chain_id: Option<u64>,
    pub to_contract_address: Option<String>,
    pub btc_user: Option<String>,
    pub btc_pass: Option<Secret>,
    pub node_port: u16,
    pub node_key: Option<Secret>,
    pub endpoint: Option<String>,
    pub signature_weight: i32,
    pub validators: Vec<Address>,
    pub builders: Vec<Secret>,
    pub sync_start_block: u64,
    /// Last block of the first-boot task; 0 follows the head
    pub sync_end_block: u64,
    pub sync_handle_num: u64,
}

/// Account-abstraction lookup service for BTC depositors
#[derive(Debug, Clone)]
pub struct ParticleConfig {
    pub aa_pubkey_api: String,
    pub url: String,
    pub chain_id: u64,
    pub project_uuid: String,
    pub project_key: Secret,
}

/// Bridge contract address per chain id, parsed from `"<chain_id>:<address>,..."`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bridges {
    by_chain: HashMap<i64, String>,
}

impl Bridges {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut by_chain = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (chain, address) = entry
                .split_once(':')
                .ok_or_else(|| eyre!("bridge entry {:?} must be <chain_id>:<address>", entry))?;
            let chain_id: i64 = chain
                .trim()
                .parse()
                .wrap_err_with(|| format!("invalid chain id in bridge entry {:?}", entry))?;
            let address = address.trim();
            Address::from_str(address)
                .wrap_err_with(|| format!("invalid bridge address in entry {:?}", entry))?;
            by_chain.insert(chain_id, address.to_lowercase());
        }
        Ok(Self { by_chain })
    }

    pub fn get(&self, chain_id: i64) -> Option<&str> {
        self.by_chain.get(&chain_id).map(String::as_str)
    }

    pub fn insert(&mut self, chain_id: i64, address: impl Into<String>) {
        self.by_chain.insert(chain_id, address.into().to_lowercase());
    }

    pub fn len(&self) -> usize {
        self.by_chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chain.is_empty()
    }
}

fn default_api_port() -> u16 {
    9090
}

fn default_block_interval_ms() -> u64 {
    3000
}

fn default_signature_weight() -> i32 {
    1
}

fn default_node_port() -> u16 {
    20001
}

fn default_sync_handle_num() -> u64 {
    1000
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    /// `cli_role` (first CLI argument) takes precedence over `RELAY_ROLE`.
    pub fn load(cli_role: Option<String>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let role = match cli_role {
            Some(role) => role.parse()?,
            None => env::var("RELAY_ROLE")
                .map_err(|_| eyre!("RELAY_ROLE environment variable is required"))?
                .parse()?,
        };
        let config = Self::from_env(role)?;
        config.validate()?;
        Ok(config)
    }

    /// Read every variable for `role` without validating cross-field rules
    pub fn from_env(role: Role) -> Result<Self> {
        let chain_name = env::var("RELAY_CHAIN")
            .map_err(|_| eyre!("RELAY_CHAIN environment variable is required"))?;

        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig { url }),
            Err(_) if !role.needs_database() => None,
            Err(_) => return Err(eyre!("DATABASE_URL environment variable is required")),
        };

        let chain = ChainConfig::from_env(&chain_name)?;
        let bridges = match env::var("BRIDGES") {
            Ok(raw) => Bridges::parse(&raw).wrap_err("Invalid BRIDGES")?,
            Err(_) => Bridges::default(),
        };

        let particle = match env::var("PARTICLE_URL") {
            Ok(url) => Some(ParticleConfig {
                aa_pubkey_api: env::var("PARTICLE_AA_PUBKEY_API").map_err(|_| {
                    eyre!("PARTICLE_AA_PUBKEY_API environment variable is required")
                })?,
                url,
                chain_id: env::var("PARTICLE_CHAIN_ID")
                    .map_err(|_| eyre!("PARTICLE_CHAIN_ID environment variable is required"))?
                    .parse()
                    .wrap_err("PARTICLE_CHAIN_ID must be a number")?,
                project_uuid: env::var("PARTICLE_PROJECT_UUID").map_err(|_| {
                    eyre!("PARTICLE_PROJECT_UUID environment variable is required")
                })?,
                project_key: Secret::new(env::var("PARTICLE_PROJECT_KEY").map_err(|_| {
                    eyre!("PARTICLE_PROJECT_KEY environment variable is required")
                })?),
            }),
            Err(_) => None,
        };

        let api = ApiConfig {
            port: env::var("API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_api_port()),
        };

        Ok(Config {
            role,
            database,
            chain,
            bridges,
            particle,
            api,
        })
    }

    /// Validate the configuration for the selected role
    pub fn validate(&self) -> Result<()> {
        let chain = &self.chain;

        if chain.chain_id == 0 {
            return Err(eyre!("{}: chain id cannot be 0", chain.name));
        }
        if !(chain.rpc_url.starts_with("http://") || chain.rpc_url.starts_with("https://")) {
            return Err(eyre!(
                "{}: rpc url must use http:// or https://, got {:?}",
                chain.name,
                chain.rpc_url
            ));
        }
        if chain.signature_weight < 1 {
            return Err(eyre!("{}: signature weight must be at least 1", chain.name));
        }
        ledger_int(chain.chain_id, "chain id").wrap_err_with(|| chain.name.clone())?;
        if chain.sync_end_block > 0 && chain.sync_end_block < chain.sync_start_block {
            return Err(eyre!(
                "{}: sync end block {} is before start block {}",
                chain.name,
                chain.sync_end_block,
                chain.sync_start_block
            ));
        }
        if chain.chain_type == ChainType::Utxo
            && self.role != Role::Builder
            && self.particle.is_none()
        {
            return Err(eyre!(
                "{}: UTXO chains need PARTICLE_* settings to resolve depositors",
                chain.name
            ));
        }

        match self.role {
            Role::Proposer => {
                if chain.validators.is_empty() {
                    return Err(eyre!("{}: proposer needs at least one validator", chain.name));
                }
                if chain.signature_weight as usize > chain.validators.len() {
                    return Err(eyre!(
                        "{}: signature weight {} can never be reached by {} validators",
                        chain.name,
                        chain.signature_weight,
                        chain.validators.len()
                    ));
                }
            }
            Role::Validator => {
                let key = chain
                    .node_key
                    .as_ref()
                    .ok_or_else(|| eyre!("{}: validator needs a node key", chain.name))?;
                key.expose()
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| eyre!("{}: invalid node key: {}", chain.name, e))?;
                if chain.endpoint.is_none() {
                    return Err(eyre!("{}: validator needs a proposer endpoint", chain.name));
                }
            }
            Role::Builder => {
                if chain.chain_type != ChainType::Evm {
                    return Err(eyre!("{}: builders only run on EVM chains", chain.name));
                }
                if chain.builders.is_empty() {
                    return Err(eyre!("{}: builder needs at least one account key", chain.name));
                }
                for key in &chain.builders {
                    key.expose()
                        .parse::<PrivateKeySigner>()
                        .map_err(|e| eyre!("{}: invalid builder key: {}", chain.name, e))?;
                }
            }
            Role::Listener => {
                if chain.listen_address.is_empty() {
                    return Err(eyre!("{}: listener needs a listen address", chain.name));
                }
                if chain.chain_type == ChainType::Utxo {
                    let to_chain_id = chain.to_chain_id.ok_or_else(|| {
                        eyre!("{}: UTXO listener needs a destination chain id", chain.name)
                    })?;
                    if chain.to_contract_address.is_none() {
                        return Err(eyre!(
                            "{}: UTXO listener needs a destination contract",
                            chain.name
                        ));
                    }
                    if self.bridges.get(ledger_int(to_chain_id, "destination chain id")?).is_none() {
                        return Err(eyre!(
                            "{}: BRIDGES has no entry for destination chain {}",
                            chain.name,
                            to_chain_id
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn block_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.chain.block_interval_ms)
    }
}

impl ChainConfig {
    /// Load `<NAME>_*` variables for one chain
    pub fn from_env(name: &str) -> Result<Self> {
        let prefix = name.trim().to_uppercase().replace('-', "_");
        let var = |key: &str| {
            env::var(format!("{}_{}", prefix, key))
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| {
            var(key).ok_or_else(|| eyre!("{}_{} environment variable is required", prefix, key))
        };

        let chain_type: ChainType = required("CHAIN_TYPE")?
            .to_lowercase()
            .parse()
            .wrap_err_with(|| format!("{}_CHAIN_TYPE must be evm or utxo", prefix))?;

        let validators = var("VALIDATORS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        Address::from_str(s)
                            .wrap_err_with(|| format!("invalid validator address {:?}", s))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let builders = var("BUILDERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Secret::new)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChainConfig {
            name: name.to_string(),
            chain_type,
            chain_id: required("CHAIN_ID")?
                .parse()
                .wrap_err_with(|| format!("{}_CHAIN_ID must be a number", prefix))?,
            rpc_url: required("RPC_URL")?,
            listen_address: var("LISTEN_ADDRESS").unwrap_or_default(),
            block_interval_ms: var("BLOCK_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_block_interval_ms()),
            safe_block_number: var("SAFE_BLOCK_NUMBER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            mainnet: var("MAINNET")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            to_chain_id: var("TO_CHAIN_ID").and_then(|v| v.parse().ok()),
            to_contract_address: var("TO_CONTRACT_ADDRESS"),
            btc_user: var("BTC_USER"),
            btc_pass: var("BTC_PASS").map(Secret::new),
            node_port: var("NODE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_node_port()),
            node_key: var("NODE_KEY").map(Secret::new),
            endpoint: var("ENDPOINT"),
            signature_weight: var("SIGNATURE_WEIGHT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_signature_weight()),
            validators,
            builders,
            sync_start_block: var("SYNC_START_BLOCK")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sync_end_block: var("SYNC_END_BLOCK")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sync_handle_num: var("SYNC_HANDLE_NUM")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_sync_handle_num()),
        })
    }
}
