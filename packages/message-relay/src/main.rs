//! B2 Message Relay node
//!
//! One binary, four roles, each serving a single chain:
//!
//! - `listener` ingests bridge events (or BTC deposits) into the ledger
//! - `proposer` collects validator signatures over the P2P channel
//! - `validator` verifies proposals against the source chain and signs
//! - `builder` delivers threshold-signed messages to the destination chain
//!
//! The role comes from the first CLI argument or `RELAY_ROLE`.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use message_relay::api::{self, ApiState};
use message_relay::builder::{AccountPool, Builder};
use message_relay::clients::{AlloyEvmClient, BitcoinRpcClient, ParticleClient};
use message_relay::config::{Config, Role};
use message_relay::confirmation::Confirmer;
use message_relay::db::{self, PgLedger};
use message_relay::feed::{DepositRoute, Normalizer};
use message_relay::ledger::Ledger;
use message_relay::proposer::Proposer;
use message_relay::types::{ledger_int, ChainType};
use message_relay::validator::Validator;
use message_relay::verification::source_verifier;
use message_relay::watchers::{EvmWatcher, SyncLoop, UtxoWatcher, WindowScanner};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();

    info!("Starting B2 Message Relay");

    let config = Config::load(std::env::args().nth(1))?;
    info!(
        role = %config.role,
        chain = %config.chain.name,
        chain_id = config.chain.chain_id,
        chain_type = %config.chain.chain_type,
        "Configuration loaded"
    );

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let api_state = ApiState::new(config.role, config.chain.name.clone(), config.chain.chain_id);
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            error!(error = %e, "API server error");
        }
    });

    let result = match config.role {
        Role::Proposer => run_proposer(&config).await,
        Role::Validator => run_validator(&config).await,
        Role::Builder => run_builder(&config).await,
        Role::Listener => run_listener(&config).await,
    };
    if let Err(e) = &result {
        error!(role = %config.role, error = %e, "Role stopped with an error");
    }

    info!("B2 Message Relay stopped");
    result
}

async fn connect_ledger(config: &Config) -> Result<Arc<dyn Ledger>> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| eyre!("DATABASE_URL environment variable is required"))?;
    let pool = db::create_pool(&database.url).await?;
    info!("Database connected");

    db::run_migrations(&pool).await?;
    info!("Database migrations complete");

    Ok(Arc::new(PgLedger::new(pool)))
}

async fn run_proposer(config: &Config) -> Result<()> {
    let ledger = connect_ledger(config).await?;
    let verifier = source_verifier(config)?;
    let chain = &config.chain;

    let addr = SocketAddr::from(([0, 0, 0, 0], chain.node_port));
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind proposer to {}", addr))?;

    let proposer = Arc::new(Proposer::new(
        ledger,
        verifier,
        chain.chain_id,
        chain.signature_weight,
        chain.validators.clone(),
    ));
    proposer.run(listener, shutdown_channel()).await
}

async fn run_validator(config: &Config) -> Result<()> {
    let chain = &config.chain;
    let signer: PrivateKeySigner = chain
        .node_key
        .as_ref()
        .ok_or_else(|| eyre!("{}: validator needs a node key", chain.name))?
        .expose()
        .parse()
        .wrap_err("Invalid node key")?;
    let endpoint = chain
        .endpoint
        .clone()
        .ok_or_else(|| eyre!("{}: validator needs a proposer endpoint", chain.name))?;

    let validator = Validator::new(signer, source_verifier(config)?, endpoint, chain.chain_id);
    validator.run(shutdown_channel()).await
}

async fn run_builder(config: &Config) -> Result<()> {
    let ledger = connect_ledger(config).await?;
    let chain = &config.chain;
    let client = Arc::new(AlloyEvmClient::new(&chain.rpc_url, chain.chain_id)?);
    let accounts = AccountPool::from_keys(&chain.builders)?;

    let builder = Builder::new(
        ledger.clone(),
        client.clone(),
        accounts,
        chain.chain_id,
        chain.signature_weight,
        config.block_interval(),
    );
    let confirmer = Confirmer::new(ledger, client, chain.chain_id, config.block_interval());

    let mut receivers = shutdown_channels(2);
    let (builder_rx, confirmer_rx) = match (receivers.pop(), receivers.pop()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(eyre!("failed to create shutdown channels")),
    };

    tokio::select! {
        result = builder.run(builder_rx) => result,
        result = confirmer.run(confirmer_rx) => result,
    }
}

async fn run_listener(config: &Config) -> Result<()> {
    let ledger = connect_ledger(config).await?;
    let chain = &config.chain;
    let chain_id = ledger_int(chain.chain_id, "chain id")?;

    let scanner: Box<dyn WindowScanner> = match chain.chain_type {
        ChainType::Evm => {
            let bridge = Address::from_str(&chain.listen_address)
                .wrap_err("Invalid bridge listen address")?;
            Box::new(EvmWatcher::new(
                Arc::new(AlloyEvmClient::new(&chain.rpc_url, chain.chain_id)?),
                ledger.clone(),
                Normalizer::new(config.bridges.clone(), None),
                bridge,
                chain_id,
                chain.safe_block_number,
            ))
        }
        ChainType::Utxo => {
            let particle = config
                .particle
                .clone()
                .ok_or_else(|| eyre!("{}: PARTICLE_* settings are required", chain.name))?;
            let route = DepositRoute {
                listen_address: chain.listen_address.clone(),
                to_chain_id: ledger_int(
                    chain
                        .to_chain_id
                        .ok_or_else(|| eyre!("{}: TO_CHAIN_ID is required", chain.name))?,
                    "destination chain id",
                )?,
                to_contract_address: chain
                    .to_contract_address
                    .clone()
                    .ok_or_else(|| eyre!("{}: TO_CONTRACT_ADDRESS is required", chain.name))?,
            };
            Box::new(UtxoWatcher::new(
                Arc::new(BitcoinRpcClient::new(
                    &chain.rpc_url,
                    chain.btc_user.clone(),
                    chain.btc_pass.clone(),
                )?),
                Arc::new(ParticleClient::new(particle)?),
                ledger.clone(),
                Normalizer::new(config.bridges.clone(), Some(route)),
                chain.listen_address.clone(),
                chain_id,
                chain.safe_block_number,
            ))
        }
    };

    let sync = SyncLoop::new(scanner, ledger, chain.chain_type, chain_id, config.block_interval());
    sync.ensure_task(
        chain.sync_start_block,
        chain.sync_end_block,
        chain.sync_handle_num,
    )
    .await?;
    sync.run(shutdown_channel()).await
}

/// A receiver that fires once on Ctrl+C or SIGTERM
fn shutdown_channel() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = tx.send(()).await;
    });
    rx
}

/// One shutdown receiver per concurrently running manager
fn shutdown_channels(count: usize) -> Vec<mpsc::Receiver<()>> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..count).map(|_| mpsc::channel::<()>(1)).unzip();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        for tx in senders {
            let _ = tx.send(()).await;
        }
    });
    receivers
}

/// Initialize tracing/logging; `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,message_relay=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
