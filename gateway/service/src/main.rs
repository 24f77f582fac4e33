// Copyright (c) 2024 The Botho Foundation

//! BTH Gateway Service
//!
//! Issues deposit addresses for payment sessions, watches them for deposits
//! and forwards confirmed funds to the consolidation addresses.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use zeroize::Zeroizing;

use bth_gateway_core::{
    keys::derivation_path, parse_amount, Cryptocurrency, GatewayConfig, KeyDeriver, MasterSeed,
    SessionStatus,
};
use bth_gateway_service::{
    price, ChainRegistry, Engine, EvmChainClient, PriceOracle, SessionStore, StoredSession,
};

/// Environment variable holding the mnemonic when no file is configured.
const MNEMONIC_ENV: &str = "GATEWAY_MNEMONIC";
/// Optional BIP-39 passphrase.
const PASSPHRASE_ENV: &str = "GATEWAY_PASSPHRASE";

#[derive(Parser)]
#[command(name = "bth-gateway")]
#[command(about = "Deposit-address payment gateway")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Process open sessions once and exit
        #[arg(long)]
        once: bool,
    },

    /// Create or upgrade the database schema
    Migrate,

    /// Open a payment session and print its deposit address
    Open {
        /// Coin code (eth, bnb, matic)
        coin: Cryptocurrency,

        /// Expected amount in whole coins, e.g. 0.25
        amount: String,
    },

    /// Show one session as JSON
    Show { id: Uuid },

    /// List sessions by status, or status counts when no status is given
    List {
        #[arg(short, long)]
        status: Option<SessionStatus>,

        /// List every session the engine still works on
        #[arg(long, conflicts_with = "status")]
        open: bool,
    },

    /// Return a session from needs_review to its previous status
    Release {
        id: Uuid,

        /// Note recorded in the session history
        #[arg(short, long, default_value = "released by operator")]
        note: String,
    },

    /// Print the payment address for a derivation index
    Derive {
        coin: Cryptocurrency,

        #[arg(short, long)]
        index: u64,
    },

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match GatewayConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    match cli.command {
        Commands::Run { once } => run_engine(config, once).await,
        Commands::Migrate => {
            open_store(&config)?;
            info!("Database migration complete");
            Ok(())
        }
        Commands::Open { coin, amount } => open_session(config, coin, &amount),
        Commands::Show { id } => {
            let store = open_store(&config)?;
            let stored = store
                .get(&id)?
                .with_context(|| format!("session {} not found", id))?;
            print_session(&stored)
        }
        Commands::List { status, open } => list_sessions(&config, status, open),
        Commands::Release { id, note } => {
            let store = open_store(&config)?;
            let stored = store.release_review(&id, &note)?;
            println!("Session {} is now {}", id, stored.session.status);
            Ok(())
        }
        Commands::Derive { coin, index } => {
            let deriver = load_deriver(&config)?;
            let coin_type = config.coin_type(coin);
            let key = deriver.derive_within(coin_type, index, config.coin(coin)?.max_index)?;
            println!("{}  {}", derivation_path(coin_type, index), key.address);
            Ok(())
        }
        Commands::ValidateConfig => {
            println!("Configuration is valid.");
            println!("  Database: {}", config.gateway.db_path);
            println!("  Poll interval: {}s", config.gateway.poll_interval_secs);
            for (coin, coin_config) in &config.coins {
                println!(
                    "  {}: chain id {}, {} confirmations, {} RPC endpoint(s), forwarding to {}",
                    coin,
                    config.chain_id(*coin),
                    config.confirmations_required(*coin),
                    coin_config.rpc_endpoints.len(),
                    coin_config.forwarding_address
                );
            }
            println!("  Fee tiers: {}", config.fees.tiers.len());
            println!("  Price source: {:?}", config.price.source);
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn open_store(config: &GatewayConfig) -> Result<SessionStore> {
    info!("Opening database at {}", config.gateway.db_path);
    let store = SessionStore::open(Path::new(&config.gateway.db_path))?;
    store.migrate()?;
    Ok(store)
}

/// Load the master seed from the mnemonic file or the environment.
fn load_deriver(config: &GatewayConfig) -> Result<KeyDeriver> {
    let phrase = match &config.gateway.mnemonic_file {
        Some(path) => Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read mnemonic file {}", path))?,
        ),
        None => Zeroizing::new(std::env::var(MNEMONIC_ENV).with_context(|| {
            format!("No mnemonic_file configured and {} is not set", MNEMONIC_ENV)
        })?),
    };
    let passphrase = Zeroizing::new(std::env::var(PASSPHRASE_ENV).unwrap_or_default());

    let seed = MasterSeed::from_mnemonic(phrase.trim(), &passphrase)?;
    Ok(KeyDeriver::new(seed))
}

fn build_engine(config: GatewayConfig) -> Result<Engine> {
    let store = open_store(&config)?;
    let deriver = Arc::new(load_deriver(&config)?);

    let mut chains = ChainRegistry::new();
    for coin in config.coins.keys() {
        let client = EvmChainClient::from_config(&config, *coin)
            .with_context(|| format!("Failed to set up {} client", coin))?;
        chains.insert(Arc::new(client));
    }

    let prices: Arc<dyn PriceOracle> = Arc::from(price::from_settings(
        &config.price,
        std::time::Duration::from_secs(config.gateway.rpc_timeout_secs),
    )?);

    Ok(Engine::new(Arc::new(config), store, chains, prices, deriver))
}

async fn run_engine(config: GatewayConfig, once: bool) -> Result<()> {
    info!("BTH Gateway Service starting...");
    for (coin, coin_config) in &config.coins {
        info!(
            "  {}: {} endpoint(s), {} confirmations, forwarding to {}",
            coin,
            coin_config.rpc_endpoints.len(),
            config.confirmations_required(*coin),
            coin_config.forwarding_address
        );
    }

    let engine = build_engine(config)?;

    if once {
        let summary = engine.tick().await?;
        info!(
            "Processed {} sessions, {} failed",
            summary.processed, summary.failed
        );
        return Ok(());
    }

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown.send(());
        }
    });

    engine.run().await?;
    Ok(())
}

fn open_session(config: GatewayConfig, coin: Cryptocurrency, amount: &str) -> Result<()> {
    let expected = parse_amount(amount, coin.decimals())
        .with_context(|| format!("Invalid amount {:?}", amount))?;
    let engine = build_engine(config)?;
    let stored = engine.open_session(coin, expected)?;
    print_session(&stored)
}

fn list_sessions(config: &GatewayConfig, status: Option<SessionStatus>, open: bool) -> Result<()> {
    let store = open_store(config)?;
    let sessions = match (status, open) {
        (Some(status), _) => store.list_by_status(status)?,
        (None, true) => store.list_open()?,
        (None, false) => {
            for (status, count) in store.status_counts()? {
                println!("{:<16} {}", status, count);
            }
            return Ok(());
        }
    };

    for stored in &sessions {
        let session = &stored.session;
        println!(
            "{}  {:<5} {:<14} {}  received {}",
            session.id,
            session.cryptocurrency,
            session.status,
            session.payment_address,
            bth_gateway_core::format_amount(
                session.received_amount,
                session.cryptocurrency.decimals()
            )
        );
    }
    println!("{} session(s)", sessions.len());
    Ok(())
}

fn print_session(stored: &StoredSession) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&stored.session)?);
    println!("version: {}", stored.version);
    Ok(())
}
