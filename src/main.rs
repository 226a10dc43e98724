// =============================================================================
// TIDESWAP - Main Entry Point
// Cross-chain atomic swaps from the UTXO side
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secp256k1::SecretKey;
use tracing::error;

use tideswap::builder::HtlcTxBuilder;
use tideswap::counterchain::RelayClient;
use tideswap::engine::{EngineConfig, SwapEngine};
use tideswap::error::SwapError;
use tideswap::fees::FlatFee;
use tideswap::gateway::{ChainGateway, EsploraGateway};
use tideswap::htlc;
use tideswap::order::{Order, OrderId, Provenance};
use tideswap::secret::Secret;
use tideswap::store::OrderStore;
use tideswap::tracker::{ConfirmationTracker, TrackerConfig};
use tideswap::tx::Network;
use tideswap::utxo::UtxoReservations;
use tideswap::{format_units, DEFAULT_FLAT_FEE};

const FUNDER_KEY_ENV: &str = "TIDESWAP_FUNDER_KEY";
const CLAIMANT_KEY_ENV: &str = "TIDESWAP_CLAIMANT_KEY";

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "tideswap")]
#[command(version)]
#[command(about = "HTLC atomic swaps between a UTXO chain and account-model chains", long_about = None)]
struct Cli {
    /// Order database directory
    #[arg(long, default_value = "tideswap_data", global = true)]
    data_dir: String,

    /// Esplora-style API endpoint; repeat for fallbacks
    #[arg(long, default_value = "https://blockstream.info/testnet/api", global = true)]
    esplora: Vec<String>,

    /// Counter-chain relay service URL
    #[arg(long, default_value = "http://127.0.0.1:3001", global = true)]
    relay_url: String,

    /// Bearer token for the relay service
    #[arg(long, global = true)]
    relay_key: Option<String>,

    /// Use mainnet address versions
    #[arg(long, global = true)]
    mainnet: bool,

    /// Flat transaction fee in base units
    #[arg(long, default_value_t = DEFAULT_FLAT_FEE, global = true)]
    fee: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a swap order: quote, commitment, HTLC address
    Create {
        /// Source chain id (e.g. bitcoin_testnet)
        #[arg(long, default_value = "bitcoin_testnet")]
        source: String,
        /// Destination chain id (e.g. 1 for Ethereum)
        #[arg(long)]
        dest: String,
        /// Amount in base units of the source chain
        amount: u64,
        /// Counter-party public key (compressed, hex)
        claimant_pubkey: String,
    },

    /// Broadcast the funding transaction for an order
    Fund {
        /// Order id (hex)
        order: String,
    },

    /// Show one order
    Status {
        /// Order id (hex)
        order: String,
    },

    /// List all orders
    List,

    /// Reveal the secret to the relay once funding is final
    SubmitSecret {
        /// Order id (hex)
        order: String,
    },

    /// Record a secret observed on the destination chain
    ObserveSecret {
        /// Order id (hex)
        order: String,
        /// Secret preimage (hex)
        secret: String,
    },

    /// Claim the HTLC output with the revealed secret
    Claim {
        /// Order id (hex)
        order: String,
        /// Payout address
        payout: String,
    },

    /// Refund the HTLC output after the timelock
    Refund {
        /// Order id (hex)
        order: String,
    },

    /// Abandon an order that was never funded
    Abandon {
        /// Order id (hex)
        order: String,
    },

    /// Show the funder address and its balance
    Balance,

    /// Watch active orders until they confirm or expire
    Watch {
        /// Poll interval in seconds
        #[arg(long, default_value = "10")]
        interval: u64,
    },

    /// Disassemble an order's HTLC redeem script
    DecodeScript {
        /// Order id (hex)
        order: String,
    },
}

// =============================================================================
// Wiring
// =============================================================================

struct App {
    engine: Arc<SwapEngine>,
    gateway: Arc<dyn ChainGateway>,
}

fn build_app(cli: &Cli) -> Result<App, SwapError> {
    let network = if cli.mainnet {
        Network::Mainnet
    } else {
        Network::Testnet
    };

    let funder_key = key_from_env(FUNDER_KEY_ENV)?;
    let store = Arc::new(OrderStore::open(&cli.data_dir)?);
    let gateway: Arc<dyn ChainGateway> = Arc::new(EsploraGateway::new(cli.esplora.clone())?);
    let relay = Arc::new(RelayClient::new(cli.relay_url.clone(), cli.relay_key.clone()));
    let reservations = Arc::new(UtxoReservations::new());
    let builder = HtlcTxBuilder::new(
        gateway.clone(),
        Arc::new(FlatFee(cli.fee)),
        reservations.clone(),
        network,
    );

    let engine = Arc::new(SwapEngine::new(
        store,
        gateway.clone(),
        relay,
        builder,
        reservations,
        funder_key,
        EngineConfig {
            network,
            provenance: Provenance::Live,
            ..EngineConfig::default()
        },
    ));

    Ok(App { engine, gateway })
}

fn key_from_env(var: &str) -> Result<SecretKey, SwapError> {
    let hex_key = std::env::var(var)
        .map_err(|_| SwapError::Validation(format!("{} is not set", var)))?;
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| SwapError::Validation(format!("{}: invalid hex: {}", var, e)))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| SwapError::Validation(format!("{}: invalid key: {}", var, e)))
}

fn parse_order_id(s: &str) -> Result<OrderId, SwapError> {
    OrderId::from_hex(s)
}

// =============================================================================
// Commands
// =============================================================================

fn print_order(order: &Order) {
    println!("Order       {}", order.id.to_hex());
    println!("  status    {}", order.status);
    println!("  route     {} -> {}", order.source_chain, order.dest_chain);
    println!("  amount    {}", format_units(order.amount));
    println!("  htlc      {}", order.htlc_address);
    println!("  hashlock  {}", order.commitment);
    println!("  timelock  {}", order.timelock);
    if let Some(txid) = &order.funding_txid {
        println!("  funding   {}", txid);
    }
    if let Some(txid) = &order.claim_txid {
        println!("  claim     {}", txid);
    }
    if let Some(txid) = &order.refund_txid {
        println!("  refund    {}", txid);
    }
    if let Some(id) = &order.counter_order_id {
        println!("  relay     {}", id);
    }
    if let Some(reason) = &order.failure {
        println!("  failure   {}", reason);
    }
}

async fn cmd_create(
    app: &App,
    source: String,
    dest: String,
    amount: u64,
    claimant_pubkey: String,
) -> Result<(), SwapError> {
    let pubkey = hex::decode(claimant_pubkey.trim())
        .map_err(|e| SwapError::Validation(format!("Invalid claimant pubkey hex: {}", e)))?;
    let order = app.engine.create_order(&source, &dest, amount, &pubkey).await?;

    println!("Created order {}", order.id.to_hex());
    print_order(&order);
    println!();
    println!("Fund it with: tideswap fund {}", order.id.to_hex());
    Ok(())
}

async fn cmd_fund(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let funded = app.engine.fund_order(id).await?;
    println!(
        "Funding broadcast: {}",
        funded.funding_txid.as_deref().unwrap_or("?")
    );
    Ok(())
}

async fn cmd_status(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    print_order(&app.engine.get_order(&id)?);
    Ok(())
}

async fn cmd_list(app: &App) -> Result<(), SwapError> {
    let orders = app.engine.list_orders()?;
    if orders.is_empty() {
        println!("No orders");
        return Ok(());
    }
    for order in orders {
        println!(
            "{}  {:<18} {:>14}  {} -> {}",
            order.id,
            order.status.to_string(),
            format_units(order.amount),
            order.source_chain,
            order.dest_chain
        );
    }
    Ok(())
}

async fn cmd_submit_secret(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let updated = app.engine.submit_secret(id).await?;
    println!("Secret submitted, order is now {}", updated.status);
    Ok(())
}

async fn cmd_observe_secret(app: &App, order: String, secret: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let observed = Secret::from_hex(&secret)?;
    let updated = app.engine.observe_secret(id, &observed).await?;
    println!("Secret recorded, order is now {}", updated.status);
    Ok(())
}

async fn cmd_claim(app: &App, order: String, payout: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let claimant_key = key_from_env(CLAIMANT_KEY_ENV)?;
    let claimed = app.engine.claim_order(id, &claimant_key, &payout).await?;
    println!("Claimed: {}", claimed.claim_txid.as_deref().unwrap_or("?"));
    Ok(())
}

async fn cmd_refund(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let refunded = app.engine.refund_order(id).await?;
    println!("Refunded: {}", refunded.refund_txid.as_deref().unwrap_or("?"));
    Ok(())
}

async fn cmd_abandon(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    app.engine.abandon_order(id).await?;
    println!("Order abandoned");
    Ok(())
}

async fn cmd_balance(app: &App) -> Result<(), SwapError> {
    let address = app.engine.funder_address();
    let balance = app.gateway.get_balance(address).await?;
    println!("Address     {}", address);
    println!("Confirmed   {}", format_units(balance.confirmed));
    println!("Unconfirmed {}", format_units(balance.unconfirmed));
    Ok(())
}

async fn cmd_watch(app: &App, interval: u64) -> Result<(), SwapError> {
    let tracker = ConfirmationTracker::new(
        app.engine.clone(),
        app.gateway.clone(),
        TrackerConfig {
            poll_interval: Duration::from_secs(interval),
            ..TrackerConfig::default()
        },
    );

    let resumed = tracker.resume()?;
    println!("Watching {} active orders (ctrl-c to stop)", resumed);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| SwapError::Validation(format!("Signal handler failed: {}", e)))?;
    println!("Stopped");
    Ok(())
}

async fn cmd_decode_script(app: &App, order: String) -> Result<(), SwapError> {
    let id = parse_order_id(&order)?;
    let record = app.engine.get_order(&id)?;
    println!("{}", htlc::disassemble(&record.redeem_script));
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let app = match build_app(&cli) {
        Ok(app) => app,
        Err(e) => {
            error!("startup failed: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Create { source, dest, amount, claimant_pubkey } => {
            cmd_create(&app, source, dest, amount, claimant_pubkey).await
        }
        Commands::Fund { order } => cmd_fund(&app, order).await,
        Commands::Status { order } => cmd_status(&app, order).await,
        Commands::List => cmd_list(&app).await,
        Commands::SubmitSecret { order } => cmd_submit_secret(&app, order).await,
        Commands::ObserveSecret { order, secret } => {
            cmd_observe_secret(&app, order, secret).await
        }
        Commands::Claim { order, payout } => cmd_claim(&app, order, payout).await,
        Commands::Refund { order } => cmd_refund(&app, order).await,
        Commands::Abandon { order } => cmd_abandon(&app, order).await,
        Commands::Balance => cmd_balance(&app).await,
        Commands::Watch { interval } => cmd_watch(&app, interval).await,
        Commands::DecodeScript { order } => cmd_decode_script(&app, order).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
