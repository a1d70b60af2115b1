//! copybot - headless Polymarket copy-trading services.
//!
//! Subcommands cover the two long-running loops (watcher, worker), the
//! encrypted key vault, pair management, operator pause/resume and a status
//! dump. Exit codes: 0 ok, 2 configuration error, 1 fatal runtime error.

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

use copybot_backend::chain::{HttpRpc, SourceWatcher};
use copybot_backend::config::{config_err, Config, ConfigError};
use copybot_backend::db::Db;
use copybot_backend::executor::build_executor;
use copybot_backend::gamma::{GammaClient, MarketMetaSource, NullMetaSource};
use copybot_backend::lock::InstanceLock;
use copybot_backend::models::Side;
use copybot_backend::notifier::spawn_notifier;
use copybot_backend::store::runtime::{KEY_KILL_SWITCH, KEY_MANUAL_PAUSE};
use copybot_backend::store::{
    pairs::NewPair, OrderStore, PairStore, RuntimeStore, SignalStore, VaultStore,
};
use copybot_backend::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "copybot")]
#[command(about = "Polymarket copy-trading watcher, worker and operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tail the chain for source-wallet fills and record trade signals
    RunWatcher,
    /// Mirror signals into orders, execute and reconcile them
    RunWorker,
    /// Manage encrypted signing keys
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
    /// Manage source/follower pairs
    Pair {
        #[command(subcommand)]
        command: PairCommands,
    },
    /// Insert a mock trade signal for pipeline testing
    InjectSignal(InjectSignalArgs),
    /// Pause trading (pre-trade checks deny until resume)
    Pause,
    /// Resume trading and clear the kill switch
    Resume,
    /// Show recent signals, orders, executions and service heartbeats
    Status,
}

#[derive(Subcommand, Debug)]
enum VaultCommands {
    /// Store a secret under a key ref; the secret is read from stdin
    Add {
        /// Key reference, e.g. vault://main
        key_ref: String,
    },
    /// List stored key refs
    List,
}

#[derive(Subcommand, Debug)]
enum PairCommands {
    /// Register a source/follower pair
    Add(PairAddArgs),
    /// List configured pairs
    List,
    /// Delete a pair (historical signals and orders are kept)
    Remove { pair_id: i64 },
}

#[derive(ClapArgs, Debug)]
struct PairAddArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    follower: String,
    #[arg(long)]
    key_ref: String,
    #[arg(long, default_value_t = 0.0)]
    budget_usdc: f64,
    #[arg(long)]
    source_alias: Option<String>,
    #[arg(long)]
    follower_label: Option<String>,
    #[arg(long, default_value = "paper")]
    mode: String,
    #[arg(long, default_value = "absolute")]
    sizing: String,
    #[arg(long, default_value_t = 1.0)]
    min_order_usdc: f64,
    #[arg(long)]
    max_order_usdc: Option<f64>,
    #[arg(long, default_value_t = 300)]
    max_slippage_bps: i64,
    #[arg(long, default_value_t = 3)]
    max_consecutive_failures: i64,
    #[arg(long, default_value_t = 3.0)]
    initial_matic: f64,
    #[arg(long, default_value_t = 0.5)]
    min_matic_alert: f64,
    /// Source portfolio baseline; enables proportional sizing when set
    #[arg(long)]
    source_portfolio_usdc: Option<f64>,
}

#[derive(ClapArgs, Debug)]
struct InjectSignalArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    side: String,
    #[arg(long)]
    notional_usdc: f64,
    #[arg(long)]
    price: Option<f64>,
    #[arg(long)]
    token_id: Option<String>,
    #[arg(long)]
    market_slug: Option<String>,
    #[arg(long)]
    outcome: Option<String>,
}

async fn run_watcher(cfg: Config) -> Result<()> {
    let rpc_url = cfg.require_rpc_url()?;
    let exchanges = cfg.require_exchanges()?;
    let db = Db::open(&cfg.db_path)?;
    let _lock = InstanceLock::acquire(&cfg.db_path, "watcher")?;

    let rpc = Arc::new(HttpRpc::new(rpc_url)?);
    let mut watcher = SourceWatcher::new(
        rpc,
        SignalStore::new(db.clone()),
        RuntimeStore::new(db, &cfg.db_path),
        cfg.watcher.clone(),
        exchanges,
    )
    .await?;
    watcher.run().await
}

async fn run_worker(cfg: Config) -> Result<()> {
    if cfg.worker.executor_mode == "live" {
        cfg.require_vault_passphrase()?;
    }
    let db = Db::open(&cfg.db_path)?;
    let _lock = InstanceLock::acquire(&cfg.db_path, "worker")?;

    let notifier = spawn_notifier(db.clone(), cfg.telegram.clone());
    let executor = build_executor(
        &cfg.worker,
        &cfg.clob,
        VaultStore::new(db.clone()),
        cfg.vault_passphrase.clone(),
    );
    let meta: Arc<dyn MarketMetaSource> = if std::env::var("COPYBOT_DISABLE_MARKET_FILTER")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
    {
        Arc::new(NullMetaSource)
    } else {
        Arc::new(GammaClient::new())
    };
    let rpc = match cfg.watcher.rpc_url.clone() {
        Some(url) => Some(Arc::new(HttpRpc::new(url)?) as Arc<dyn copybot_backend::chain::ChainRpc>),
        None => None,
    };

    let mut worker = Worker::new(
        db,
        &cfg.db_path,
        executor,
        notifier,
        meta,
        rpc,
        cfg.usdc_address.clone(),
        cfg.worker.clone(),
        cfg.risk.clone(),
    );
    worker.run().await
}

fn read_secret_from_stdin() -> Result<String> {
    eprint!("secret (mnemonic or 64-hex key): ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| config_err(format!("failed to read secret from stdin: {e}")))?;
    let secret = line.trim().to_string();
    if secret.is_empty() {
        return Err(config_err("empty secret"));
    }
    Ok(secret)
}

async fn run_command(cli: Cli, cfg: Config) -> Result<()> {
    match cli.command {
        Commands::RunWatcher => run_watcher(cfg).await,
        Commands::RunWorker => run_worker(cfg).await,
        Commands::Vault { command } => {
            let passphrase = cfg.require_vault_passphrase()?;
            let db = Db::open(&cfg.db_path)?;
            let vault = VaultStore::new(db);
            match command {
                VaultCommands::Add { key_ref } => {
                    let secret = read_secret_from_stdin()?;
                    vault.upsert_key(&key_ref, &secret, &passphrase).await?;
                    println!("stored {key_ref}");
                }
                VaultCommands::List => {
                    for row in vault.list_keys().await? {
                        println!("{}\t{}\tcreated={}", row.key_ref, row.status, row.created_at);
                    }
                }
            }
            Ok(())
        }
        Commands::Pair { command } => {
            let db = Db::open(&cfg.db_path)?;
            let pairs = PairStore::new(db);
            match command {
                PairCommands::Add(args) => {
                    let id = pairs
                        .create_pair(&NewPair {
                            source_address: args.source,
                            follower_address: args.follower,
                            source_alias: args.source_alias,
                            follower_label: args.follower_label,
                            budget_usdc: args.budget_usdc,
                            key_ref: args.key_ref,
                            mode: args.mode,
                            active: true,
                            sizing_policy: args.sizing,
                            min_order_usdc: args.min_order_usdc,
                            max_order_usdc: args.max_order_usdc,
                            max_slippage_bps: args.max_slippage_bps,
                            max_consecutive_failures: args.max_consecutive_failures,
                            initial_matic: args.initial_matic,
                            min_matic_alert: args.min_matic_alert,
                            source_portfolio_usdc: args.source_portfolio_usdc,
                            skip_key_ref_check: false,
                        })
                        .await?;
                    println!("pair {id} created");
                }
                PairCommands::List => {
                    for pair in pairs.list_pairs().await? {
                        println!(
                            "#{} {} {} -> {} budget={:.2} min={:.2} max={} volume={:.2}",
                            pair.id,
                            if pair.active { "active" } else { "inactive" },
                            pair.source_alias.as_deref().unwrap_or(&pair.source_address),
                            pair.follower_label.as_deref().unwrap_or(&pair.follower_address),
                            pair.budget_usdc,
                            pair.min_order_usdc,
                            pair.max_order_usdc
                                .map(|v| format!("{v:.2}"))
                                .unwrap_or_else(|| "-".into()),
                            pair.cumulative_source_volume_usdc,
                        );
                    }
                }
                PairCommands::Remove { pair_id } => {
                    if pairs.delete_pair(pair_id).await? {
                        println!("pair {pair_id} removed");
                    } else {
                        println!("pair {pair_id} not found");
                    }
                }
            }
            Ok(())
        }
        Commands::InjectSignal(args) => {
            let side = Side::parse(&args.side)
                .ok_or_else(|| config_err(format!("invalid side: {}", args.side)))?;
            let db = Db::open(&cfg.db_path)?;
            let signals = SignalStore::new(db);
            let id = signals
                .create_mock_signal(
                    &args.source,
                    side,
                    args.notional_usdc,
                    args.price,
                    args.market_slug.as_deref(),
                    args.token_id.as_deref(),
                    args.outcome.as_deref(),
                )
                .await?;
            println!("signal {id} injected");
            Ok(())
        }
        Commands::Pause => {
            let db = Db::open(&cfg.db_path)?;
            RuntimeStore::new(db, &cfg.db_path)
                .set_flag(KEY_MANUAL_PAUSE, true)
                .await?;
            println!("trading paused");
            Ok(())
        }
        Commands::Resume => {
            let db = Db::open(&cfg.db_path)?;
            let runtime = RuntimeStore::new(db, &cfg.db_path);
            runtime.set_flag(KEY_MANUAL_PAUSE, false).await?;
            runtime.set_flag(KEY_KILL_SWITCH, false).await?;
            println!("trading resumed, kill switch cleared");
            Ok(())
        }
        Commands::Status => {
            let db = Db::open(&cfg.db_path)?;
            let signals = SignalStore::new(db.clone());
            let orders = OrderStore::new(db.clone());
            let runtime = RuntimeStore::new(db, &cfg.db_path);

            println!("-- services --");
            for service in runtime.list_services().await? {
                println!(
                    "{}\tpid={}\tupdated={}\t{}",
                    service.component,
                    service.pid,
                    service.updated_at,
                    service.extra_json.as_deref().unwrap_or("-"),
                );
            }
            println!("-- recent signals --");
            for signal in signals.list_recent(10).await? {
                println!(
                    "#{} {} {} {:.4} USDC price={}",
                    signal.id,
                    signal.source_address,
                    signal.side,
                    signal.source_notional_usdc,
                    signal
                        .source_price
                        .map(|p| format!("{p:.4}"))
                        .unwrap_or_else(|| "-".into()),
                );
            }
            println!("-- recent orders --");
            for order in orders.list_recent_orders(10).await? {
                println!(
                    "#{} pair={} signal={} {} adj={:.4} {}",
                    order.id,
                    order.pair_id,
                    order.trade_signal_id,
                    order.status,
                    order.adjusted_notional_usdc,
                    order.blocked_reason.as_deref().unwrap_or(""),
                );
            }
            println!("-- recent executions --");
            for execution in orders.list_recent_executions(10).await? {
                println!(
                    "#{} order={} {} {} {}",
                    execution.id,
                    execution.mirror_order_id,
                    execution.status,
                    execution
                        .executed_notional_usdc
                        .map(|v| format!("{v:.4}"))
                        .unwrap_or_else(|| "-".into()),
                    execution.fail_reason.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    match run_command(cli, cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
