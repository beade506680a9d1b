//! Chainwatch CLI
//!
//! Command-line interface for the chainwatch supply and holdings poller.

use std::process::ExitCode;
use std::sync::Arc;

use chainwatch::alerting::{sink_from_config, AlertSink, CycleReport, StateDiffPoller};
use chainwatch::config::LoggingConfig;
use chainwatch::governor::RequestGovernor;
use chainwatch::models::{Snapshot, Target, TargetKind, DEFAULT_CHAIN};
use chainwatch::provider::HttpSnapshotSource;
use chainwatch::store::{JsonFileStore, TargetStore};
use chainwatch::{Config, Error};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Chainwatch - rate-governed NFT supply and wallet alerts
#[derive(Parser)]
#[command(name = "chainwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "CHAINWATCH_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll all targets until interrupted
    Run,

    /// Run one supply cycle and one holdings cycle, then exit
    Once,

    /// List tracked targets
    Targets,

    /// Add a target, replacing any target with the same id
    Add {
        #[command(subcommand)]
        target: AddTarget,
    },

    /// Stop tracking a target
    Remove {
        /// Target id
        id: String,
    },

    /// Fetch a target's current state on each chain without alerting
    Check {
        /// Target id
        id: String,
    },

    /// Clear threshold latches so supply watches can fire again
    ResetAlerts {
        /// Only reset this target
        #[arg(long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
enum AddTarget {
    /// Alert once when a collection's supply reaches a threshold
    Supply {
        /// Target id
        id: String,
        /// Contract address or collection slug
        locator: String,
        /// Supply count that triggers the alert
        #[arg(long)]
        threshold: u64,
        #[arg(long, default_value = DEFAULT_CHAIN)]
        chain: String,
        /// Display name for alerts
        #[arg(long)]
        name: Option<String>,
    },

    /// Alert on every item a wallet newly holds
    Wallet {
        /// Target id
        id: String,
        /// Wallet address (0x-prefixed)
        address: String,
        /// Chains to watch; repeat or comma-separate
        #[arg(long = "chain", value_delimiter = ',')]
        chains: Vec<String>,
        /// Display name for alerts
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging, cli.verbose);

    let result = match cli.command {
        Commands::Run => run_poller(config).await,
        Commands::Once => run_once(config, cli.format).await,
        Commands::Targets => run_targets(config, cli.format).await,
        Commands::Add { target } => run_add(config, target).await,
        Commands::Remove { id } => run_remove(config, &id).await,
        Commands::Check { id } => run_check(config, &id, cli.format).await,
        Commands::ResetAlerts { target } => run_reset_alerts(config, target).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format.eq_ignore_ascii_case("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

struct App {
    store: Arc<JsonFileStore>,
    governor: Arc<RequestGovernor>,
    poller: StateDiffPoller,
}

async fn build_app(config: &Config, shutdown: CancellationToken) -> anyhow::Result<App> {
    let store = Arc::new(JsonFileStore::open(&config.store.path).await?);
    let source = Arc::new(HttpSnapshotSource::new(config.provider.clone())?);
    let sink: Arc<dyn AlertSink> = Arc::from(sink_from_config(&config.notifier)?);
    let governor = Arc::new(RequestGovernor::from_config(config, shutdown));

    let poller = StateDiffPoller::from_config(
        config,
        store.clone(),
        source,
        sink,
        Arc::clone(&governor),
    );

    Ok(App {
        store,
        governor,
        poller,
    })
}

fn warn_missing_keys(config: &Config) {
    if config.provider.alchemy_api_key.as_deref().map_or(true, str::is_empty) {
        warn!("provider.alchemy_api_key is not set; holding watches and contract supply lookups will fail");
    }
}

async fn run_poller(config: Config) -> anyhow::Result<()> {
    warn_missing_keys(&config);

    let shutdown = CancellationToken::new();
    let app = build_app(&config, shutdown.clone()).await?;
    let targets = app.store.list_targets().await?.len();

    info!(
        store = %app.store.path().display(),
        targets,
        tokens_per_interval = config.governor.tokens_per_interval,
        max_concurrent = config.governor.max_concurrent,
        "Starting chainwatch"
    );

    let refill = app.governor.start();
    let poller = app.poller.clone();
    let poller_shutdown = shutdown.clone();
    let polling = tokio::spawn(async move { poller.run(poller_shutdown).await });

    println!("Chainwatch polling {targets} target(s). Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    polling.await?;
    refill.await?;
    Ok(())
}

async fn run_once(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    warn_missing_keys(&config);

    let shutdown = CancellationToken::new();
    let app = build_app(&config, shutdown.clone()).await?;
    let refill = app.governor.start();

    let (supply, holding) = tokio::try_join!(
        app.poller.run_cycle(TargetKind::SupplyWatch),
        app.poller.run_cycle(TargetKind::HoldingWatch),
    )?;

    shutdown.cancel();
    refill.await?;

    match format {
        OutputFormat::Json => {
            let summary = serde_json::json!({ "supply": supply, "holding": holding });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            print_report("supply", &supply);
            print_report("holding", &holding);
        }
    }
    Ok(())
}

fn print_report(label: &str, report: &CycleReport) {
    println!(
        "{label:<8} processed={} skipped={} failed={} delivered={} suppressed={} delivery_failed={}",
        report.processed,
        report.skipped,
        report.failed,
        report.delivered,
        report.suppressed,
        report.delivery_failed
    );
}

async fn run_targets(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&config.store.path).await?;
    let targets = store.list_targets().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&targets)?),
        OutputFormat::Text => {
            if targets.is_empty() {
                println!("No targets in {}", store.path().display());
                return Ok(());
            }
            println!(
                "{:<16} {:<14} {:<24} {:<44} {:>10} LATCHED",
                "ID", "KIND", "CHAINS", "LOCATOR", "THRESHOLD"
            );
            for target in &targets {
                let threshold = target
                    .threshold
                    .map_or_else(|| "-".to_string(), |t| t.to_string());
                println!(
                    "{:<16} {:<14} {:<24} {:<44} {:>10} {}",
                    target.id,
                    target.kind.to_string(),
                    target.effective_chains().join(","),
                    target.locator,
                    threshold,
                    if target.latched { "yes" } else { "no" }
                );
            }
        }
    }
    Ok(())
}

async fn run_add(config: Config, add: AddTarget) -> anyhow::Result<()> {
    let target = match add {
        AddTarget::Supply {
            id,
            locator,
            threshold,
            chain,
            name,
        } => Target {
            name,
            ..Target::supply_watch(id, locator, chain, threshold)
        },
        AddTarget::Wallet {
            id,
            address,
            chains,
            name,
        } => Target {
            name,
            ..Target::holding_watch(id, address, chains)
        },
    }
    .normalized()?;

    for chain in &target.chains {
        if !config.provider.supported_chains.contains(chain) {
            warn!(target_id = %target.id, chain = %chain, "Chain is not in provider.supported_chains and will be skipped");
        }
    }

    let store = JsonFileStore::open(&config.store.path).await?;
    let replaced = store
        .list_targets()
        .await?
        .iter()
        .any(|t| t.id == target.id);
    store.upsert(target.clone()).await?;

    let verb = if replaced { "Replaced" } else { "Added" };
    println!(
        "{verb} {} {} on {}",
        target.kind,
        target.id,
        target.chains.join(",")
    );
    Ok(())
}

async fn run_remove(config: Config, id: &str) -> anyhow::Result<()> {
    let store = JsonFileStore::open(&config.store.path).await?;
    if !store.remove(id).await? {
        return Err(Error::not_found("target", id).into());
    }
    println!("Removed {id}");
    Ok(())
}

async fn run_check(config: Config, id: &str, format: OutputFormat) -> anyhow::Result<()> {
    warn_missing_keys(&config);

    let shutdown = CancellationToken::new();
    let app = build_app(&config, shutdown.clone()).await?;
    let refill = app.governor.start();
    let checked = app.poller.check_target(id).await;
    shutdown.cancel();
    refill.await?;

    let results = checked?;
    let threshold = app
        .store
        .list_targets()
        .await?
        .into_iter()
        .find(|t| t.id == id)
        .and_then(|t| t.threshold);

    match format {
        OutputFormat::Json => {
            let chains: Vec<_> = results
                .iter()
                .map(|(chain, outcome)| match outcome {
                    Ok(snapshot) => serde_json::json!({ "chain": chain, "snapshot": snapshot }),
                    Err(e) => serde_json::json!({ "chain": chain, "error": e.to_string() }),
                })
                .collect();
            let summary = serde_json::json!({ "target": id, "threshold": threshold, "chains": chains });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            for (chain, outcome) in &results {
                match outcome {
                    Ok(Snapshot::Supply(supply)) => {
                        let reached = threshold.is_some_and(|t| supply.count >= t);
                        println!(
                            "{chain:<12} supply={} threshold={}{}",
                            supply.count,
                            threshold.map_or_else(|| "-".to_string(), |t| t.to_string()),
                            if reached { " (reached)" } else { "" }
                        );
                        if let Some(floor) = supply.floor_price {
                            println!("{:<12} floor={floor}", "");
                        }
                    }
                    Ok(Snapshot::Holding(holdings)) => {
                        println!("{chain:<12} {} item(s)", holdings.len());
                        for item in holdings.ids() {
                            println!("{:<12} {} #{}", "", item.contract, item.token_id);
                        }
                    }
                    Err(e) => println!("{chain:<12} error: {e}"),
                }
            }
        }
    }
    Ok(())
}

async fn run_reset_alerts(config: Config, target: Option<String>) -> anyhow::Result<()> {
    let app = build_app(&config, CancellationToken::new()).await?;

    match target {
        Some(id) => {
            app.poller.reset_latch(&id).await?;
            println!("Reset alert latch for {id}");
        }
        None => {
            let count = app.poller.reset_all_latches().await?;
            println!("Reset {count} alert latch(es)");
        }
    }
    Ok(())
}
