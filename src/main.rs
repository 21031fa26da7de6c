use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reversalbot::broker::{Broker, PaperBroker};
use reversalbot::config::AppConfig;
use reversalbot::engine::EngineWorkerFactory;
use reversalbot::notify;
use reversalbot::persistence::{self, StateStore, TradeJournal};
use reversalbot::supervisor::RecoverySupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

const DEFAULT_CONFIG: &str = "reversalbot.toml";

#[derive(Parser)]
#[command(name = "reversalbot", version, about = "V-reversal trader with a self-healing supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervised trading loop until Ctrl+C
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Trade against the built-in simulated venue
        #[arg(long)]
        paper: bool,
    },
    /// Inspect or clear persisted supervisor state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the persisted state and the latest journalled trades
    Show {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// How many recent trades to list
        #[arg(long, default_value_t = 10)]
        trades: usize,
    },
    /// Delete the persisted state
    Reset {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, paper } => run(config, paper).await,
        Command::State { action } => match action {
            StateAction::Show { config, trades } => show_state(config, trades).await,
            StateAction::Reset { config } => reset_state(config).await,
        },
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reversalbot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: PathBuf) -> anyhow::Result<AppConfig> {
    AppConfig::load(Some(&path)).with_context(|| format!("loading configuration from {:?}", path))
}

async fn run(config_path: PathBuf, paper: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    if !paper {
        bail!("no live venue connector is built in; start with --paper to trade the simulated venue");
    }

    tracing::info!("🚀 ReversalBot starting");
    tracing::info!("  Symbol: {}", config.instrument.symbol);
    tracing::info!("  Pattern: {:?} over {} candles", config.detector.kind, config.detector.lookback_window);
    tracing::info!(
        "  Filter: recovery >= {}%, velocity >= {}, range <= {}",
        config.filter.recovery_pct_threshold,
        config.filter.velocity_threshold,
        config.filter.range_threshold
    );
    tracing::info!(
        "  Sizing: win rate {}, payoff {}, kelly x{}",
        config.sizing.win_rate,
        config.sizing.payoff_ratio,
        config.sizing.kelly_multiplier
    );

    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(&config.instrument, config.paper.clone()));
    let (store, journal) = persistence::open(&config.persistence)
        .await
        .context("opening persistence")?;
    let notifier = notify::from_config(&config.notify).context("building notifier")?;

    let factory = Arc::new(EngineWorkerFactory::new(
        config.clone(),
        broker.clone(),
        journal,
        notifier.clone(),
    ));

    let supervisor = RecoverySupervisor::new(config.supervisor.clone(), broker, store, notifier, factory);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut supervisor_task = tokio::spawn(supervisor.run(stop_rx));

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            let _ = stop_tx.send(true);
        }
        result = &mut supervisor_task => {
            let state = result.context("supervisor task failed")??;
            bail!(
                "supervisor stopped without a stop request (last candle {:?}, failures {})",
                state.last_processed_candle_timestamp,
                state.consecutive_failure_count
            );
        }
    }

    let state = supervisor_task.await.context("supervisor task failed")??;
    tracing::info!(
        "👋 ReversalBot stopped (last candle {:?}, failures {})",
        state.last_processed_candle_timestamp,
        state.consecutive_failure_count
    );

    Ok(())
}

async fn show_state(config_path: PathBuf, trades: usize) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (store, journal) = persistence::open(&config.persistence).await?;

    match store.load().await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("no persisted state"),
    }

    let recent = journal.recent(trades).await?;
    if recent.is_empty() {
        println!("no journalled trades");
    }
    for trade in recent {
        println!(
            "{} {:?} {} @ {} tp {} (candle {}, ticket {})",
            trade.created_at.format("%Y-%m-%d %H:%M:%S"),
            trade.direction,
            trade.volume,
            trade.entry_price,
            trade.take_profit_price,
            trade.timestamp,
            trade.ticket
        );
    }
    Ok(())
}

async fn reset_state(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (store, _) = persistence::open(&config.persistence).await?;

    store.clear().await?;
    println!("persisted state cleared");
    Ok(())
}
