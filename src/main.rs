// =============================================================================
// Trendhound — BiGe 7x perpetual-futures trend engine
// =============================================================================
//
// Three entry points:
//   live      — trade the configured symbols against the venue
//   shadow    — run the same loop against a simulated book (no orders)
//   download  — bulk-fetch historical OHLCV for offline analysis
//
// Venue credentials (API_KEY / API_SECRET) and notifier credentials
// (BOT_TOKEN / CHAT_ID) come from the environment; a .env file is honoured.
// =============================================================================

mod allocator;
mod binance;
mod config;
mod downloader;
mod engine;
mod indicators;
mod notifier;
mod state;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::binance::FuturesClient;
use crate::config::{Credentials, StrategyParams};
use crate::downloader::{BulkDownloader, DownloadConfig, SymbolSource};
use crate::engine::{Controller, ControllerSettings, LiveRoute, ShadowRoute};
use crate::notifier::Notifier;

#[derive(Parser)]
#[command(name = "trendhound", version, about = "BiGe 7x perpetual-futures trend engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live trading controller against the venue.
    Live(RunArgs),
    /// Mirror live decisions into a simulated book without placing orders.
    Shadow(ShadowArgs),
    /// Bulk-download historical OHLCV data for offline analysis.
    Download(DownloadArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Symbols to trade, comma separated.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "BTCUSDT,ETHUSDT,SOLUSDT,BNBUSDT,XRPUSDT"
    )]
    symbols: Vec<String>,

    /// Kline timeframe, e.g. 1h or 4h.
    #[arg(long, default_value = "4h")]
    timeframe: String,

    /// Seconds between polling ticks.
    #[arg(long, default_value_t = 60)]
    interval: u64,

    /// Strategy parameter file (JSON); defaults to the Phase-1 profile.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ShadowArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Simulated starting balance in USDT.
    #[arg(long, default_value_t = 10_000)]
    start_cash: u64,

    /// Directory for the shadow signal and equity journals.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[derive(Args)]
struct DownloadArgs {
    /// Explicit symbol list; when omitted the top-N selection is used.
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Number of symbols to pick by 24h quote volume.
    #[arg(long, default_value_t = 100)]
    top: usize,

    /// Minimum 24h quote volume for top-N selection.
    #[arg(long, default_value_t = 1_000_000.0)]
    min_volume: f64,

    /// Timeframes to download, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "1d,4h,1h,15m")]
    timeframes: Vec<String>,

    /// Range start (YYYY-MM-DD); defaults to 2020-01-01.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Range end (YYYY-MM-DD); defaults to now.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Parallel download workers.
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Outbound request budget per minute.
    #[arg(long, default_value_t = 1100)]
    requests_per_minute: u32,

    /// Output root for the per-task CSV files.
    #[arg(long, default_value = "data/raw")]
    output: PathBuf,

    /// Ignore the checkpoint and re-download everything.
    #[arg(long)]
    no_resume: bool,

    /// Retry rounds for failed tasks.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Live(args) => run_live(args).await,
        Command::Shadow(args) => run_shadow(args).await,
        Command::Download(args) => run_download(args).await,
    }
}

fn normalize_symbols(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn controller_settings(args: &RunArgs) -> Result<ControllerSettings> {
    anyhow::ensure!(
        types::interval_ms(&args.timeframe).is_some(),
        "unknown timeframe '{}'",
        args.timeframe
    );
    Ok(ControllerSettings::new(
        normalize_symbols(&args.symbols),
        args.timeframe.clone(),
        Duration::from_secs(args.interval),
    ))
}

fn load_params(path: Option<&PathBuf>) -> Result<StrategyParams> {
    let params = match path {
        Some(p) => StrategyParams::load(p)?,
        None => StrategyParams::default(),
    };
    params.validate()?;
    Ok(params)
}

async fn run_live(args: RunArgs) -> Result<()> {
    let params = load_params(args.config.as_ref())?;
    let credentials = Credentials::from_env()?;
    let notifier = Arc::new(Notifier::from_env()?);

    let client = Arc::new(FuturesClient::new(
        credentials.api_key.clone(),
        credentials.api_secret.clone(),
    ));
    let route = Arc::new(LiveRoute::new(client.clone()));
    let settings = controller_settings(&args)?;

    let controller =
        Controller::initialize(client, route, notifier, params, settings).await?;
    controller.run().await
}

async fn run_shadow(args: ShadowArgs) -> Result<()> {
    let params = load_params(args.run.config.as_ref())?;
    let notifier = Arc::new(Notifier::from_env()?);

    // Klines are still read from the venue; no credentials are needed for
    // public market data.
    let client = Arc::new(FuturesClient::public());

    std::fs::create_dir_all(&args.data_dir)?;
    let route = Arc::new(ShadowRoute::new(
        Decimal::from(args.start_cash),
        params.leverage,
        args.data_dir,
    ));
    let settings = controller_settings(&args.run)?;

    let controller =
        Controller::initialize(client, route, notifier, params, settings).await?;
    controller.run().await
}

async fn run_download(args: DownloadArgs) -> Result<()> {
    let symbol_source = match args.symbols {
        Some(list) if !list.is_empty() => SymbolSource::Explicit(normalize_symbols(&list)),
        _ => SymbolSource::TopByVolume {
            n: args.top,
            min_quote_volume: args.min_volume,
        },
    };

    let config = DownloadConfig {
        symbol_source,
        timeframes: args.timeframes,
        start: args.start,
        end: args.end,
        workers: args.workers,
        requests_per_minute: args.requests_per_minute,
        burst: 20,
        output_dir: args.output,
        resume: !args.no_resume,
        max_retries: args.max_retries,
    };

    let client = Arc::new(FuturesClient::public());
    let downloader = Arc::new(BulkDownloader::new(client, config));
    let report = downloader.run().await?;

    info!(
        successful = report.successful_tasks,
        failed = report.failed_tasks,
        rows = report.total_rows,
        rate = %report.success_rate,
        "download run complete"
    );
    Ok(())
}
