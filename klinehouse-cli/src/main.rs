//! Klinehouse CLI — ingest, schema, and cache commands.
//!
//! Commands:
//! - `ingest` — resolve a selection of bulk archives, then fetch, verify,
//!   extract and load them into the destination store
//! - `schema` — create or check the destination table for a market/kind
//! - `cache status` — report cached archives and completed targets
//!
//! Logging goes to stderr through `tracing` (`RUST_LOG`, default `info`);
//! progress lines go to stdout. Ctrl-C during `ingest` lets targets in flight
//! finish and skips the rest.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use klinehouse_core::cancel::CancellationToken;
use klinehouse_core::data::{ArchiveCache, HttpSource, Selection, SymbolCatalog};
use klinehouse_core::domain::{DataKind, Interval, MarketType};
use klinehouse_core::store::SchemaManager;
use klinehouse_runner::{
    DestinationKind, IngestConfig, PipelineDriver, PipelineOutcome, RunReport, StdoutProgress,
};

#[derive(Parser)]
#[command(
    name = "klinehouse",
    about = "Klinehouse CLI — bulk market-data archive ingestion"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, verify, extract and load archives for a selection.
    Ingest(IngestArgs),
    /// Create the destination table for a market and data kind, or check an existing one.
    Schema {
        /// Market: spot, um (USD-M futures) or cm (COIN-M futures).
        #[arg(long)]
        market: MarketType,

        /// Data kind: klines, trades, aggTrades, markPriceKlines, ...
        #[arg(long)]
        kind: DataKind,

        /// Destination store. Overrides the config file.
        #[arg(long)]
        destination: Option<DestinationKind>,

        /// Path to a TOML run config.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Count cached archives, checksums and completed targets.
    Status {
        /// Cache directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        output_dir: PathBuf,
    },
}

#[derive(Args)]
struct IngestArgs {
    /// Market: spot, um (USD-M futures) or cm (COIN-M futures).
    #[arg(long)]
    market: MarketType,

    /// Data kind: klines, trades, aggTrades, markPriceKlines, ...
    #[arg(long)]
    kind: DataKind,

    /// Symbols, comma-separated. Defaults to the catalog's list for the market.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Kline intervals, comma-separated (1m,1h,...). Defaults to every published interval.
    #[arg(long, value_delimiter = ',')]
    intervals: Vec<Interval>,

    /// Years of monthly archives, comma-separated.
    #[arg(long, value_delimiter = ',')]
    years: Vec<i32>,

    /// Months (1-12) of monthly archives, comma-separated.
    #[arg(long, value_delimiter = ',')]
    months: Vec<u32>,

    /// Exact days (YYYY-MM-DD), comma-separated. Overrides years, months and the range.
    #[arg(long, value_delimiter = ',')]
    dates: Vec<NaiveDate>,

    /// Start of the daily range (YYYY-MM-DD). Defaults to 2020-01-01.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// End of the daily range (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Do not fetch monthly archives.
    #[arg(long, default_value_t = false)]
    skip_monthly: bool,

    /// Do not fetch daily archives.
    #[arg(long, default_value_t = false)]
    skip_daily: bool,

    /// Archive cache directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Download and check the `.CHECKSUM` sidecar of every archive.
    #[arg(long, default_value_t = false)]
    verify_checksum: bool,

    /// Rows per insert.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Run everything except committing rows.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Targets processed concurrently.
    #[arg(long)]
    workers: Option<usize>,

    /// Destination store: clickhouse, parquet or memory.
    #[arg(long)]
    destination: Option<DestinationKind>,

    /// Symbol catalog TOML used when no symbols are given.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Path to a TOML run config. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the JSON run report.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

impl IngestArgs {
    fn selection(&self) -> Selection {
        Selection::new(self.market, self.kind)
            .with_symbols(self.symbols.iter().map(String::as_str))
            .with_intervals(self.intervals.iter().copied())
            .with_years(self.years.iter().copied())
            .with_months(self.months.iter().copied())
            .with_dates(self.dates.iter().copied())
            .with_range(self.start, self.end)
            .skip_monthly(self.skip_monthly)
            .skip_daily(self.skip_daily)
    }

    fn apply_to(&self, config: &mut IngestConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.verify_checksum {
            config.verify_checksum = true;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if let Some(d) = self.destination {
            config.destination = d;
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = Some(dir.clone());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ingest(args) => run_ingest(&args),
        Commands::Schema {
            market,
            kind,
            destination,
            config,
        } => run_schema(market, kind, destination, config.as_deref()),
        Commands::Cache { action } => match action {
            CacheAction::Status { output_dir } => run_cache_status(&output_dir),
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig> {
    match path {
        Some(p) => IngestConfig::from_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(IngestConfig::default()),
    }
}

fn run_ingest(args: &IngestArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply_to(&mut config);
    config.validate()?;

    let catalog = match &args.catalog {
        Some(path) => SymbolCatalog::from_file(path).map_err(anyhow::Error::msg)?,
        None => SymbolCatalog::default_catalog(),
    };
    let selection = args.selection();
    info!(
        destination = %config.destination,
        output_dir = %config.output_dir.display(),
        verify_checksum = config.verify_checksum,
        "configuration loaded"
    );

    let source = Arc::new(HttpSource::new(config.request_timeout())?);
    let destination = config
        .open_destination()
        .context("opening destination store")?;
    let destination_name = destination.name().to_string();
    let driver = PipelineDriver::from_config(&config, source, destination, catalog);

    let cancel = CancellationToken::new();
    cancel_when(cancel.clone(), async { tokio::signal::ctrl_c().await });

    let today = chrono::Utc::now().date_naive();
    let summary = driver.run(&selection, today, &StdoutProgress, &cancel)?;

    if let Some(dir) = &config.report_dir {
        let report = RunReport::new(&selection, &destination_name, config.dry_run, summary.clone())?;
        let path = report.write_to(dir)?;
        println!("Run report saved to: {}", path.display());
    }

    if !summary.is_success() {
        for report in summary.failures() {
            if let PipelineOutcome::Failed { kind, message } = &report.outcome {
                eprintln!("Error for {}: {kind}: {message}", report.target);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Cancel `token` once `signal` resolves successfully. The signal is awaited
/// on its own thread with a single-threaded runtime.
fn cancel_when<F>(token: CancellationToken, signal: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "no signal runtime; Ctrl-C will not cancel cleanly");
                    return;
                }
            };
            match runtime.block_on(signal) {
                Ok(()) => {
                    eprintln!("Interrupted: finishing targets in flight, skipping the rest");
                    token.cancel();
                }
                Err(e) => warn!(error = %e, "could not listen for Ctrl-C"),
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "could not start the interrupt listener");
            None
        }
    }
}

fn run_schema(
    market: MarketType,
    kind: DataKind,
    destination: Option<DestinationKind>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(d) = destination {
        config.destination = d;
    }
    let store = config.open_destination()?;
    let schema = SchemaManager::new(store.clone(), false).ensure_schema(market, kind)?;

    println!("Table: {} ({})", schema.name, store.name());
    for column in &schema.columns {
        println!("  {:<24} {}", column.name, column.ty);
    }
    println!("Ordering key: ({})", schema.ordering_key.join(", "));
    println!("Natural key:  ({})", schema.natural_key.join(", "));
    println!("Rows: {}", store.count_rows(&schema.name)?);
    Ok(())
}

fn run_cache_status(output_dir: &Path) -> Result<()> {
    if !output_dir.exists() {
        println!("Cache directory does not exist: {}", output_dir.display());
        return Ok(());
    }

    let status = ArchiveCache::new(output_dir).status()?;
    println!("Cache: {}", output_dir.display());
    println!(
        "  Archives:  {} ({:.1} MB)",
        status.archives,
        status.archive_bytes as f64 / (1024.0 * 1024.0)
    );
    println!("  Checksums: {}", status.checksums);
    println!(
        "  Completed: {} ({} checksum-verified)",
        status.completed, status.verified
    );
    println!("  Pending:   {}", status.archives.saturating_sub(status.completed));
    Ok(())
}
