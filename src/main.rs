/// Command-line entry point for bulk bar operations
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bulkbars::{
    bulk::{run_operation, CancelToken, OperationStrategy, OperationSummary, RunState, TracingProgress},
    config::{load_settings, FileFormat, FileLayout, OperationContext, ReplacePolicy, Settings, StoreKind},
    data::{files::parse_timestamp, BarStore, JsonlBarStore, MemoryBarStore},
    provider::{ProviderRegistry, ReplayProvider},
    strategies::{CopyStrategy, DownloadStrategy, ExportStrategy, ImportStrategy},
    DateRange, Resolution,
};

const DEFAULT_CONFIG: &str = "bulkbars.toml";

#[derive(Parser, Debug)]
#[command(name = "bulkbars", author, version, about = "Bulk download, import, export and copy of bar series")]
struct Cli {
    /// Settings file (bulkbars.toml is read when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request bars from a remote provider
    Download(DownloadArgs),
    /// Load bar files from a directory
    Import(ImportArgs),
    /// Write stored bars to files
    Export(ExportArgs),
    /// Rebuild coarser resolutions, optionally from another provider
    Copy(CopyArgs),
    /// Print the effective settings
    Config,
}

#[derive(Args, Debug)]
struct Selection {
    /// Provider whose bars are written (or read, for export)
    #[arg(short, long)]
    provider: String,

    /// Comma-separated tickers
    #[arg(short, long, value_delimiter = ',')]
    tickers: Vec<String>,

    /// File with one ticker per line
    #[arg(long)]
    tickers_file: Option<PathBuf>,

    /// Comma-separated resolutions (minute,hour,day,week,month or synonyms)
    #[arg(short, long, default_value = "day")]
    resolutions: String,

    /// Range start (RFC 3339 or YYYY-MM-DD[ HH:MM:SS])
    #[arg(long)]
    from: Option<String>,

    /// Range end, inclusive
    #[arg(long)]
    to: Option<String>,

    /// Workers per stage
    #[arg(long)]
    threads: Option<usize>,

    /// Write the run summary as JSON
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    selection: Selection,

    /// Directory of a JSONL bar store served as the remote provider
    #[arg(long)]
    remote_dir: PathBuf,

    /// Provider id the remote bars are stored under (defaults to --provider)
    #[arg(long)]
    source_provider: Option<String>,

    /// Attempts per request before giving up
    #[arg(long)]
    retry_limit: Option<u32>,

    #[arg(long, default_value = "merge")]
    replace: ReplacePolicy,

    /// Start each request at the last stored bar
    #[arg(long)]
    incremental: bool,
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[command(flatten)]
    selection: Selection,

    #[arg(short, long)]
    dir: PathBuf,

    #[arg(long, default_value = "merge")]
    replace: ReplacePolicy,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    selection: Selection,

    #[arg(short, long)]
    dir: PathBuf,

    #[arg(short, long)]
    format: Option<FileFormat>,

    #[arg(long)]
    layout: Option<FileLayout>,
}

#[derive(Args, Debug)]
struct CopyArgs {
    #[command(flatten)]
    selection: Selection,

    /// Provider to copy from (defaults to --provider)
    #[arg(long)]
    source_provider: Option<String>,
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_store(settings: &Settings) -> Arc<dyn BarStore> {
    match settings.store {
        StoreKind::Memory => {
            warn!("Using the in-memory store: nothing will persist after this run");
            Arc::new(MemoryBarStore::new())
        }
        StoreKind::Jsonl => Arc::new(JsonlBarStore::new(&settings.data_dir)),
    }
}

fn read_tickers_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tickers file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Context shared by every subcommand
fn base_context(selection: &Selection, settings: &Settings) -> anyhow::Result<OperationContext> {
    let mut tickers = selection.tickers.clone();
    if let Some(path) = &selection.tickers_file {
        tickers.extend(read_tickers_file(path)?);
    }

    let resolutions = Resolution::parse_list(&selection.resolutions)?;
    let mut ctx = OperationContext::new(selection.provider.clone(), settings)?
        .with_instruments(tickers)
        .with_resolutions(resolutions);

    let tz = ctx.timezone;
    let from = selection.from.as_deref().map(|s| parse_timestamp(s, tz)).transpose()?;
    let to = selection.to.as_deref().map(|s| parse_timestamp(s, tz)).transpose()?;
    if from.is_some() || to.is_some() {
        let from = from.unwrap_or(DateRange::full().from);
        let to = to.unwrap_or_else(chrono::Utc::now);
        ctx = ctx.with_range(Some(DateRange::new(from, to)?));
    }

    if let Some(threads) = selection.threads {
        ctx = ctx.with_threads(threads);
    }
    Ok(ctx)
}

async fn execute(
    ctx: OperationContext,
    strategy: Arc<dyn OperationStrategy>,
    summary_path: Option<&Path>,
) -> anyhow::Result<OperationSummary> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received - cancelling after in-flight work");
                cancel.cancel();
            }
        });
    }

    let sink = Arc::new(TracingProgress::new(cancel));
    let summary = run_operation(ctx, strategy, sink).await;
    println!("{}", summary);

    if let Some(path) = summary_path {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("writing summary {}", path.display()))?;
        info!("💾 Saved run summary to {}", path.display());
    }

    Ok(summary)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings(Some(path), true)?,
        None => load_settings(Some(DEFAULT_CONFIG), false)?,
    };
    init_logging(&settings);

    let store = open_store(&settings);

    let (ctx, strategy, summary_path): (OperationContext, Arc<dyn OperationStrategy>, Option<PathBuf>) =
        match cli.command {
            Command::Config => {
                print!("{}", settings.to_toml()?);
                return Ok(());
            }
            Command::Download(args) => {
                let mut ctx = base_context(&args.selection, &settings)?.with_replace(args.replace);
                ctx.incremental = args.incremental;
                if let Some(limit) = args.retry_limit {
                    ctx = ctx.with_retry_limit(limit);
                }

                let remote: Arc<dyn BarStore> = Arc::new(JsonlBarStore::new(&args.remote_dir));
                let source = args
                    .source_provider
                    .unwrap_or_else(|| args.selection.provider.clone());
                let mut registry = ProviderRegistry::new();
                registry.register(Arc::new(ReplayProvider::new(
                    args.selection.provider.clone(),
                    remote,
                    source,
                )));

                let strategy: Arc<dyn OperationStrategy> = Arc::new(DownloadStrategy::new(registry, store));
                (ctx, strategy, args.selection.summary)
            }
            Command::Import(args) => {
                let ctx = base_context(&args.selection, &settings)?
                    .with_directory(args.dir)
                    .with_replace(args.replace);
                let strategy: Arc<dyn OperationStrategy> = Arc::new(ImportStrategy::new(store));
                (ctx, strategy, args.selection.summary)
            }
            Command::Export(args) => {
                let mut ctx = base_context(&args.selection, &settings)?.with_directory(args.dir);
                if let Some(format) = args.format {
                    ctx.file_format = format;
                }
                if let Some(layout) = args.layout {
                    ctx.layout = layout;
                }
                let strategy: Arc<dyn OperationStrategy> = Arc::new(ExportStrategy::new(store));
                (ctx, strategy, args.selection.summary)
            }
            Command::Copy(args) => {
                let mut ctx = base_context(&args.selection, &settings)?;
                if let Some(source) = args.source_provider {
                    ctx = ctx.with_source_provider(source);
                }
                let strategy: Arc<dyn OperationStrategy> = Arc::new(CopyStrategy::new(store));
                (ctx, strategy, args.selection.summary)
            }
        };

    let summary = execute(ctx, strategy, summary_path.as_deref()).await?;

    match summary.state {
        RunState::Failed => {
            error!("Run failed: {}", summary.error.as_deref().unwrap_or("unknown error"));
            bail!("{} failed", summary.kind)
        }
        _ if !summary.is_clean() => {
            warn!("Run finished with failures or cancellation");
            Ok(())
        }
        _ => Ok(()),
    }
}
