mod checkpoint;
mod config;
mod dispatch;
mod geocode;
mod merge;
mod model;
mod rate_limit;
mod retry;
mod session;
mod source;
#[cfg(test)]
mod testing;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::geocode::{Enricher, HttpGeocodeApi};
use crate::model::WorkItem;
use crate::rate_limit::EndpointLimiter;
use crate::session::http::HttpSessionFactory;
use crate::session::ExtractionPlan;
use crate::source::{write_tasks, CsvSource, LinkSource, SitemapSource, TaskSource};
use crate::worker::{GeocodeSetup, ProcessorFactory, ScrapeSetup};

#[derive(Parser)]
#[command(name = "store_harvester", about = "Resilient batch scraper and geocoder for store records")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Also write daily log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the sitemap and write the task file
    Init {
        /// Task file to write (default: input.path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Scrape every task (and geocode it, if enabled), then merge
    Scrape(RunArgs),
    /// Geocode every task, then merge
    Geocode(RunArgs),
    /// Turn links extracted into a field into a follow-up task file
    Links {
        /// Field holding the extracted links
        #[arg(short, long)]
        field: String,
        /// Task file to write
        #[arg(short, long)]
        output: PathBuf,
        /// Separator between links (default: the field's `join`)
        #[arg(long)]
        separator: Option<String>,
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
    /// Merge checkpoints into the final dataset
    Merge(StoreArgs),
    /// Show checkpoint progress and outcome counts
    Status(StoreArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Task CSV
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Final dataset CSV
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// Number of concurrent workers
    #[arg(short = 'p', long)]
    pool_size: Option<usize>,
    /// Items per checkpoint
    #[arg(short = 'c', long)]
    chunk_size: Option<usize>,
    /// Geocoding requests per second
    #[arg(long)]
    rate_budget: Option<u32>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Keep completed checkpoints and only run what is left
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    no_progress: bool,
}

impl RunArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.input {
            settings.input.path = path.clone();
        }
        if let Some(path) = &self.output {
            settings.output = path.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            settings.checkpoint_dir = dir.clone();
        }
        if let Some(n) = self.pool_size {
            settings.pool_size = n;
        }
        if let Some(n) = self.chunk_size {
            settings.chunk_size = n;
        }
        if let Some(n) = self.rate_budget {
            settings.rate_budget = n;
        }
        if let Some(n) = self.max_retries {
            settings.max_retries = n;
        }
    }
}

#[derive(Args)]
struct StoreArgs {
    /// Final dataset CSV
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

impl StoreArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.output {
            settings.output = path.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            settings.checkpoint_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let t0 = Instant::now();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let result = match cli.command {
        Commands::Init { output } => init(&settings, output).await,
        Commands::Scrape(args) => {
            args.apply(&mut settings);
            settings.validate()?;
            scrape(&settings, &args).await
        }
        Commands::Geocode(args) => {
            args.apply(&mut settings);
            settings.validate()?;
            geocode(&settings, &args).await
        }
        Commands::Links {
            field,
            output,
            separator,
            checkpoint_dir,
        } => {
            if let Some(dir) = checkpoint_dir {
                settings.checkpoint_dir = dir;
            }
            links(&settings, &field, separator, &output).await
        }
        Commands::Merge(args) => {
            args.apply(&mut settings);
            let store = CheckpointStore::open(&settings.checkpoint_dir)?;
            if store.list()?.is_empty() {
                println!("No checkpoints in {}.", store.dir().display());
                return Ok(());
            }
            let summary = merge::merge(&store, &settings.natural_key, &settings.output)?;
            println!("Wrote {}\n\n{}", settings.output.display(), summary);
            Ok(())
        }
        Commands::Status(args) => {
            args.apply(&mut settings);
            let store = CheckpointStore::open(&settings.checkpoint_dir)?;
            let merged = merge::collect(&store, &settings.natural_key)?;
            println!("Checkpoints: {}\n", store.dir().display());
            println!("{}", merged.summary);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let console = tracing_subscriber::fmt::layer();

    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "store_harvester.log"));
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}

/// Cancelled on Ctrl-C; workers finish their current item and checkpoint.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            trigger.cancel();
        }
    });
    token
}

async fn init(settings: &Settings, output: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(url) = settings.sitemap.url.as_deref() else {
        bail!("sitemap.url is not configured");
    };
    let client = reqwest::Client::builder()
        .user_agent(&settings.user_agent)
        .build()?;
    let set = SitemapSource::new(url, &settings.sitemap.pattern, client)?
        .load()
        .await?;

    let path = output.unwrap_or_else(|| settings.input.path.clone());
    write_tasks(
        &path,
        &set.items,
        &settings.input.id_column,
        &settings.input.query_column,
    )?;
    println!(
        "Wrote {} tasks to {} ({} unmatched, {} duplicate URLs skipped)",
        set.items.len(),
        path.display(),
        set.dropped_invalid,
        set.dropped_duplicate
    );
    Ok(())
}

async fn links(
    settings: &Settings,
    field: &str,
    separator: Option<String>,
    output: &Path,
) -> anyhow::Result<()> {
    let separator = separator.or_else(|| {
        settings
            .extraction
            .fields
            .iter()
            .find(|f| f.name == field)
            .and_then(|f| f.join.clone())
    });
    let store = CheckpointStore::open(&settings.checkpoint_dir)?;
    let set = LinkSource::new(store, field, separator).load().await?;
    write_tasks(
        output,
        &set.items,
        &settings.input.id_column,
        &settings.input.query_column,
    )?;
    println!(
        "Wrote {} tasks to {} ({} unresolvable, {} repeated links skipped)",
        set.items.len(),
        output.display(),
        set.dropped_invalid,
        set.dropped_duplicate
    );
    Ok(())
}

async fn load_tasks(settings: &Settings) -> anyhow::Result<Vec<WorkItem>> {
    let source = CsvSource::new(
        &settings.input.path,
        &settings.input.id_column,
        &settings.input.query_column,
    );
    let set = source.load().await?;
    if set.dropped_invalid + set.dropped_duplicate > 0 {
        println!(
            "Dropped {} rows without id/query and {} duplicate ids",
            set.dropped_invalid, set.dropped_duplicate
        );
    }
    Ok(set.items)
}

fn build_enricher(settings: &Settings) -> anyhow::Result<Enricher> {
    let api_key = settings
        .geocode
        .api_key
        .clone()
        .context("Geocoding needs geocode.api_key (or HARVEST_GEOCODE__API_KEY)")?;
    let api = HttpGeocodeApi::new(
        &settings.geocode.endpoint,
        api_key,
        settings.geocode.region.clone(),
        Duration::from_millis(settings.geocode.timeout_ms),
    )?;
    let limiter = EndpointLimiter::new(
        &settings.geocode.endpoint,
        settings.rate_budget,
        settings.rate_burst,
        settings.rate_max_wait(),
    )?;
    Ok(Enricher::new(Arc::new(api), settings.retry(), settings.geocode.policy).with_limiter(Some(limiter)))
}

async fn scrape(settings: &Settings, args: &RunArgs) -> anyhow::Result<()> {
    let plan = ExtractionPlan::compile(settings.extraction.clone()).context("Invalid extraction plan")?;
    let sessions = HttpSessionFactory::new(&plan, &settings.user_agent, settings.timeouts().load)
        .context("Invalid extraction plan")?;
    let limiter = settings
        .fetch_rate_budget
        .map(|budget| {
            EndpointLimiter::new(
                "page fetch",
                budget,
                settings.rate_burst,
                settings.rate_max_wait(),
            )
        })
        .transpose()?;
    let enricher = if settings.geocode.enabled {
        Some(Arc::new(build_enricher(settings)?))
    } else {
        None
    };

    let items = load_tasks(settings).await?;
    if items.is_empty() {
        println!("No tasks in {}.", settings.input.path.display());
        return Ok(());
    }
    println!(
        "Scraping {} tasks{}...",
        items.len(),
        if enricher.is_some() { " with geocoding" } else { "" }
    );

    let setup = ScrapeSetup {
        sessions: Arc::new(sessions),
        plan: Arc::new(plan),
        timeouts: settings.timeouts(),
        limiter,
        retry: settings.retry(),
        enricher,
        location: settings.location.clone(),
        carry_context: settings.carry_context,
    };
    run_pipeline(settings, args, setup, items).await
}

async fn geocode(settings: &Settings, args: &RunArgs) -> anyhow::Result<()> {
    let setup = GeocodeSetup {
        enricher: Arc::new(build_enricher(settings)?),
        location: settings.location.clone(),
    };
    let items = load_tasks(settings).await?;
    if items.is_empty() {
        println!("No tasks in {}.", settings.input.path.display());
        return Ok(());
    }
    println!("Geocoding {} tasks...", items.len());
    run_pipeline(settings, args, setup, items).await
}

async fn run_pipeline<F: ProcessorFactory>(
    settings: &Settings,
    args: &RunArgs,
    factory: F,
    items: Vec<WorkItem>,
) -> anyhow::Result<()> {
    let store = CheckpointStore::open(&settings.checkpoint_dir)?;
    let config = DispatchConfig {
        pool_size: settings.pool_size,
        chunk_size: settings.chunk_size,
        max_chunk_restarts: settings.max_chunk_restarts,
        resume: args.resume,
        progress: !args.no_progress,
        write_retry: settings.retry(),
    };

    let report = Dispatcher::new(factory, store.clone(), config, cancel_on_ctrl_c())
        .run(items)
        .await?;
    println!(
        "Chunks: {} total, {} skipped, {} written, {} restarted after crashes",
        report.chunks_total, report.chunks_skipped, report.chunks_written, report.chunks_restarted
    );
    if report.cancelled {
        println!("Run interrupted. Re-run with --resume to continue.");
        return Ok(());
    }

    let summary = merge::merge(&store, &settings.natural_key, &settings.output)?;
    info!(
        total = summary.total,
        duplicates = summary.duplicates,
        success_rate = summary.success_rate(),
        "Run finished"
    );
    println!("Wrote {}\n\n{}", settings.output.display(), summary);
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
