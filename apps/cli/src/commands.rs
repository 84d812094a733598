//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use reportloom_artifacts::{RunStats, read_documents, read_outline};
use reportloom_backend::{Collector, HttpCollector, NullCollector, OpenAiCompatBackend};
use reportloom_core::{
    PipelineConfig, PipelineServices, ProgressReporter, run_pipeline, summarize_only,
};
use reportloom_shared::{
    AppConfig, CoverageStats, ReportLoomError, init_config, load_config, resolve_api_key, validate_api_key,
};
use reportloom_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// reportloom: allocate source documents onto a report outline.
#[derive(Parser)]
#[command(
    name = "reportloom",
    version,
    about = "Summarize a document corpus, allocate it to a report outline, and select charts.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline: summarize, allocate, gap-fill, visualize.
    Run {
        /// JSON array of documents to ingest.
        #[arg(long)]
        documents: PathBuf,

        /// JSON array of outline nodes.
        #[arg(long)]
        outline: PathBuf,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Document store path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Ingest and summarize documents without allocating them.
    Summarize {
        /// JSON array of documents to ingest.
        #[arg(long)]
        documents: PathBuf,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Document store path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show document and allocation status of a store.
    Status {
        /// Document store path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

const LOG_TARGETS: &[&str] = &[
    "reportloom",
    "reportloom_shared",
    "reportloom_markdown",
    "reportloom_core",
    "reportloom_backend",
    "reportloom_storage",
    "reportloom_artifacts",
];

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            documents,
            outline,
            out,
            db,
        } => cmd_run(&documents, &outline, out, db).await,
        Command::Summarize { documents, out, db } => cmd_summarize(&documents, out, db).await,
        Command::Status { db } => cmd_status(db).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    documents: &Path,
    outline: &Path,
    out: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    // Validate API key before doing anything
    let config = load_config()?;
    validate_api_key(&config)?;

    let docs = read_documents(documents)?;
    let outline = read_outline(outline)?;
    let out_dir = out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    let db_path = db.unwrap_or_else(|| PathBuf::from(&config.defaults.db_path));
    let pipeline = PipelineConfig::from_app(&config, &out_dir)?;
    let services = build_services(&config)?;
    let storage = Storage::open(&db_path).await?;

    info!(
        documents = docs.len(),
        nodes = outline.len(),
        out = %out_dir.display(),
        "starting pipeline run"
    );

    let cancel = cancel_on_ctrl_c();
    let reporter = CliProgress::new();
    let result = run_pipeline(
        &storage, &docs, &outline, &pipeline, &services, cancel, &reporter,
    )
    .await;
    reporter.spinner.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(ReportLoomError::Cancelled) => {
            return Err(eyre!(
                "run cancelled; completed work is saved in '{}' and resumes on the next run",
                db_path.display()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let stats = &report.manifest.stats;
    println!();
    println!("  Run completed!");
    println!("  Run ID:      {}", report.run_id);
    println!(
        "  Documents:   {} ({} supplementary)",
        stats.documents, stats.supplementary_documents
    );
    println!(
        "  Summaries:   {} ok, {} failed, {} truncated",
        stats.summarized,
        stats.failed_summaries,
        stats.truncated_documents
    );
    println!("  Coverage:    {}", coverage_line(&stats.coverage));
    println!("  Unallocated: {}", stats.unallocated_documents);
    println!("  Gap-fill:    {} round(s)", stats.gap_fill_rounds);
    println!(
        "  Charts:      {} of {} candidate(s)",
        stats.visualization_assets, stats.visualization_candidates
    );
    println!("  Output:      {}", report.out_dir.display());
    println!("  Time:        {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_summarize(documents: &Path, out: Option<PathBuf>, db: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let docs = read_documents(documents)?;
    let out_dir = out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    let db_path = db.unwrap_or_else(|| PathBuf::from(&config.defaults.db_path));
    let pipeline = PipelineConfig::from_app(&config, &out_dir)?;
    let services = build_services(&config)?;
    let storage = Storage::open(&db_path).await?;

    info!(documents = docs.len(), "summarizing documents");

    let cancel = cancel_on_ctrl_c();
    let reporter = CliProgress::new();
    let result = summarize_only(&storage, &docs, &pipeline, &services, cancel, &reporter).await;
    reporter.spinner.finish_and_clear();
    let report = result?;

    println!();
    println!("  Summaries stored!");
    println!("  Documents:  {}", report.stats.total);
    println!("  Summarized: {}", report.stats.summarized);
    println!("  Failed:     {}", report.stats.failed);
    println!("  Truncated:  {}", report.stats.truncated);
    println!("  From cache: {}", report.cache_hits);
    println!("  Output:     {}", report.output.display());
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_status(db: Option<PathBuf>) -> Result<()> {
    let db_path = match db {
        Some(path) => path,
        None => PathBuf::from(load_config()?.defaults.db_path),
    };
    if !db_path.exists() {
        return Err(eyre!("no document store found at '{}'", db_path.display()));
    }

    let storage = Storage::open_readonly(&db_path).await?;
    let stats = storage.document_stats().await?;
    let coverage = storage.load_allocations().await?.coverage();

    println!();
    println!("  Store:       {}", db_path.display());
    println!(
        "  Documents:   {} ({} supplementary)",
        stats.total, stats.supplementary
    );
    println!(
        "  Summaries:   {} done, {} pending, {} failed, {} truncated",
        stats.summarized,
        stats.pending(),
        stats.failed,
        stats.truncated
    );
    println!(
        "  Allocation:  {} node(s): {} sufficient, {} insufficient, {} empty",
        coverage.total_nodes, coverage.sufficient, coverage.insufficient, coverage.empty
    );

    match storage.latest_run().await? {
        Some(last) => {
            println!(
                "  Last run:    {} {} at {}",
                last.id,
                last.status,
                last.started_at.format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(json) = last.stats_json.as_deref() {
                if let Ok(run) = serde_json::from_str::<RunStats>(json) {
                    println!(
                        "  Coverage:    {:.0}% allocated after {} gap-fill round(s)",
                        run.coverage_rate,
                        run.gap_fill_rounds
                    );
                }
            }
        }
        None => println!("  Last run:    none"),
    }
    println!();

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// `coverage_rate` is already a percentage of nodes with any allocation.
fn coverage_line(coverage: &CoverageStats) -> String {
    format!(
        "{}/{} allocated ({:.0}%), {} sufficient, {} insufficient, {} empty",
        coverage.sufficient + coverage.insufficient,
        coverage.total_nodes,
        coverage.coverage_rate(),
        coverage.sufficient,
        coverage.insufficient,
        coverage.empty
    )
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_services(config: &AppConfig) -> Result<PipelineServices> {
    let api_key = resolve_api_key(config)?;
    let backend = OpenAiCompatBackend::from_config(&config.backend, api_key)?;
    let collector: Arc<dyn Collector> = match HttpCollector::from_config(&config.collector)? {
        Some(collector) => Arc::new(collector),
        None => {
            info!("no collector configured, gap-fill rounds will find nothing");
            Arc::new(NullCollector)
        }
    };
    Ok(PipelineServices::new(Arc::new(backend), collector))
}

/// A token cancelled by the first ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            trigger.cancel();
        }
    });
    cancel
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn detail(&self, message: &str) {
        let phase = self.spinner.message();
        let phase = phase.split(" · ").next().unwrap_or_default().to_string();
        self.spinner.set_message(format!("{phase} · {message}"));
    }

    fn done(&self, _stats: &RunStats) {
        self.spinner.finish_and_clear();
    }
}
