//! Application configuration for reportloom.
//!
//! User config lives at `~/.reportloom/reportloom.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReportLoomError, Result};
use crate::types::{DEFAULT_CHUNK_FRACTION, TokenBudget};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "reportloom.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".reportloom";

// ---------------------------------------------------------------------------
// Config structs (matching reportloom.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Completion backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Supplementary collection service.
    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub allocation: AllocationConfig,

    #[serde(default)]
    pub gap_fill: GapFillConfig,

    /// Backoff for transient backend failures.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub visualization: VisualizationConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory artifacts are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Document store path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Ceiling on in-flight external calls across the whole run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            db_path: default_db_path(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_output_dir() -> String {
    "./reportloom-out".into()
}
fn default_db_path() -> String {
    "./reportloom.db".into()
}
fn default_max_concurrency() -> usize {
    10
}

/// `[backend]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// OpenAI-compatible API root.
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_backend_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "REPORTLOOM_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_timeout_secs() -> u64 {
    120
}

/// `[collector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Collector service root. Unset means no supplementary collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Maximum documents requested per gap-fill query.
    #[serde(default = "default_collect_limit")]
    pub limit: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            limit: default_collect_limit(),
        }
    }
}

fn default_collect_limit() -> usize {
    5
}

/// `[summarizer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Maximum input tokens of a single summarization call.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Share of `max_context_tokens` used per chunk.
    #[serde(default = "default_chunk_fraction")]
    pub chunk_fraction: f64,

    /// Upper bound on a finished summary.
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: usize,

    /// Documents above this are truncated before summarization.
    #[serde(default = "default_max_document_tokens")]
    pub max_document_tokens: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            chunk_fraction: default_chunk_fraction(),
            max_summary_tokens: default_max_summary_tokens(),
            max_document_tokens: default_max_document_tokens(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    8_000
}
fn default_chunk_fraction() -> f64 {
    DEFAULT_CHUNK_FRACTION
}
fn default_max_summary_tokens() -> usize {
    500
}
fn default_max_document_tokens() -> usize {
    250_000
}

/// `[allocation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Summary tokens per classification batch.
    #[serde(default = "default_batch_tokens")]
    pub batch_tokens: usize,

    /// Matched summary tokens below which a node is `insufficient`.
    #[serde(default = "default_min_content_tokens")]
    pub min_content_tokens: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            batch_tokens: default_batch_tokens(),
            min_content_tokens: default_min_content_tokens(),
        }
    }
}

fn default_batch_tokens() -> usize {
    6_000
}
fn default_min_content_tokens() -> usize {
    200
}

/// `[gap_fill]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapFillConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for GapFillConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_max_rounds() -> u32 {
    2
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

/// How candidate summaries are grouped before chart classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// One group per outline node allocation.
    #[default]
    Node,
    /// One group per top-level section, merging its descendants.
    ParentSection,
}

/// `[visualization]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub grouping: GroupingStrategy,

    /// Documents per classification request.
    #[serde(default = "default_max_items_per_batch")]
    pub max_items_per_batch: usize,

    /// Summary characters shown to the classifier per document.
    #[serde(default = "default_summary_preview_chars")]
    pub summary_preview_chars: usize,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grouping: GroupingStrategy::default(),
            max_items_per_batch: default_max_items_per_batch(),
            summary_preview_chars: default_summary_preview_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_items_per_batch() -> usize {
    50
}
fn default_summary_preview_chars() -> usize {
    500
}

impl AppConfig {
    /// Reject inconsistent settings before any work starts.
    pub fn validate(&self) -> Result<()> {
        TokenBudget::from(self).validate()?;

        let s = &self.summarizer;
        if s.max_summary_tokens == 0 || s.max_summary_tokens > s.max_context_tokens {
            return Err(ReportLoomError::config(format!(
                "summarizer.max_summary_tokens ({}) must be in 1..={}",
                s.max_summary_tokens, s.max_context_tokens
            )));
        }
        if s.max_document_tokens < s.max_context_tokens {
            return Err(ReportLoomError::config(
                "summarizer.max_document_tokens must be >= max_context_tokens",
            ));
        }
        if self.defaults.max_concurrency == 0 {
            return Err(ReportLoomError::config("defaults.max_concurrency must be > 0"));
        }
        if self.allocation.batch_tokens == 0 {
            return Err(ReportLoomError::config("allocation.batch_tokens must be > 0"));
        }
        if self.visualization.max_items_per_batch == 0 {
            return Err(ReportLoomError::config(
                "visualization.max_items_per_batch must be > 0",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ReportLoomError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}

impl From<&AppConfig> for TokenBudget {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_context_tokens: config.summarizer.max_context_tokens,
            chunk_fraction: config.summarizer.chunk_fraction,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.reportloom/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReportLoomError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.reportloom/reportloom.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ReportLoomError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ReportLoomError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ReportLoomError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ReportLoomError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ReportLoomError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the backend API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    resolve_api_key(config).map(|_| ())
}

/// Read the backend API key from the configured env var.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.backend.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ReportLoomError::config(format!(
            "backend API key not found. Set the {var_name} environment variable."
        ))),
    }
}
