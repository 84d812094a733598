//! Shared types, error model, and configuration for reportloom.
//!
//! This crate is the foundation depended on by all other reportloom crates.
//! It provides:
//! - [`ReportLoomError`]: the unified error type
//! - Domain types ([`Document`], [`Outline`], [`AllocationMap`], [`VisualizationAsset`])
//! - Configuration ([`AppConfig`], [`TokenBudget`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AllocationConfig, AppConfig, BackendConfig, CollectorConfig, DefaultsConfig, GapFillConfig,
    GroupingStrategy, RetryConfig, SummarizerConfig, VisualizationConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, resolve_api_key,
    validate_api_key,
};
pub use error::{ReportLoomError, Result};
pub use types::{
    AllocationEntry, AllocationMap, AllocationStatus, CURRENT_SCHEMA_VERSION, ChartPriority,
    CoverageStats, DEFAULT_CHUNK_FRACTION, Document, DocumentOrigin, Outline, OutlineNode, RunId,
    SourceType, SummaryKind, TokenBudget, VisualizationAsset,
};
