//! Core pipeline orchestration and domain logic for reportloom.
//!
//! This crate ties together summarization, outline allocation, gap-fill and
//! visualization selection into end-to-end workflows (e.g., `run_pipeline`).

pub mod allocation;
pub mod client;
pub mod gap_fill;
pub mod gate;
pub mod pipeline;
pub(crate) mod prompts;
pub mod summarizer;
pub mod visualization;

#[cfg(test)]
mod test_support;

pub use client::{ModelClient, RetryPolicy};
pub use gate::CallGate;
pub use pipeline::{
    PipelineConfig, PipelineServices, ProgressReporter, RunReport, SilentProgress,
    SummarizeReport, run_pipeline, summarize_only,
};
