//! Markdown text utilities for the summarization and visualization passes.
//!
//! - [`tokens`]: token estimation and token-boundary truncation
//! - [`chunk`]: boundary-aware, token-bounded chunking
//! - [`structure`]: detection of tables and numeric series

pub mod chunk;
pub mod structure;
pub mod tokens;

pub use chunk::{Chunk, chunk_markdown};
pub use structure::{StructuredData, detect_structured_data};
pub use tokens::{EstimatingCounter, TokenCounter, truncate_to_tokens};

/// Cut `text` to at most `max_chars` characters, appending an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", text[..end].trim_end()),
        None => text.to_string(),
    }
}
