//! External collaborators of the pipeline: the completion backend and the
//! supplementary document collector.
//!
//! Both are traits so the pipeline can run against HTTP services in
//! production and scripted stand-ins in tests.

mod collector;
mod openai;

use async_trait::async_trait;

use reportloom_shared::{Document, Result};

pub use collector::{HttpCollector, NullCollector};
pub use openai::OpenAiCompatBackend;

/// User-Agent string for outgoing requests.
pub(crate) const USER_AGENT: &str = concat!("reportloom/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Completion backend
// ---------------------------------------------------------------------------

/// A single text completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Optional system instruction.
    pub system: Option<String>,
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens,
            temperature: 0.0,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

}

/// A text-completion model.
///
/// Transport, auth and rate-limit failures surface as
/// [`ReportLoomError::Backend`](reportloom_shared::ReportLoomError::Backend).
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Identifier of the model behind this backend (summary cache key).
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Supplies additional documents for an under-served outline section.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Fetch up to `limit` documents relevant to `query`.
    async fn collect(&self, query: &str, limit: usize) -> Result<Vec<Document>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_builder() {
        let req = CompletionRequest::new("hello", 64).with_system("be brief");
        assert_eq!(req.prompt, "hello");
        assert_eq!(req.max_tokens, 64);
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert!(req.temperature.abs() < f32::EPSILON);
    }

    #[test]
    fn user_agent_has_version() {
        assert!(USER_AGENT.starts_with("reportloom/"));
    }
}
