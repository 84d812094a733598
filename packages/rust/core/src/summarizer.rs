//! Incremental summarizer: one bounded summary per document.
//!
//! Documents that fit the context window are summarized in a single call.
//! Larger ones are chunked and folded left to right into a running summary,
//! so memory stays at one running summary plus one chunk.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use reportloom_markdown::{Chunk, TokenCounter, chunk_markdown, truncate_to_tokens};
use reportloom_shared::{AppConfig, Document, ReportLoomError, Result, SummaryKind, TokenBudget};
use reportloom_storage::content_hash;

use crate::client::{ModelClient, non_empty};
use crate::gate::{PassOutcome, drain};
use crate::prompts;

/// Summarizer limits derived from `[summarizer]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarizerSettings {
    pub budget: TokenBudget,
    /// Ceiling on every summary produced, `<= budget.max_context_tokens`.
    pub max_summary_tokens: usize,
    /// Documents above this are cut before summarization.
    pub max_document_tokens: usize,
}

impl From<&AppConfig> for SummarizerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            budget: TokenBudget::from(config),
            max_summary_tokens: config.summarizer.max_summary_tokens,
            max_document_tokens: config.summarizer.max_document_tokens,
        }
    }
}

/// Result of summarizing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryOutcome {
    /// Empty when every attempt failed.
    pub summary: String,
    /// `None` when summarization failed.
    pub kind: Option<SummaryKind>,
    pub truncated: bool,
    /// Number of chunks folded (1 for a full summary).
    pub chunks: usize,
}

impl SummaryOutcome {
    pub fn is_failed(&self) -> bool {
        self.kind.is_none()
    }
}

/// One summarized body and every document id that shares it.
#[derive(Debug, Clone)]
pub struct SummarizedGroup {
    pub content_hash: String,
    pub document_ids: Vec<String>,
    pub outcome: SummaryOutcome,
}

#[derive(Clone)]
pub struct Summarizer {
    client: ModelClient,
    counter: Arc<dyn TokenCounter>,
    settings: SummarizerSettings,
}

impl Summarizer {
    pub fn new(
        client: ModelClient,
        counter: Arc<dyn TokenCounter>,
        settings: SummarizerSettings,
    ) -> Self {
        Self {
            client,
            counter,
            settings,
        }
    }

    pub fn settings(&self) -> &SummarizerSettings {
        &self.settings
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    /// Whether `markdown` is cut to `max_document_tokens` before summarization.
    pub fn exceeds_document_limit(&self, markdown: &str) -> bool {
        self.counter.count(markdown) > self.settings.max_document_tokens
    }

    /// Summarize every distinct body among `docs` concurrently.
    ///
    /// Documents with identical markdown are summarized once and share the
    /// outcome. Only cancellation stops the pass early.
    #[instrument(skip_all, fields(documents = docs.len()))]
    pub async fn summarize_all(&self, docs: &[Document]) -> Result<PassOutcome<SummarizedGroup>> {
        let mut groups: BTreeMap<String, (Document, Vec<String>)> = BTreeMap::new();
        for doc in docs {
            groups
                .entry(content_hash(&doc.markdown))
                .or_insert_with(|| (doc.clone(), Vec::new()))
                .1
                .push(doc.id.clone());
        }

        let distinct = groups.len();
        let mut tasks = JoinSet::new();
        for (hash, (doc, ids)) in groups {
            let summarizer = self.clone();
            tasks.spawn(async move {
                let outcome = summarizer.summarize(&doc).await?;
                Ok(SummarizedGroup {
                    content_hash: hash,
                    document_ids: ids,
                    outcome,
                })
            });
        }

        let outcome = drain(tasks).await?;
        let failed = outcome
            .completed
            .iter()
            .filter(|g| g.outcome.is_failed())
            .count();
        info!(
            distinct,
            completed = outcome.completed.len(),
            failed,
            cancelled = outcome.cancelled,
            "summarization pass finished"
        );
        Ok(outcome)
    }

    /// Summarize one document.
    ///
    /// Backend failures that survive retries yield an empty, failed outcome.
    /// The only error returned is [`ReportLoomError::Cancelled`].
    #[instrument(skip_all, fields(doc_id = %doc.id))]
    pub async fn summarize(&self, doc: &Document) -> Result<SummaryOutcome> {
        let counter = self.counter.as_ref();
        let budget = self.settings.budget;

        let (body, truncated) =
            truncate_to_tokens(counter, &doc.markdown, self.settings.max_document_tokens);
        if truncated {
            let err = ReportLoomError::BudgetExceeded {
                tokens: counter.count(&doc.markdown),
                limit: self.settings.max_document_tokens,
            };
            warn!(error = %err, "document truncated before summarization");
        }

        let tokens = counter.count(&body);
        let (result, chunks) = if tokens <= budget.max_context_tokens {
            let result = self.summarize_full(doc, &body).await;
            (result.map(|s| (s, SummaryKind::Full)), 1)
        } else {
            let chunks = chunk_markdown(counter, &body, budget.chunk_tokens());
            debug!(
                tokens,
                chunks = chunks.len(),
                chunk_tokens = budget.chunk_tokens(),
                "folding document"
            );
            let result = self.fold(doc, &chunks).await;
            (result.map(|s| (s, SummaryKind::Incremental)), chunks.len())
        };

        match result {
            Ok((summary, kind)) => Ok(SummaryOutcome {
                summary,
                kind: Some(kind),
                truncated,
                chunks,
            }),
            Err(ReportLoomError::Cancelled) => Err(ReportLoomError::Cancelled),
            Err(e) => {
                warn!(error = %e, "summarization failed, document excluded from allocation");
                Ok(SummaryOutcome {
                    summary: String::new(),
                    kind: None,
                    truncated,
                    chunks,
                })
            }
        }
    }

    async fn summarize_full(&self, doc: &Document, body: &str) -> Result<String> {
        let request = prompts::summarize(&doc.title, body, self.settings.max_summary_tokens);
        let reply = self.client.complete_with(&request, non_empty).await?;
        Ok(self.bound(&reply, self.settings.max_summary_tokens))
    }

    async fn fold(&self, doc: &Document, chunks: &[Chunk]) -> Result<String> {
        let limit = self
            .settings
            .budget
            .max_context_tokens
            .saturating_sub(self.fold_overhead(&doc.title));
        let mut running = String::new();

        for chunk in chunks {
            let running_tokens = self.counter.count(&running);
            if running_tokens + chunk.tokens > limit {
                running = self
                    .recompress(&running, limit.saturating_sub(chunk.tokens))
                    .await?;
            }

            let request = prompts::fold(
                &doc.title,
                &running,
                chunk.index + 1,
                chunks.len(),
                &chunk.text,
                self.settings.max_summary_tokens,
            );
            let reply = self.client.complete_with(&request, non_empty).await?;
            running = self.bound(&reply, self.settings.max_summary_tokens);
            debug!(
                part = chunk.index + 1,
                parts = chunks.len(),
                chunk_tokens = chunk.tokens,
                running_tokens = self.counter.count(&running),
                "folded chunk"
            );
        }

        Ok(running)
    }

    /// Tokens a fold request spends outside the running summary and the chunk.
    fn fold_overhead(&self, title: &str) -> usize {
        let bare = prompts::fold(
            title,
            "",
            usize::MAX,
            usize::MAX,
            "",
            self.settings.max_summary_tokens,
        );
        let system = bare.system.as_deref().map_or(0, |s| self.counter.count(s));
        self.counter.count(&bare.prompt) + system
    }

    /// Summary-of-summary down to `target` tokens, cut if the reply overshoots.
    async fn recompress(&self, running: &str, target: usize) -> Result<String> {
        if target == 0 {
            return Ok(String::new());
        }
        let request = prompts::recompress(running, target);
        let reply = self.client.complete_with(&request, non_empty).await?;
        let (fitted, cut) = truncate_to_tokens(self.counter.as_ref(), &reply, target);
        if cut {
            debug!(target, "recompressed summary over target, truncated");
        }
        Ok(fitted)
    }

    fn bound(&self, text: &str, limit: usize) -> String {
        truncate_to_tokens(self.counter.as_ref(), text, limit).0
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("client", &self.client)
            .field("settings", &self.settings)
            .finish()
    }
}
