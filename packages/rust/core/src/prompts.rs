//! Prompt templates and model reply parsing.
//!
//! Templates are fixed strings so identical inputs produce identical requests.

use serde::de::DeserializeOwned;

use reportloom_backend::CompletionRequest;
use reportloom_shared::{OutlineNode, ReportLoomError, Result};

pub(crate) const SUMMARY_SYSTEM: &str = "You condense research source documents into dense factual \
summaries. Keep figures, dates, named entities and conclusions. Reply with the summary text only.";

pub(crate) const ALLOCATION_SYSTEM: &str = "You decide which source documents supply content for \
one section of a research report. Reply with JSON only.";

pub(crate) const VISUALIZATION_SYSTEM: &str = "You select data visualizations for a research \
report from source document summaries. Reply with JSON only.";

/// Generated-token allowance for JSON classification replies.
const CLASSIFICATION_BASE_TOKENS: usize = 256;
const CLASSIFICATION_PER_ITEM_TOKENS: usize = 24;

/// One document as listed in a classification prompt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListedDocument<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub summary: &'a str,
}

// ---------------------------------------------------------------------------
// Summarization
// ---------------------------------------------------------------------------

pub(crate) fn summarize(title: &str, content: &str, max_tokens: usize) -> CompletionRequest {
    let prompt = format!(
        "Summarize the document below in at most {max_tokens} tokens.\n\n\
         Title: {title}\n\n<content>\n{content}\n</content>"
    );
    CompletionRequest::new(prompt, max_tokens).with_system(SUMMARY_SYSTEM)
}

pub(crate) fn fold(
    title: &str,
    running: &str,
    part: usize,
    parts: usize,
    chunk: &str,
    max_tokens: usize,
) -> CompletionRequest {
    let prompt = format!(
        "You are summarizing a long document part by part. Merge the running summary with \
         part {part} of {parts} into one updated summary of at most {max_tokens} tokens.\n\n\
         Title: {title}\n\n<summary>\n{running}\n</summary>\n\n<content>\n{chunk}\n</content>"
    );
    CompletionRequest::new(prompt, max_tokens).with_system(SUMMARY_SYSTEM)
}

pub(crate) fn recompress(running: &str, target_tokens: usize) -> CompletionRequest {
    let prompt = format!(
        "Compress the summary below to at most {target_tokens} tokens without dropping figures \
         or named entities.\n\n<summary>\n{running}\n</summary>"
    );
    CompletionRequest::new(prompt, target_tokens).with_system(SUMMARY_SYSTEM)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Render one document entry. Summaries are flattened to a single line.
pub(crate) fn listed_document(doc: &ListedDocument<'_>) -> String {
    let summary = doc.summary.split_whitespace().collect::<Vec<_>>().join(" ");
    let title = doc.title.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("- id: {}\n  title: {title}\n  summary: {summary}\n", doc.id)
}

pub(crate) fn allocation(node: &OutlineNode, docs: &[ListedDocument<'_>]) -> CompletionRequest {
    let mut prompt = format!(
        "SECTION\ntitle: {}\ndescription: {}\n\nDOCUMENTS\n",
        node.title, node.description
    );
    for doc in docs {
        prompt.push_str(&listed_document(doc));
    }
    prompt.push_str(
        "\nReturn {\"relevant_ids\": [...]} listing the ids of documents whose content this \
         section can use. Return an empty list when none apply.",
    );

    CompletionRequest::new(prompt, classification_tokens(docs.len())).with_system(ALLOCATION_SYSTEM)
}

pub(crate) fn visualization(label: &str, docs: &[ListedDocument<'_>]) -> CompletionRequest {
    let mut prompt = format!("GROUP\n{label}\n\nDOCUMENTS\n");
    for doc in docs {
        prompt.push_str(&listed_document(doc));
    }
    prompt.push_str(
        "\nPropose charts only where the documents carry quantitative data that can be plotted. \
         Return {\"visualizations\": [{\"visualization_type\": \"bar|line|pie|scatter|table\", \
         \"chart_title\": \"...\", \"data_ids\": [\"...\"], \"reason\": \"...\", \
         \"priority\": \"high|medium|low\"}]}. Return an empty list when nothing is chartable.",
    );

    CompletionRequest::new(prompt, classification_tokens(docs.len()) * 2)
        .with_system(VISUALIZATION_SYSTEM)
}

fn classification_tokens(items: usize) -> usize {
    CLASSIFICATION_BASE_TOKENS + CLASSIFICATION_PER_ITEM_TOKENS * items
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Parse a JSON value out of a model reply.
///
/// Accepts bare JSON, JSON in a markdown code fence, or JSON surrounded by prose.
pub(crate) fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T> {
    let body = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }

    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&body[s..=e])
            .map_err(|err| ReportLoomError::parse(format!("invalid JSON reply: {err}"))),
        _ => Err(ReportLoomError::parse("reply contains no JSON")),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
