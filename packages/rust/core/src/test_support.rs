//! In-process backends and collectors for pipeline tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reportloom_backend::{Collector, CompletionBackend, CompletionRequest};
use reportloom_shared::{Document, Outline, OutlineNode, Result, SourceType};
use reportloom_storage::Storage;

type Responder = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;
type CollectFn = dyn Fn(&str, usize) -> Result<Vec<Document>> + Send + Sync;

/// A completion backend answering from a closure and recording every request.
#[derive(Clone)]
pub(crate) struct ScriptedBackend {
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    responder: Box<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedBackend {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, responder)
    }

    /// Each call holds for `delay` before answering.
    pub(crate) fn with_delay<F>(delay: Duration, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ScriptedInner {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests().len()
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    /// Requests sent with the given system prompt.
    pub(crate) fn requests_with(&self, system: &str) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.system.as_deref() == Some(system))
            .collect()
    }

    /// Highest number of simultaneous calls observed.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.inner.requests.lock().unwrap().push(request.clone());
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);

        if !self.inner.delay.is_zero() {
            tokio::time::sleep(self.inner.delay).await;
        }
        let reply = (self.inner.responder)(request);

        self.inner.current.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// A collector answering from a closure and recording every query.
#[derive(Clone)]
pub(crate) struct ScriptedCollector {
    respond: Arc<CollectFn>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCollector {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, usize) -> Result<Vec<Document>> + Send + Sync + 'static,
    {
        Self {
            respond: Arc::new(respond),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    async fn collect(&self, query: &str, limit: usize) -> Result<Vec<Document>> {
        self.queries.lock().unwrap().push(query.to_string());
        (self.respond)(query, limit)
    }
}

// ---------------------------------------------------------------------------
// Prompt inspection
// ---------------------------------------------------------------------------

/// Text between `<tag>\n` and `\n</tag>`, first occurrence.
pub(crate) fn section<'a>(prompt: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>\n");
    let close = format!("\n</{tag}>");
    let start = prompt.find(&open)? + open.len();
    let end = start + prompt[start..].find(&close)?;
    Some(&prompt[start..end])
}

/// `(id, summary)` pairs listed in a classification prompt.
pub(crate) fn listed(prompt: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    for line in prompt.lines() {
        if let Some(id) = line.strip_prefix("- id: ") {
            current = Some(id.to_string());
        } else if let Some(summary) = line.strip_prefix("  summary: ") {
            if let Some(id) = current.take() {
                out.push((id, summary.to_string()));
            }
        }
    }
    out
}

/// The section title of an allocation prompt.
pub(crate) fn section_title(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .skip_while(|l| *l != "SECTION")
        .find_map(|l| l.strip_prefix("title: "))
}

/// Reply with the listed ids whose summary contains `needle`.
pub(crate) fn ids_matching(prompt: &str, needle: &str) -> String {
    let ids: Vec<String> = listed(prompt)
        .into_iter()
        .filter(|(_, summary)| summary.contains(needle))
        .map(|(id, _)| id)
        .collect();
    serde_json::json!({ "relevant_ids": ids }).to_string()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn doc(id: &str, markdown: &str) -> Document {
    Document::new(
        id,
        format!("Title {id}"),
        format!("https://example.com/{id}"),
        markdown,
        SourceType::Html,
    )
}

pub(crate) fn summarized(id: &str, summary: &str) -> Document {
    let mut d = doc(id, &format!("raw body of {id}"));
    d.summary = Some(summary.to_string());
    d.summary_kind = Some(reportloom_shared::SummaryKind::Full);
    d
}

pub(crate) fn node(id: &str, title: &str, description: &str, parent: Option<&str>) -> OutlineNode {
    OutlineNode {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        parent_id: parent.map(str::to_string),
    }
}

pub(crate) fn outline(nodes: Vec<OutlineNode>) -> Outline {
    Outline::new(nodes).unwrap()
}

/// A fresh scratch directory under the system temp dir.
pub(crate) fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("reportloom-{label}-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub(crate) async fn temp_storage(label: &str) -> (Storage, PathBuf) {
    let dir = temp_dir(label);
    let storage = Storage::open(&dir.join("store.db")).await.unwrap();
    (storage, dir)
}
