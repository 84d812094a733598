//! Core domain types: documents, outline, allocation entries, assets.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReportLoomError, Result};

/// Current schema version for the run manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Original format a document was converted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Html,
    Pdf,
    Docx,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = ReportLoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "html" => Ok(Self::Html),
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            other => Err(ReportLoomError::validation(format!(
                "unknown source_type '{other}'"
            ))),
        }
    }
}

/// How a document summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    /// Single call over the whole text.
    Full,
    /// Left fold over token-bounded chunks.
    Incremental,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::str::FromStr for SummaryKind {
    type Err = ReportLoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(ReportLoomError::validation(format!(
                "unknown summary_kind '{other}'"
            ))),
        }
    }
}

/// Where a document entered the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentOrigin {
    /// Part of the initial collection handed to the run.
    #[default]
    Initial,
    /// Collected by gap-fill for an under-served outline node.
    Supplement { outline_id: String, round: u32 },
}

/// A normalized source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier for the lifetime of a run.
    pub id: String,
    pub title: String,
    pub url: String,
    /// Converted markdown body.
    pub markdown: String,
    pub source_type: SourceType,
    /// Bounded summary, set once by the summarizer. Empty when summarization failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_kind: Option<SummaryKind>,
    /// The markdown was cut at `max_document_tokens` before summarization.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub origin: DocumentOrigin,
}

impl Document {
    /// Create an unsummarized document from the initial collection.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        markdown: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            markdown: markdown.into(),
            source_type,
            summary: None,
            summary_kind: None,
            truncated: false,
            origin: DocumentOrigin::Initial,
        }
    }

    /// Whether the document may take part in allocation (non-empty summary).
    pub fn is_allocatable(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// One section of the target report outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl OutlineNode {
    /// Collector query seed for this node.
    pub fn query_seed(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{} {}", self.title, self.description)
        }
    }
}

/// A validated outline tree. Sibling order is report section order.
#[derive(Debug, Clone)]
pub struct Outline {
    nodes: Vec<OutlineNode>,
}

impl Outline {
    /// Validate and wrap a flat list of nodes.
    ///
    /// Rejects empty outlines, duplicate ids, dangling parents and cycles.
    pub fn new(nodes: Vec<OutlineNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ReportLoomError::validation("outline has no nodes"));
        }

        let mut seen = HashSet::new();
        for node in &nodes {
            if node.id.trim().is_empty() {
                return Err(ReportLoomError::validation("outline node with empty id"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ReportLoomError::validation(format!(
                    "duplicate outline id '{}'",
                    node.id
                )));
            }
        }

        let parents: HashMap<&str, Option<&str>> = nodes
            .iter()
            .map(|n| (n.id.as_str(), n.parent_id.as_deref()))
            .collect();

        for node in &nodes {
            if let Some(parent) = node.parent_id.as_deref() {
                if !parents.contains_key(parent) {
                    return Err(ReportLoomError::validation(format!(
                        "outline node '{}' references unknown parent '{parent}'",
                        node.id
                    )));
                }
            }

            // Walk up; more steps than nodes means a cycle.
            let mut cursor = node.parent_id.as_deref();
            let mut steps = 0;
            while let Some(id) = cursor {
                steps += 1;
                if steps > nodes.len() {
                    return Err(ReportLoomError::validation(format!(
                        "outline cycle through '{}'",
                        node.id
                    )));
                }
                cursor = parents.get(id).copied().flatten();
            }
        }

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&OutlineNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes in input order.
    pub fn nodes(&self) -> &[OutlineNode] {
        &self.nodes
    }

    /// Direct children of `parent` (or roots for `None`), in sibling order.
    pub fn children(&self, parent: Option<&str>) -> Vec<&OutlineNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent_id.as_deref() == parent)
            .collect()
    }

    /// Depth-first, sibling-ordered traversal: the order sections appear in the report.
    pub fn report_order(&self) -> Vec<&OutlineNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&OutlineNode> = self.children(None).into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(Some(&node.id)).into_iter().rev());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// How well an outline node is served by its allocated documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Sufficient,
    Insufficient,
    Empty,
}

impl AllocationStatus {
    /// Classify a node from its matched document count and total summary tokens.
    pub fn classify(matched_docs: usize, matched_tokens: usize, min_tokens: usize) -> Self {
        if matched_docs == 0 {
            Self::Empty
        } else if matched_tokens < min_tokens {
            Self::Insufficient
        } else {
            Self::Sufficient
        }
    }

    /// Whether gap-fill should try to supplement this node.
    pub fn is_deficient(&self) -> bool {
        !matches!(self, Self::Sufficient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sufficient => "sufficient",
            Self::Insufficient => "insufficient",
            Self::Empty => "empty",
        }
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = ReportLoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sufficient" => Ok(Self::Sufficient),
            "insufficient" => Ok(Self::Insufficient),
            "empty" => Ok(Self::Empty),
            other => Err(ReportLoomError::validation(format!(
                "unknown allocation status '{other}'"
            ))),
        }
    }
}

/// The documents allocated to one outline node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub outline_id: String,
    pub document_ids: BTreeSet<String>,
    pub status: AllocationStatus,
    /// Degradations surfaced to the caller (failed batches, exhausted supplements).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AllocationEntry {
    /// An entry with no documents.
    pub fn empty(outline_id: impl Into<String>) -> Self {
        Self {
            outline_id: outline_id.into(),
            document_ids: BTreeSet::new(),
            status: AllocationStatus::Empty,
            warnings: Vec::new(),
        }
    }

    /// Union `ids` into the entry. Returns how many were new.
    pub fn absorb<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.document_ids.len();
        self.document_ids.extend(ids);
        self.document_ids.len() - before
    }

    /// Add a warning once.
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

/// Outline id → allocation entry. A plain keyed table, never a similarity index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationMap(pub BTreeMap<String, AllocationEntry>);

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outline_id: &str) -> Option<&AllocationEntry> {
        self.0.get(outline_id)
    }

    pub fn insert(&mut self, entry: AllocationEntry) {
        self.0.insert(entry.outline_id.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AllocationEntry> {
        self.0.values()
    }

    /// Every document id allocated to at least one node.
    pub fn allocated_union(&self) -> BTreeSet<String> {
        self.0
            .values()
            .flat_map(|e| e.document_ids.iter().cloned())
            .collect()
    }

    /// Per-status counts over all entries.
    pub fn coverage(&self) -> CoverageStats {
        let mut stats = CoverageStats {
            total_nodes: self.0.len(),
            ..Default::default()
        };
        for entry in self.0.values() {
            match entry.status {
                AllocationStatus::Sufficient => stats.sufficient += 1,
                AllocationStatus::Insufficient => stats.insufficient += 1,
                AllocationStatus::Empty => stats.empty += 1,
            }
        }
        stats
    }
}

/// Coverage summary of an allocation map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub total_nodes: usize,
    pub sufficient: usize,
    pub insufficient: usize,
    pub empty: usize,
}

impl CoverageStats {
    /// Percentage of nodes with at least one allocated document.
    pub fn coverage_rate(&self) -> f64 {
        if self.total_nodes == 0 {
            0.0
        } else {
            (self.sufficient + self.insufficient) as f64 / self.total_nodes as f64 * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Visualization
// ---------------------------------------------------------------------------

/// Relative importance of a proposed chart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// A chart specification bound to the documents that justify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationAsset {
    pub id: String,
    pub source_document_ids: Vec<String>,
    pub chart_kind: String,
    pub feasible: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub priority: ChartPriority,
    /// Outline nodes whose allocation the sources came from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outline_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// TokenBudget
// ---------------------------------------------------------------------------

/// Default fraction of the context window used per summarization chunk.
pub const DEFAULT_CHUNK_FRACTION: f64 = 0.8;

/// Per-run summarization budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Maximum input tokens of one summarization call (`T`).
    pub max_context_tokens: usize,
    /// Share of `T` used for a single chunk.
    pub chunk_fraction: f64,
}

impl TokenBudget {
    pub fn new(max_context_tokens: usize, chunk_fraction: f64) -> Result<Self> {
        let budget = Self {
            max_context_tokens,
            chunk_fraction,
        };
        budget.validate()?;
        Ok(budget)
    }

    /// Largest chunk the summarizer may hand to one call.
    pub fn chunk_tokens(&self) -> usize {
        ((self.max_context_tokens as f64 * self.chunk_fraction).floor() as usize).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_context_tokens == 0 {
            return Err(ReportLoomError::config("max_context_tokens must be > 0"));
        }
        if !(self.chunk_fraction > 0.0 && self.chunk_fraction <= 1.0) {
            return Err(ReportLoomError::config(format!(
                "chunk_fraction must be in (0, 1], got {}",
                self.chunk_fraction
            )));
        }
        Ok(())
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: 8_000,
            chunk_fraction: DEFAULT_CHUNK_FRACTION,
        }
    }
}
