//! Allocation matcher: outline node → relevant document ids.
//!
//! Each node is classified independently against batches of summaries, so
//! node-level decisions run concurrently behind the call gate. Summaries are
//! always presented in ascending id order with a fixed prompt, which keeps
//! repeated passes over unchanged data stable.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use reportloom_markdown::TokenCounter;
use reportloom_shared::{
    AllocationEntry, AllocationMap, AllocationStatus, AppConfig, Document, Outline, OutlineNode,
    ReportLoomError, Result,
};

use crate::client::ModelClient;
use crate::gate::{PassOutcome, drain};
use crate::prompts::{self, ListedDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherSettings {
    /// Token ceiling of the document list in one classification request.
    pub batch_tokens: usize,
    /// Matched summary tokens below this make a node `insufficient`.
    pub min_content_tokens: usize,
}

impl From<&AppConfig> for MatcherSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_tokens: config.allocation.batch_tokens,
            min_content_tokens: config.allocation.min_content_tokens,
        }
    }
}

/// A summarized document offered to the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub summary: String,
    /// Estimated tokens of the summary.
    pub tokens: usize,
}

impl Candidate {
    fn listed(&self) -> ListedDocument<'_> {
        ListedDocument {
            id: &self.id,
            title: &self.title,
            summary: &self.summary,
        }
    }
}

/// Ids one node matched in a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMatch {
    pub outline_id: String,
    pub document_ids: BTreeSet<String>,
    /// One entry per batch whose classification failed.
    pub warnings: Vec<String>,
}

/// A full matcher pass over the outline.
#[derive(Debug, Clone)]
pub struct AllocationPass {
    pub map: AllocationMap,
    /// Nodes whose classification finished. Every node unless cancelled.
    pub completed: BTreeSet<String>,
    pub cancelled: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelevantReply {
    Object { relevant_ids: Vec<String> },
    List(Vec<String>),
}

impl RelevantReply {
    fn into_ids(self) -> Vec<String> {
        match self {
            Self::Object { relevant_ids } => relevant_ids,
            Self::List(ids) => ids,
        }
    }
}

fn parse_relevant(text: &str) -> Result<Vec<String>> {
    prompts::parse_json_reply::<RelevantReply>(text).map(RelevantReply::into_ids)
}

#[derive(Clone)]
pub struct AllocationMatcher {
    client: ModelClient,
    counter: Arc<dyn TokenCounter>,
    settings: MatcherSettings,
}

impl AllocationMatcher {
    pub fn new(client: ModelClient, counter: Arc<dyn TokenCounter>, settings: MatcherSettings) -> Self {
        Self {
            client,
            counter,
            settings,
        }
    }

    pub fn settings(&self) -> &MatcherSettings {
        &self.settings
    }

    /// Allocatable documents in ascending id order.
    ///
    /// Documents without a summary, or whose summarization failed, are left out.
    pub fn candidates<'a, I>(&self, docs: I) -> Vec<Candidate>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut candidates: Vec<Candidate> = docs
            .into_iter()
            .filter(|d| d.is_allocatable())
            .map(|d| {
                let summary = d.summary.clone().unwrap_or_default();
                Candidate {
                    id: d.id.clone(),
                    title: d.title.clone(),
                    tokens: self.counter.count(&summary),
                    summary,
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.dedup_by(|a, b| a.id == b.id);
        candidates
    }

    /// Pack candidates into batches whose rendered list fits `batch_tokens`.
    ///
    /// An entry larger than the ceiling travels alone.
    pub fn batches(&self, candidates: &[Candidate]) -> Vec<Vec<Candidate>> {
        let mut batches = Vec::new();
        let mut current: Vec<Candidate> = Vec::new();
        let mut current_tokens = 0usize;

        for candidate in candidates {
            let tokens = self
                .counter
                .count(&prompts::listed_document(&candidate.listed()));
            if !current.is_empty() && current_tokens + tokens > self.settings.batch_tokens {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push(candidate.clone());
            current_tokens += tokens;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Status of a node holding `ids`, given the summary tokens of every document.
    pub fn classify(
        &self,
        ids: &BTreeSet<String>,
        summary_tokens: &BTreeMap<String, usize>,
    ) -> AllocationStatus {
        let tokens = ids.iter().filter_map(|id| summary_tokens.get(id)).sum();
        AllocationStatus::classify(ids.len(), tokens, self.settings.min_content_tokens)
    }

    /// Summary tokens per allocatable document id.
    pub fn summary_tokens<'a, I>(&self, docs: I) -> BTreeMap<String, usize>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        self.candidates(docs)
            .into_iter()
            .map(|c| (c.id, c.tokens))
            .collect()
    }

    /// Run the matcher over every outline node and build a fresh map.
    #[instrument(skip_all, fields(nodes = outline.len(), documents = docs.len()))]
    pub async fn allocate(&self, outline: &Outline, docs: &[Document]) -> Result<AllocationPass> {
        let candidates = self.candidates(docs);
        let tokens: BTreeMap<String, usize> =
            candidates.iter().map(|c| (c.id.clone(), c.tokens)).collect();

        let mut map = AllocationMap::new();
        for node in outline.nodes() {
            map.insert(AllocationEntry::empty(&node.id));
        }

        let outcome = self.match_nodes(outline.nodes(), &candidates).await?;
        let completed: BTreeSet<String> =
            outcome.completed.iter().map(|m| m.outline_id.clone()).collect();
        self.apply(&mut map, outcome.completed, &tokens);

        let unallocated = candidates.len().saturating_sub(map.allocated_union().len());
        let coverage = map.coverage();
        info!(
            sufficient = coverage.sufficient,
            insufficient = coverage.insufficient,
            empty = coverage.empty,
            coverage_rate = coverage.coverage_rate(),
            unallocated,
            cancelled = outcome.cancelled,
            "allocation pass finished"
        );

        Ok(AllocationPass {
            map,
            completed,
            cancelled: outcome.cancelled,
        })
    }

    /// Classify each node against `candidates`, one task per node.
    pub async fn match_nodes(
        &self,
        nodes: &[OutlineNode],
        candidates: &[Candidate],
    ) -> Result<PassOutcome<NodeMatch>> {
        let batches = Arc::new(self.batches(candidates));
        debug!(
            nodes = nodes.len(),
            candidates = candidates.len(),
            batches = batches.len(),
            "dispatching node classification"
        );

        let mut tasks = JoinSet::new();
        for node in nodes {
            let matcher = self.clone();
            let node = node.clone();
            let batches = Arc::clone(&batches);
            tasks.spawn(async move { matcher.match_node(&node, &batches).await });
        }
        drain(tasks).await
    }

    /// Classify one node against every batch, in batch order.
    ///
    /// A failed batch contributes nothing and leaves a warning. Only
    /// cancellation is returned as an error.
    #[instrument(skip_all, fields(outline_id = %node.id))]
    pub async fn match_node(&self, node: &OutlineNode, batches: &[Vec<Candidate>]) -> Result<NodeMatch> {
        let mut matched = NodeMatch {
            outline_id: node.id.clone(),
            ..Default::default()
        };

        for (i, batch) in batches.iter().enumerate() {
            let listed: Vec<ListedDocument<'_>> = batch.iter().map(Candidate::listed).collect();
            let request = prompts::allocation(node, &listed);

            match self.client.complete_with(&request, parse_relevant).await {
                Ok(ids) => {
                    let offered: HashSet<&str> = batch.iter().map(|c| c.id.as_str()).collect();
                    let mut discarded = 0usize;
                    for id in ids {
                        if offered.contains(id.as_str()) {
                            matched.document_ids.insert(id);
                        } else {
                            discarded += 1;
                        }
                    }
                    if discarded > 0 {
                        debug!(batch = i + 1, discarded, "dropped ids not offered in batch");
                    }
                }
                Err(ReportLoomError::Cancelled) => return Err(ReportLoomError::Cancelled),
                Err(e) => {
                    warn!(batch = i + 1, batches = batches.len(), error = %e, "classification batch failed");
                    matched.warnings.push(format!(
                        "classification batch {} of {} failed: {e}",
                        i + 1,
                        batches.len()
                    ));
                }
            }
        }

        Ok(matched)
    }

    /// Union node matches into `map` and recompute their status.
    pub fn apply(
        &self,
        map: &mut AllocationMap,
        matches: Vec<NodeMatch>,
        summary_tokens: &BTreeMap<String, usize>,
    ) {
        for m in matches {
            let entry = map
                .0
                .entry(m.outline_id.clone())
                .or_insert_with(|| AllocationEntry::empty(&m.outline_id));
            entry.absorb(m.document_ids);
            for warning in m.warnings {
                entry.warn(warning);
            }
            entry.status = self.classify(&entry.document_ids, summary_tokens);
        }
    }
}

impl std::fmt::Debug for AllocationMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationMatcher")
            .field("client", &self.client)
            .field("settings", &self.settings)
            .finish()
    }
}
