//! Visualization selector: chart-worthy document combinations.
//!
//! Allocated documents are grouped, each group is classified for chart
//! proposals, and every proposal is checked against the raw markdown of its
//! sources before it becomes an asset.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use reportloom_artifacts::RejectedVisualization;
use reportloom_markdown::{StructuredData, detect_structured_data, preview};
use reportloom_shared::{
    AllocationMap, AppConfig, ChartPriority, Document, GroupingStrategy, Outline, OutlineNode,
    ReportLoomError, Result, VisualizationAsset,
};

use crate::client::ModelClient;
use crate::gate::drain;
use crate::prompts::{self, ListedDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorSettings {
    pub enabled: bool,
    pub grouping: GroupingStrategy,
    pub max_items_per_batch: usize,
    /// Characters of each summary shown to the classifier.
    pub summary_preview_chars: usize,
}

impl From<&AppConfig> for SelectorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            enabled: config.visualization.enabled,
            grouping: config.visualization.grouping,
            max_items_per_batch: config.visualization.max_items_per_batch,
            summary_preview_chars: config.visualization.summary_preview_chars,
        }
    }
}

/// Documents classified together in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateGroup {
    pub label: String,
    pub outline_ids: Vec<String>,
    /// Sorted, unique.
    pub document_ids: Vec<String>,
}

/// Outcome of a selector pass.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Feasible assets, highest priority first.
    pub assets: Vec<VisualizationAsset>,
    pub rejected: Vec<RejectedVisualization>,
    /// Distinct proposals checked for feasibility.
    pub candidates: usize,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// Build classification groups from the allocation map.
///
/// Groups follow report order. Identical document sets are merged and
/// groups larger than `max_items` are split.
pub fn build_groups(
    outline: &Outline,
    map: &AllocationMap,
    strategy: GroupingStrategy,
    max_items: usize,
) -> Vec<CandidateGroup> {
    let mut raw: Vec<CandidateGroup> = Vec::new();

    match strategy {
        GroupingStrategy::Node => {
            for node in outline.report_order() {
                let Some(entry) = map.get(&node.id) else {
                    continue;
                };
                raw.push(CandidateGroup {
                    label: node.title.clone(),
                    outline_ids: vec![node.id.clone()],
                    document_ids: entry.document_ids.iter().cloned().collect(),
                });
            }
        }
        GroupingStrategy::ParentSection => {
            for root in outline.children(None) {
                let mut ids = BTreeSet::new();
                let mut outline_ids = Vec::new();
                for node in subtree(outline, root) {
                    if let Some(entry) = map.get(&node.id).filter(|e| !e.document_ids.is_empty()) {
                        ids.extend(entry.document_ids.iter().cloned());
                        outline_ids.push(node.id.clone());
                    }
                }
                raw.push(CandidateGroup {
                    label: root.title.clone(),
                    outline_ids,
                    document_ids: ids.into_iter().collect(),
                });
            }
        }
    }

    let mut merged: Vec<CandidateGroup> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    for group in raw.into_iter().filter(|g| !g.document_ids.is_empty()) {
        match index.get(&group.document_ids) {
            Some(&i) => {
                for id in group.outline_ids {
                    if !merged[i].outline_ids.contains(&id) {
                        merged[i].outline_ids.push(id);
                    }
                }
            }
            None => {
                index.insert(group.document_ids.clone(), merged.len());
                merged.push(group);
            }
        }
    }

    let max_items = max_items.max(1);
    let mut groups = Vec::new();
    for group in merged {
        let parts = group.document_ids.len().div_ceil(max_items);
        if parts <= 1 {
            groups.push(group);
            continue;
        }
        for (i, ids) in group.document_ids.chunks(max_items).enumerate() {
            groups.push(CandidateGroup {
                label: format!("{} (part {} of {parts})", group.label, i + 1),
                outline_ids: group.outline_ids.clone(),
                document_ids: ids.to_vec(),
            });
        }
    }
    groups
}

/// `root` and all its descendants, depth-first.
fn subtree<'a>(outline: &'a Outline, root: &'a OutlineNode) -> Vec<&'a OutlineNode> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push(node);
        let children = outline.children(Some(&node.id));
        stack.extend(children.into_iter().rev());
    }
    out
}

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Proposal {
    #[serde(alias = "visualization_type", alias = "type")]
    chart_kind: String,
    #[serde(default, alias = "data_ids", alias = "source_document_ids")]
    document_ids: Vec<String>,
    #[serde(default, alias = "chart_title")]
    title: String,
    #[serde(default)]
    reason: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    priority: ChartPriority,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProposalReply {
    Object { visualizations: Vec<Proposal> },
    List(Vec<Proposal>),
}

fn lenient_priority<'de, D>(deserializer: D) -> std::result::Result<ChartPriority, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    let priority = match raw.as_str().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("high") => ChartPriority::High,
        Some("low") => ChartPriority::Low,
        _ => ChartPriority::Medium,
    };
    Ok(priority)
}

fn parse_proposals(text: &str) -> Result<Vec<Proposal>> {
    prompts::parse_json_reply::<ProposalReply>(text).map(|reply| match reply {
        ProposalReply::Object { visualizations } => visualizations,
        ProposalReply::List(list) => list,
    })
}

/// A proposal narrowed to its group, before feasibility.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChartCandidate {
    chart_kind: String,
    /// Sorted, unique, within the group.
    document_ids: Vec<String>,
    title: String,
    reason: String,
    priority: ChartPriority,
    outline_ids: Vec<String>,
}

fn narrow(proposals: Vec<Proposal>, group: &CandidateGroup) -> Vec<ChartCandidate> {
    let allowed: BTreeSet<&str> = group.document_ids.iter().map(String::as_str).collect();
    proposals
        .into_iter()
        .filter_map(|p| {
            let ids: BTreeSet<String> = p
                .document_ids
                .into_iter()
                .filter(|id| allowed.contains(id.as_str()))
                .collect();
            let kind = p.chart_kind.trim().to_ascii_lowercase();
            if ids.is_empty() || kind.is_empty() {
                return None;
            }
            Some(ChartCandidate {
                chart_kind: kind,
                document_ids: ids.into_iter().collect(),
                title: p.title.trim().to_string(),
                reason: p.reason.trim().to_string(),
                priority: p.priority,
                outline_ids: group.outline_ids.clone(),
            })
        })
        .collect()
}

/// Merge candidates sharing a source id set, then order by priority.
fn merge_candidates(candidates: Vec<ChartCandidate>) -> Vec<ChartCandidate> {
    let mut by_ids: BTreeMap<Vec<String>, ChartCandidate> = BTreeMap::new();
    for candidate in candidates {
        match by_ids.get_mut(&candidate.document_ids) {
            Some(kept) => {
                for id in &candidate.outline_ids {
                    if !kept.outline_ids.contains(id) {
                        kept.outline_ids.push(id.clone());
                    }
                }
                if candidate.priority < kept.priority {
                    let outline_ids = std::mem::take(&mut kept.outline_ids);
                    *kept = ChartCandidate {
                        outline_ids,
                        ..candidate
                    };
                }
            }
            None => {
                by_ids.insert(candidate.document_ids.clone(), candidate);
            }
        }
    }

    let mut merged: Vec<ChartCandidate> = by_ids.into_values().collect();
    merged.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.document_ids.cmp(&b.document_ids))
    });
    merged
}

// ---------------------------------------------------------------------------
// Feasibility
// ---------------------------------------------------------------------------

/// Numeric points a chart kind needs to be drawable.
pub fn min_points(chart_kind: &str) -> usize {
    match chart_kind {
        "table" => 1,
        "pie" | "donut" | "doughnut" => 2,
        "bar" | "column" | "histogram" | "stacked_bar" => 2,
        "line" | "area" | "trend" => 3,
        "scatter" | "bubble" => 4,
        _ => 2,
    }
}

/// Deterministic asset id from chart kind and source ids.
pub fn asset_id(chart_kind: &str, document_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chart_kind.as_bytes());
    for id in document_ids {
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("viz_{}", &digest[..12])
}

/// The referenced documents whose raw markdown carries numeric data, with
/// their merged profile. Sources without data are not bound to a chart.
fn data_sources(
    document_ids: &[String],
    docs: &HashMap<&str, &Document>,
) -> (Vec<String>, StructuredData) {
    let mut sources = Vec::new();
    let mut merged = StructuredData::default();
    for id in document_ids {
        let Some(doc) = docs.get(id.as_str()) else {
            continue;
        };
        let data = detect_structured_data(&doc.markdown);
        if data.has_data() {
            sources.push(id.clone());
            merged = merged.merge(data);
        }
    }
    (sources, merged)
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VisualizationSelector {
    client: ModelClient,
    settings: SelectorSettings,
}

impl VisualizationSelector {
    pub fn new(client: ModelClient, settings: SelectorSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    /// Propose, validate and bind chart assets for the allocated documents.
    #[instrument(skip_all, fields(nodes = outline.len()))]
    pub async fn select(
        &self,
        outline: &Outline,
        map: &AllocationMap,
        docs: &[Document],
    ) -> Result<Selection> {
        if !self.settings.enabled {
            debug!("visualization selection disabled");
            return Ok(Selection::default());
        }

        let by_id: HashMap<&str, &Document> = docs.iter().map(|d| (d.id.as_str(), d)).collect();
        let groups = build_groups(
            outline,
            map,
            self.settings.grouping,
            self.settings.max_items_per_batch,
        );

        let mut tasks = JoinSet::new();
        for group in &groups {
            let items: Vec<(String, String, String)> = group
                .document_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|d| {
                    let summary = d.summary.as_deref().unwrap_or_default();
                    (
                        d.id.clone(),
                        d.title.clone(),
                        preview(summary, self.settings.summary_preview_chars),
                    )
                })
                .collect();
            let selector = self.clone();
            let group = group.clone();
            tasks.spawn(async move { selector.classify_group(&group, &items).await });
        }

        let outcome = drain(tasks).await?;
        let candidates = merge_candidates(outcome.completed.into_iter().flatten().collect());

        let mut selection = Selection {
            candidates: candidates.len(),
            cancelled: outcome.cancelled,
            ..Default::default()
        };

        for candidate in candidates {
            let (sources, data) = data_sources(&candidate.document_ids, &by_id);
            let needed = min_points(&candidate.chart_kind);
            let points = data.numeric_points();

            if !sources.is_empty() && points >= needed {
                if sources.len() < candidate.document_ids.len() {
                    debug!(
                        chart_kind = %candidate.chart_kind,
                        proposed = candidate.document_ids.len(),
                        bound = sources.len(),
                        "dropping sources without numeric data"
                    );
                }
                selection.assets.push(VisualizationAsset {
                    id: asset_id(&candidate.chart_kind, &sources),
                    source_document_ids: sources,
                    chart_kind: candidate.chart_kind,
                    feasible: true,
                    title: candidate.title,
                    reason: candidate.reason,
                    priority: candidate.priority,
                    outline_ids: candidate.outline_ids,
                });
            } else {
                debug!(
                    chart_kind = %candidate.chart_kind,
                    points,
                    needed,
                    "rejecting visualization without enough data"
                );
                selection.rejected.push(RejectedVisualization {
                    reason: format!(
                        "{} chart needs at least {needed} numeric data points, sources provide {points}",
                        candidate.chart_kind
                    ),
                    chart_kind: candidate.chart_kind,
                    source_document_ids: candidate.document_ids,
                    title: candidate.title,
                });
            }
        }

        info!(
            groups = groups.len(),
            candidates = selection.candidates,
            feasible = selection.assets.len(),
            rejected = selection.rejected.len(),
            "visualization selection finished"
        );
        Ok(selection)
    }

    /// Ask for chart proposals for one group.
    ///
    /// A failed classification contributes nothing.
    async fn classify_group(
        &self,
        group: &CandidateGroup,
        items: &[(String, String, String)],
    ) -> Result<Vec<ChartCandidate>> {
        let listed: Vec<ListedDocument<'_>> = items
            .iter()
            .map(|(id, title, summary)| ListedDocument { id, title, summary })
            .collect();
        let request = prompts::visualization(&group.label, &listed);

        match self.client.complete_with(&request, parse_proposals).await {
            Ok(proposals) => Ok(narrow(proposals, group)),
            Err(ReportLoomError::Cancelled) => Err(ReportLoomError::Cancelled),
            Err(e) => {
                warn!(group = %group.label, error = %e, "visualization classification failed");
                Ok(Vec::new())
            }
        }
    }
}
