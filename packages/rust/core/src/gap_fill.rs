//! Gap-fill controller: supplementary collection for under-served nodes.
//!
//! The controller tracks a state per outline node and runs collection rounds.
//! Ingestion, summarization and re-matching of the new documents belong to
//! the pipeline, which reports the outcome back through
//! [`GapFillController::record_reallocation`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use reportloom_backend::Collector;
use reportloom_shared::{
    AllocationMap, AllocationStatus, AppConfig, Document, DocumentOrigin, Outline, Result,
};

use crate::gate::{CallGate, drain};

/// Prefix of the warning left on nodes still deficient after gap-fill.
pub const SUPPLEMENT_EXHAUSTED: &str = "SupplementExhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapFillSettings {
    pub max_rounds: u32,
    /// Documents requested from the collector per node and round.
    pub collect_limit: usize,
}

impl From<&AppConfig> for GapFillSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_rounds: config.gap_fill.max_rounds,
            collect_limit: config.collector.limit,
        }
    }
}

/// Where a node stands in the gap-fill cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unresolved,
    Allocated(AllocationStatus),
    SupplementRequested { round: u32 },
    Reallocated { round: u32, status: AllocationStatus },
    /// No further supplementation will be attempted.
    Exhausted,
}

impl NodeState {
    /// Whether the node should be supplemented in the next round.
    pub fn needs_supplement(&self) -> bool {
        match self {
            Self::Allocated(status) | Self::Reallocated { status, .. } => status.is_deficient(),
            _ => false,
        }
    }
}

/// Documents gathered in one collection round.
#[derive(Debug, Clone, Default)]
pub struct RoundCollection {
    pub round: u32,
    /// Newly seen documents, each tagged with the node that first requested it.
    pub documents: Vec<Document>,
    /// Nodes that received at least one new document and await re-matching.
    pub requested: Vec<String>,
    /// Nodes whose collection returned nothing new.
    pub exhausted: Vec<String>,
    pub cancelled: bool,
}

/// Final gap-fill summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapFillReport {
    /// Rounds in which collection ran.
    pub rounds: u32,
    pub supplemented_documents: usize,
    /// Nodes still `empty` or `insufficient`.
    pub exhausted: Vec<String>,
}

pub struct GapFillController {
    collector: Arc<dyn Collector>,
    gate: CallGate,
    settings: GapFillSettings,
    states: BTreeMap<String, NodeState>,
    seen: BTreeSet<String>,
    rounds: u32,
    supplemented: usize,
}

impl GapFillController {
    /// Start from the first full matcher pass.
    ///
    /// `known_ids` are the ids already in the store; collected documents
    /// carrying one of them are not new.
    pub fn new<I>(
        collector: Arc<dyn Collector>,
        gate: CallGate,
        settings: GapFillSettings,
        outline: &Outline,
        map: &AllocationMap,
        known_ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let states = outline
            .nodes()
            .iter()
            .map(|node| {
                let state = map
                    .get(&node.id)
                    .map_or(NodeState::Unresolved, |e| NodeState::Allocated(e.status));
                (node.id.clone(), state)
            })
            .collect();

        Self {
            collector,
            gate,
            settings,
            states,
            seen: known_ids.into_iter().collect(),
            rounds: 0,
            supplemented: 0,
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.settings.max_rounds
    }

    pub fn state(&self, outline_id: &str) -> Option<NodeState> {
        self.states.get(outline_id).copied()
    }

    /// Nodes to supplement next, in id order.
    pub fn pending(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, state)| state.needs_supplement())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ask the collector for more documents for every pending node.
    ///
    /// Each node's query is seeded with its title and description. Collector
    /// failures are fatal. A node that yields nothing new is exhausted.
    #[instrument(skip_all, fields(round = round))]
    pub async fn collect_round(&mut self, round: u32, outline: &Outline) -> Result<RoundCollection> {
        let pending = self.pending();
        let mut tasks = JoinSet::new();

        for id in &pending {
            let Some(node) = outline.get(id) else {
                continue;
            };
            self.states
                .insert(id.clone(), NodeState::SupplementRequested { round });

            let query = node.query_seed();
            let outline_id = node.id.clone();
            let collector = Arc::clone(&self.collector);
            let gate = self.gate.clone();
            let limit = self.settings.collect_limit;
            tasks.spawn(async move {
                debug!(%outline_id, %query, "requesting supplementary documents");
                let docs = gate.run(collector.collect(&query, limit)).await?;
                Ok((outline_id, docs))
            });
        }

        let outcome = drain(tasks).await?;
        self.rounds = round;

        let mut replies = outcome.completed;
        replies.sort_by(|a, b| a.0.cmp(&b.0));

        let known_before = self.seen.clone();
        let mut collection = RoundCollection {
            round,
            cancelled: outcome.cancelled,
            ..Default::default()
        };

        for (outline_id, docs) in replies {
            let mut brought_new = false;
            for mut doc in docs {
                if doc.id.trim().is_empty() || known_before.contains(&doc.id) {
                    continue;
                }
                brought_new = true;
                if !self.seen.insert(doc.id.clone()) {
                    // Already taken this round by another node.
                    continue;
                }
                doc.summary = None;
                doc.summary_kind = None;
                doc.truncated = false;
                doc.origin = DocumentOrigin::Supplement {
                    outline_id: outline_id.clone(),
                    round,
                };
                collection.documents.push(doc);
            }

            if brought_new {
                collection.requested.push(outline_id);
            } else {
                self.states.insert(outline_id.clone(), NodeState::Exhausted);
                collection.exhausted.push(outline_id);
            }
        }

        self.supplemented += collection.documents.len();
        info!(
            round,
            pending = pending.len(),
            new_documents = collection.documents.len(),
            exhausted = collection.exhausted.len(),
            "gap-fill collection finished"
        );
        Ok(collection)
    }

    /// Record the status of nodes re-matched after `round`.
    pub fn record_reallocation(&mut self, round: u32, map: &AllocationMap) {
        for (id, state) in self.states.iter_mut() {
            if *state == (NodeState::SupplementRequested { round }) {
                *state = match map.get(id) {
                    Some(entry) => NodeState::Reallocated {
                        round,
                        status: entry.status,
                    },
                    None => NodeState::Exhausted,
                };
            }
        }
    }

    /// Close the cycle: every node still deficient gets a warning.
    pub fn finish(mut self, map: &mut AllocationMap) -> GapFillReport {
        let mut exhausted = Vec::new();
        for entry in map.0.values_mut() {
            if !entry.status.is_deficient() {
                continue;
            }
            entry.warn(format!(
                "{SUPPLEMENT_EXHAUSTED}: still {} after {} gap-fill round(s)",
                entry.status.as_str(),
                self.rounds
            ));
            self.states
                .insert(entry.outline_id.clone(), NodeState::Exhausted);
            exhausted.push(entry.outline_id.clone());
        }

        if !exhausted.is_empty() {
            warn!(nodes = exhausted.len(), rounds = self.rounds, "outline nodes left under-served");
        }
        GapFillReport {
            rounds: self.rounds,
            supplemented_documents: self.supplemented,
            exhausted,
        }
    }
}

impl std::fmt::Debug for GapFillController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapFillController")
            .field("settings", &self.settings)
            .field("states", &self.states)
            .field("rounds", &self.rounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedCollector, doc, node, outline};
    use reportloom_shared::{AllocationEntry, ReportLoomError};
    use tokio_util::sync::CancellationToken;

    fn settings(max_rounds: u32) -> GapFillSettings {
        GapFillSettings {
            max_rounds,
            collect_limit: 5,
        }
    }

    fn entry(id: &str, ids: &[&str], status: AllocationStatus) -> AllocationEntry {
        let mut e = AllocationEntry::empty(id);
        e.absorb(ids.iter().map(|s| s.to_string()));
        e.status = status;
        e
    }

    fn two_nodes() -> Outline {
        outline(vec![
            node("a", "Market", "size and growth", None),
            node("b", "Competition", "vendor profiles", None),
        ])
    }

    fn first_pass() -> AllocationMap {
        let mut map = AllocationMap::new();
        map.insert(entry("a", &["d1"], AllocationStatus::Sufficient));
        map.insert(entry("b", &[], AllocationStatus::Empty));
        map
    }

    fn controller(collector: &ScriptedCollector, map: &AllocationMap) -> GapFillController {
        GapFillController::new(
            Arc::new(collector.clone()),
            CallGate::new(2, CancellationToken::new()),
            settings(2),
            &two_nodes(),
            map,
            ["d1".to_string()],
        )
    }

    #[test]
    fn settings_from_config() {
        let s = GapFillSettings::from(&AppConfig::default());
        assert_eq!(s.max_rounds, 2);
        assert_eq!(s.collect_limit, 5);
    }

    #[test]
    fn only_deficient_nodes_are_pending() {
        let collector = ScriptedCollector::new(|_, _| Ok(vec![]));
        let gf = controller(&collector, &first_pass());
        assert_eq!(gf.pending(), vec!["b"]);
        assert_eq!(
            gf.state("a"),
            Some(NodeState::Allocated(AllocationStatus::Sufficient))
        );
    }

    #[tokio::test]
    async fn collection_is_seeded_by_the_node_description() {
        let collector = ScriptedCollector::new(|_, _| {
            Ok(vec![doc("d1", "already known"), doc("s1", "vendor table")])
        });
        let mut gf = controller(&collector, &first_pass());

        let round = gf.collect_round(1, &two_nodes()).await.unwrap();
        assert_eq!(collector.queries(), vec!["Competition vendor profiles"]);
        assert_eq!(round.requested, vec!["b"]);
        assert_eq!(round.documents.len(), 1);

        let new = &round.documents[0];
        assert_eq!(new.id, "s1");
        assert_eq!(
            new.origin,
            DocumentOrigin::Supplement {
                outline_id: "b".into(),
                round: 1
            }
        );
        assert_eq!(gf.state("b"), Some(NodeState::SupplementRequested { round: 1 }));
    }

    #[tokio::test]
    async fn nothing_new_exhausts_the_node() {
        let collector = ScriptedCollector::new(|_, _| Ok(vec![doc("d1", "already known")]));
        let mut gf = controller(&collector, &first_pass());

        let round = gf.collect_round(1, &two_nodes()).await.unwrap();
        assert!(round.documents.is_empty());
        assert_eq!(round.exhausted, vec!["b"]);
        assert_eq!(gf.state("b"), Some(NodeState::Exhausted));
        assert!(gf.pending().is_empty());
    }

    #[tokio::test]
    async fn collector_failure_is_fatal() {
        let collector =
            ScriptedCollector::new(|_, _| Err(ReportLoomError::Collector("unreachable".into())));
        let mut gf = controller(&collector, &first_pass());

        let err = gf.collect_round(1, &two_nodes()).await.unwrap_err();
        assert!(matches!(err, ReportLoomError::Collector(_)));
    }

    #[tokio::test]
    async fn reallocation_and_finish_mark_remaining_gaps() {
        let collector = ScriptedCollector::new(|_, _| Ok(vec![doc("s1", "unrelated")]));
        let mut map = first_pass();
        let mut gf = controller(&collector, &map);

        gf.collect_round(1, &two_nodes()).await.unwrap();
        gf.record_reallocation(1, &map);
        assert_eq!(
            gf.state("b"),
            Some(NodeState::Reallocated {
                round: 1,
                status: AllocationStatus::Empty
            })
        );
        assert_eq!(gf.pending(), vec!["b"]);

        let report = gf.finish(&mut map);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.supplemented_documents, 1);
        assert_eq!(report.exhausted, vec!["b"]);

        let b = map.get("b").unwrap();
        assert!(b.warnings[0].starts_with(SUPPLEMENT_EXHAUSTED));
        assert!(map.get("a").unwrap().warnings.is_empty());
    }
}
