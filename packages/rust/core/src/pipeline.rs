//! End-to-end run: ingest → summarize → allocate → gap-fill → visualize → artifacts.
//!
//! The orchestrator is the only writer to the store. Components hand back
//! their results and the pipeline commits them, including the partial results
//! of a cancelled pass, so a cancelled run resumes against the same database.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use reportloom_artifacts::{
    DOCUMENTS_FILE, RunManifest, RunOutputs, RunStats, write_artifact, write_run_artifacts,
};
use reportloom_backend::{Collector, CompletionBackend};
use reportloom_markdown::{EstimatingCounter, TokenCounter};
use reportloom_shared::{
    AllocationMap, AppConfig, Document, Outline, OutlineNode, ReportLoomError, Result, RunId,
};
use reportloom_storage::{DocumentStats, Storage, content_hash};

use crate::allocation::{AllocationMatcher, MatcherSettings};
use crate::client::{ModelClient, RetryPolicy};
use crate::gap_fill::{GapFillController, GapFillReport, GapFillSettings};
use crate::gate::CallGate;
use crate::summarizer::{Summarizer, SummarizerSettings};
use crate::visualization::{SelectorSettings, VisualizationSelector};

/// Runtime configuration of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory the artifacts are written to.
    pub out_dir: PathBuf,
    /// Ceiling on in-flight external calls.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub summarizer: SummarizerSettings,
    pub matcher: MatcherSettings,
    pub gap_fill: GapFillSettings,
    pub selector: SelectorSettings,
    /// Effective configuration recorded in the manifest.
    pub snapshot: Option<serde_json::Value>,
}

impl PipelineConfig {
    /// Validate `config` and derive the runtime settings from it.
    pub fn from_app(config: &AppConfig, out_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            out_dir: out_dir.into(),
            max_concurrency: config.defaults.max_concurrency,
            retry: RetryPolicy::from(&config.retry),
            summarizer: SummarizerSettings::from(config),
            matcher: MatcherSettings::from(config),
            gap_fill: GapFillSettings::from(config),
            selector: SelectorSettings::from(config),
            snapshot: serde_json::to_value(config).ok(),
        })
    }
}

/// External collaborators of a run.
#[derive(Clone)]
pub struct PipelineServices {
    pub backend: Arc<dyn CompletionBackend>,
    pub collector: Arc<dyn Collector>,
    pub counter: Arc<dyn TokenCounter>,
}

impl PipelineServices {
    /// Services with the estimating token counter.
    pub fn new(backend: Arc<dyn CompletionBackend>, collector: Arc<dyn Collector>) -> Self {
        Self {
            backend,
            collector,
            counter: Arc::new(EstimatingCounter),
        }
    }
}

/// Result of [`run_pipeline`].
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub out_dir: PathBuf,
    /// The manifest as written, with statistics and checksums.
    pub manifest: RunManifest,
    pub gap_fill: GapFillReport,
    pub elapsed: Duration,
}

/// Result of [`summarize_only`].
#[derive(Debug)]
pub struct SummarizeReport {
    pub stats: DocumentStats,
    /// Summaries reused from the cache.
    pub cache_hits: usize,
    /// Path of the flattened document data.
    pub output: PathBuf,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called with a short status line inside a phase.
    fn detail(&self, message: &str);
    /// Called when the run completes.
    fn done(&self, stats: &RunStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn detail(&self, _message: &str) {}
    fn done(&self, _stats: &RunStats) {}
}

/// The run's components, sharing one gate and one backend.
struct Components {
    summarizer: Summarizer,
    matcher: AllocationMatcher,
    selector: VisualizationSelector,
    gate: CallGate,
}

impl Components {
    fn new(config: &PipelineConfig, services: &PipelineServices, cancel: CancellationToken) -> Self {
        let gate = CallGate::new(config.max_concurrency, cancel);
        let client = ModelClient::new(Arc::clone(&services.backend), gate.clone(), config.retry);
        Self {
            summarizer: Summarizer::new(
                client.clone(),
                Arc::clone(&services.counter),
                config.summarizer,
            ),
            matcher: AllocationMatcher::new(
                client.clone(),
                Arc::clone(&services.counter),
                config.matcher,
            ),
            selector: VisualizationSelector::new(client, config.selector),
            gate,
        }
    }
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

/// Run the whole pipeline for `documents` against `outline`.
///
/// The run is recorded in the store with its final status. On cancellation
/// everything finished so far is committed and [`ReportLoomError::Cancelled`]
/// is returned.
#[instrument(skip_all, fields(documents = documents.len(), nodes = outline.len()))]
pub async fn run_pipeline(
    storage: &Storage,
    documents: &[Document],
    outline: &Outline,
    config: &PipelineConfig,
    services: &PipelineServices,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let run_id = RunId::new();
    storage.insert_run(&run_id).await?;
    info!(%run_id, model = services.backend.model_id(), "starting run");

    let result = run_phases(
        storage, documents, outline, config, services, cancel, progress, &run_id,
    )
    .await;

    match &result {
        Ok(report) => {
            let stats = serde_json::to_string(&report.manifest.stats).unwrap_or_default();
            storage.finish_run(&run_id, "completed", &stats).await?;
            progress.done(&report.manifest.stats);
            info!(
                %run_id,
                elapsed_ms = report.elapsed.as_millis() as u64,
                coverage_rate = report.manifest.stats.coverage_rate,
                "run completed"
            );
        }
        Err(ReportLoomError::Cancelled) => {
            storage.finish_run(&run_id, "cancelled", "{}").await?;
            warn!(%run_id, "run cancelled, completed work committed");
        }
        Err(e) => {
            if let Err(record_err) = storage.finish_run(&run_id, "failed", "{}").await {
                warn!(error = %record_err, "could not record failed run");
            }
            warn!(%run_id, error = %e, "run failed");
        }
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn run_phases(
    storage: &Storage,
    documents: &[Document],
    outline: &Outline,
    config: &PipelineConfig,
    services: &PipelineServices,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
    run_id: &RunId,
) -> Result<RunReport> {
    let start = Instant::now();
    let started_at = Utc::now();
    let parts = Components::new(config, services, cancel);

    // --- Phase 1: Ingest ---
    progress.phase("Ingesting documents");
    let inserted = storage.insert_documents(documents).await?;
    info!(offered = documents.len(), new = inserted.len(), "documents ingested");

    // --- Phase 2: Summarize ---
    progress.phase("Summarizing documents");
    summarize_pending(storage, &parts.summarizer, progress).await?;

    // --- Phase 3: Allocate ---
    progress.phase("Allocating documents to outline");
    let docs = storage.list_documents().await?;
    let pass = parts.matcher.allocate(outline, &docs).await?;
    if pass.cancelled {
        // Nodes that never got classified keep their last committed entry.
        save_entries(storage, &pass.map, &pass.completed).await?;
        return Err(ReportLoomError::Cancelled);
    }
    storage.replace_allocations(&pass.map).await?;
    let mut map = pass.map;
    let coverage = map.coverage();
    progress.detail(&format!(
        "{} sufficient, {} insufficient, {} empty",
        coverage.sufficient, coverage.insufficient, coverage.empty
    ));

    // --- Phase 4: Gap-fill ---
    progress.phase("Filling allocation gaps");
    let controller = GapFillController::new(
        Arc::clone(&services.collector),
        parts.gate.clone(),
        config.gap_fill,
        outline,
        &map,
        docs.iter().map(|d| d.id.clone()),
    );
    let gap_fill = fill_gaps(storage, outline, &mut map, &parts, controller, progress).await?;

    // --- Phase 5: Visualization ---
    progress.phase("Selecting visualizations");
    let docs = storage.list_documents().await?;
    let selection = parts.selector.select(outline, &map, &docs).await?;
    storage.replace_visualization_assets(&selection.assets).await?;
    if selection.cancelled {
        return Err(ReportLoomError::Cancelled);
    }

    // --- Phase 6: Artifacts ---
    progress.phase("Writing artifacts");
    let doc_stats = storage.document_stats().await?;
    let coverage = map.coverage();
    let allocated = map.allocated_union();
    let unallocated = docs
        .iter()
        .filter(|d| d.is_allocatable() && !allocated.contains(&d.id))
        .count();

    let mut manifest = RunManifest::new(run_id.clone(), services.backend.model_id(), started_at);
    manifest.stats = RunStats {
        documents: doc_stats.total,
        supplementary_documents: doc_stats.supplementary,
        summarized: doc_stats.summarized,
        failed_summaries: doc_stats.failed,
        truncated_documents: doc_stats.truncated,
        coverage,
        coverage_rate: coverage.coverage_rate(),
        unallocated_documents: unallocated,
        gap_fill_rounds: gap_fill.rounds,
        visualization_candidates: selection.candidates,
        visualization_assets: selection.assets.len(),
    };
    manifest.rejected_visualizations = selection.rejected;
    manifest.config = config.snapshot.clone();

    let outputs = RunOutputs {
        allocation: &map,
        assets: &selection.assets,
        documents: &docs,
    };
    let manifest = write_run_artifacts(&config.out_dir, &outputs, manifest)?;

    Ok(RunReport {
        run_id: run_id.clone(),
        out_dir: config.out_dir.clone(),
        manifest,
        gap_fill,
        elapsed: start.elapsed(),
    })
}

// ---------------------------------------------------------------------------
// Summarize only
// ---------------------------------------------------------------------------

/// Ingest and summarize `documents`, then write the flattened document data.
#[instrument(skip_all, fields(documents = documents.len()))]
pub async fn summarize_only(
    storage: &Storage,
    documents: &[Document],
    config: &PipelineConfig,
    services: &PipelineServices,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<SummarizeReport> {
    let start = Instant::now();
    let parts = Components::new(config, services, cancel);

    progress.phase("Ingesting documents");
    storage.insert_documents(documents).await?;

    progress.phase("Summarizing documents");
    let cache_hits = summarize_pending(storage, &parts.summarizer, progress).await?;

    progress.phase("Writing document data");
    let docs = storage.list_documents().await?;
    std::fs::create_dir_all(&config.out_dir)
        .map_err(|e| ReportLoomError::io(&config.out_dir, e))?;
    write_artifact(&config.out_dir, DOCUMENTS_FILE, &docs)?;

    let stats = storage.document_stats().await?;
    progress.done(&RunStats {
        documents: stats.total,
        supplementary_documents: stats.supplementary,
        summarized: stats.summarized,
        failed_summaries: stats.failed,
        truncated_documents: stats.truncated,
        ..Default::default()
    });

    Ok(SummarizeReport {
        stats,
        cache_hits,
        output: config.out_dir.join(DOCUMENTS_FILE),
        elapsed: start.elapsed(),
    })
}

// ---------------------------------------------------------------------------
// Phase helpers
// ---------------------------------------------------------------------------

/// Summarize every document the store has not summarized yet.
///
/// Cached summaries for the same body and model are reused. Returns the
/// number of cache hits.
async fn summarize_pending(
    storage: &Storage,
    summarizer: &Summarizer,
    progress: &dyn ProgressReporter,
) -> Result<usize> {
    let pending = storage.list_unsummarized().await?;
    if pending.is_empty() {
        return Ok(0);
    }
    let model_id = summarizer.model_id().to_string();

    let mut uncached = Vec::new();
    let mut cache_hits = 0usize;
    for doc in pending {
        let hash = content_hash(&doc.markdown);
        match storage.get_cached_summary(&hash, &model_id).await? {
            Some(cached) => {
                let truncated = summarizer.exceeds_document_limit(&doc.markdown);
                storage
                    .set_summary(&doc.id, &cached.summary, Some(cached.kind), truncated)
                    .await?;
                cache_hits += 1;
            }
            None => uncached.push(doc),
        }
    }
    progress.detail(&format!(
        "{} to summarize, {cache_hits} from cache",
        uncached.len()
    ));

    let outcome = summarizer.summarize_all(&uncached).await?;
    for group in &outcome.completed {
        let result = &group.outcome;
        for id in &group.document_ids {
            storage
                .set_summary(id, &result.summary, result.kind, result.truncated)
                .await?;
        }
        if let Some(kind) = result.kind {
            storage
                .set_cached_summary(&group.content_hash, &model_id, &result.summary, kind)
                .await?;
        }
    }

    if outcome.cancelled {
        return Err(ReportLoomError::Cancelled);
    }
    Ok(cache_hits)
}

/// Upsert the entries of `ids` only.
async fn save_entries(
    storage: &Storage,
    map: &AllocationMap,
    ids: &BTreeSet<String>,
) -> Result<()> {
    for entry in map.entries().filter(|e| ids.contains(&e.outline_id)) {
        storage.upsert_allocation(entry).await?;
    }
    Ok(())
}

/// Gap-fill rounds: collect, ingest, summarize, re-match, union.
async fn fill_gaps(
    storage: &Storage,
    outline: &Outline,
    map: &mut AllocationMap,
    parts: &Components,
    mut controller: GapFillController,
    progress: &dyn ProgressReporter,
) -> Result<GapFillReport> {
    for round in 1..=controller.max_rounds() {
        let pending = controller.pending();
        if pending.is_empty() {
            break;
        }
        progress.detail(&format!(
            "round {round}: {} under-served node(s)",
            pending.len()
        ));

        let collection = controller.collect_round(round, outline).await?;
        storage.insert_documents(&collection.documents).await?;
        if collection.cancelled {
            return Err(ReportLoomError::Cancelled);
        }
        if collection.documents.is_empty() {
            continue;
        }

        summarize_pending(storage, &parts.summarizer, progress).await?;

        let docs = storage.list_documents().await?;
        let new_ids: HashSet<&str> = collection.documents.iter().map(|d| d.id.as_str()).collect();
        let candidates = parts
            .matcher
            .candidates(docs.iter().filter(|d| new_ids.contains(d.id.as_str())));
        let nodes: Vec<OutlineNode> = collection
            .requested
            .iter()
            .filter_map(|id| outline.get(id).cloned())
            .collect();

        let before: BTreeSet<String> = map.allocated_union();
        let outcome = parts.matcher.match_nodes(&nodes, &candidates).await?;
        let rematched: BTreeSet<String> = outcome
            .completed
            .iter()
            .map(|m| m.outline_id.clone())
            .collect();
        let tokens = parts.matcher.summary_tokens(&docs);
        parts.matcher.apply(map, outcome.completed, &tokens);
        controller.record_reallocation(round, map);
        save_entries(storage, map, &rematched).await?;

        info!(
            round,
            rematched = nodes.len(),
            candidates = candidates.len(),
            newly_allocated = map.allocated_union().difference(&before).count(),
            "gap-fill round finished"
        );
        if outcome.cancelled {
            return Err(ReportLoomError::Cancelled);
        }
    }

    let report = controller.finish(map);
    storage.save_allocations(map).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap_fill::SUPPLEMENT_EXHAUSTED;
    use crate::prompts::{ALLOCATION_SYSTEM, SUMMARY_SYSTEM};
    use crate::test_support::{
        ScriptedBackend, ScriptedCollector, doc, ids_matching, listed, node, outline, section,
        section_title, temp_dir, temp_storage,
    };
    use reportloom_artifacts::{read_allocation, read_documents, read_outline, validate_run_dir};
    use reportloom_backend::CompletionRequest;
    use reportloom_shared::{AllocationStatus, DocumentOrigin, RetryConfig, SummaryKind};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TABLE_DOC: &str = "Market revenue reached 40 billion\n\n| Year | Revenue |\n|---|---|\n| 2021 | 30 |\n| 2022 | 35 |\n| 2023 | 40 |\n";

    /// Summaries echo the first line of the content. Sections match summaries
    /// containing their title, or everything when `match_all` is set.
    fn reply(req: &CompletionRequest, match_all: bool) -> Result<String> {
        let system = req.system.as_deref().unwrap_or_default();
        if system == SUMMARY_SYSTEM {
            let body = section(&req.prompt, "content")
                .or_else(|| section(&req.prompt, "summary"))
                .unwrap_or_default();
            let first = body.lines().find(|l| !l.trim().is_empty()).unwrap_or("empty");
            Ok(first.chars().take(80).collect())
        } else if system == ALLOCATION_SYSTEM {
            let needle = if match_all {
                ""
            } else {
                section_title(&req.prompt).unwrap_or_default()
            };
            Ok(ids_matching(&req.prompt, needle))
        } else {
            let mut ids: Vec<String> = listed(&req.prompt).into_iter().map(|(id, _)| id).collect();
            ids.push("ghost".into());
            Ok(serde_json::json!({
                "visualizations": [
                    {"visualization_type": "bar", "data_ids": ids, "chart_title": "Figures", "priority": "high"}
                ]
            })
            .to_string())
        }
    }

    fn backend(match_all: bool) -> ScriptedBackend {
        ScriptedBackend::new(move |req| reply(req, match_all))
    }

    fn empty_collector() -> ScriptedCollector {
        ScriptedCollector::new(|_, _| Ok(vec![]))
    }

    fn app_config() -> AppConfig {
        let mut app = AppConfig::default();
        app.allocation.min_content_tokens = 1;
        app.retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        };
        app
    }

    fn pipeline_config(app: &AppConfig, out: &Path) -> PipelineConfig {
        PipelineConfig::from_app(app, out).unwrap()
    }

    fn services(backend: &ScriptedBackend, collector: &ScriptedCollector) -> PipelineServices {
        PipelineServices::new(Arc::new(backend.clone()), Arc::new(collector.clone()))
    }

    fn market_and_competition() -> Outline {
        outline(vec![
            node("A", "Market", "market size", None),
            node("B", "Competition", "vendor profiles", None),
        ])
    }

    async fn run(
        storage: &Storage,
        docs: &[Document],
        outline: &Outline,
        config: &PipelineConfig,
        backend: &ScriptedBackend,
        collector: &ScriptedCollector,
    ) -> Result<RunReport> {
        run_pipeline(
            storage,
            docs,
            outline,
            config,
            &services(backend, collector),
            CancellationToken::new(),
            &SilentProgress,
        )
        .await
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut app = AppConfig::default();
        app.summarizer.max_summary_tokens = app.summarizer.max_context_tokens + 1;
        let err = PipelineConfig::from_app(&app, "out").unwrap_err();
        assert!(matches!(err, ReportLoomError::Config { .. }));
    }

    #[tokio::test]
    async fn mixed_sizes_fold_only_the_large_document() {
        let (storage, dir) = temp_storage("sizes").await;
        let backend = backend(false);
        let config = pipeline_config(&app_config(), &dir.join("out"));

        let small = format!("Market revenue overview\n\n{}", "m".repeat(1_975));
        let large = format!("{}\n", "a".repeat(399)).repeat(500);
        let tiny = format!("Competition notes\n\n{}", "c".repeat(781));
        let docs = vec![doc("doc1", &small), doc("doc2", &large), doc("doc3", &tiny)];

        let report = summarize_only(
            &storage,
            &docs,
            &config,
            &services(&backend, &empty_collector()),
            CancellationToken::new(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(report.stats.summarized, 3);
        assert_eq!(report.cache_hits, 0);
        assert!(report.output.exists());

        let kind = |d: Option<Document>| d.unwrap().summary_kind;
        assert_eq!(kind(storage.get_document("doc1").await.unwrap()), Some(SummaryKind::Full));
        assert_eq!(
            kind(storage.get_document("doc2").await.unwrap()),
            Some(SummaryKind::Incremental)
        );
        assert_eq!(kind(storage.get_document("doc3").await.unwrap()), Some(SummaryKind::Full));

        let counter = EstimatingCounter;
        let requests = backend.requests_with(SUMMARY_SYSTEM);
        assert_eq!(requests.len(), 10);
        let folds: Vec<_> = requests
            .iter()
            .filter(|r| r.prompt.contains("part by part"))
            .collect();
        assert_eq!(folds.len(), 8);
        for fold in folds {
            assert!(counter.count(section(&fold.prompt, "content").unwrap()) <= 6_400);
        }

        let flattened = read_documents(&report.output).unwrap();
        assert_eq!(flattened.len(), 3);
        assert!(flattened.iter().all(|d| d.summary.is_some()));
    }

    #[tokio::test]
    async fn gap_fill_supplements_the_empty_node() {
        let (storage, dir) = temp_storage("gapfill").await;
        let backend = backend(false);
        let collector = ScriptedCollector::new(|_, _| {
            Ok(vec![doc("s1", "Competition vendor landscape\n\nDetails.")])
        });
        let config = pipeline_config(&app_config(), &dir.join("out"));

        let report = run(
            &storage,
            &[doc("doc1", TABLE_DOC)],
            &market_and_competition(),
            &config,
            &backend,
            &collector,
        )
        .await
        .unwrap();

        assert_eq!(collector.queries(), vec!["Competition vendor profiles"]);
        assert_eq!(report.gap_fill.rounds, 1);

        let map = storage.load_allocations().await.unwrap();
        let a = map.get("A").unwrap();
        assert_eq!(a.document_ids.iter().collect::<Vec<_>>(), vec!["doc1"]);
        assert_eq!(a.status, AllocationStatus::Sufficient);
        let b = map.get("B").unwrap();
        assert_eq!(b.document_ids.iter().collect::<Vec<_>>(), vec!["s1"]);
        assert_eq!(b.status, AllocationStatus::Sufficient);

        let s1 = storage.get_document("s1").await.unwrap().unwrap();
        assert_eq!(
            s1.origin,
            DocumentOrigin::Supplement {
                outline_id: "B".into(),
                round: 1
            }
        );
        assert_eq!(report.manifest.stats.supplementary_documents, 1);
    }

    #[tokio::test]
    async fn unfilled_node_is_marked_exhausted() {
        let (storage, dir) = temp_storage("exhausted").await;
        let backend = backend(false);
        let collector = empty_collector();
        let config = pipeline_config(&app_config(), &dir.join("out"));

        let report = run(
            &storage,
            &[doc("doc1", TABLE_DOC)],
            &market_and_competition(),
            &config,
            &backend,
            &collector,
        )
        .await
        .unwrap();

        assert_eq!(collector.queries(), vec!["Competition vendor profiles"]);
        assert_eq!(report.gap_fill.exhausted, vec!["B"]);

        let records = read_allocation(&report.out_dir).unwrap();
        assert_eq!(records["A"].document_ids, vec!["doc1"]);
        assert_eq!(records["A"].status, AllocationStatus::Sufficient);
        assert!(records["B"].document_ids.is_empty());
        assert_eq!(records["B"].status, AllocationStatus::Empty);
        assert!(records["B"].warnings[0].starts_with(SUPPLEMENT_EXHAUSTED));
    }

    #[tokio::test]
    async fn gap_fill_rounds_never_drop_allocated_ids() {
        let (storage, dir) = temp_storage("monotonic").await;
        let backend = backend(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let collector = ScriptedCollector::new(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let body = if n == 1 {
                "Market share by region"
            } else {
                "Unrelated topic"
            };
            Ok(vec![doc(&format!("s{n}"), body)])
        });
        let mut app = app_config();
        app.allocation.min_content_tokens = 1_000;
        let config = pipeline_config(&app, &dir.join("out"));

        let report = run(
            &storage,
            &[doc("doc1", TABLE_DOC)],
            &outline(vec![node("A", "Market", "market size", None)]),
            &config,
            &backend,
            &collector,
        )
        .await
        .unwrap();

        assert_eq!(report.gap_fill.rounds, 2);
        let map = storage.load_allocations().await.unwrap();
        let a = map.get("A").unwrap();
        assert_eq!(a.document_ids.iter().collect::<Vec<_>>(), vec!["doc1", "s1"]);
        assert_eq!(a.status, AllocationStatus::Insufficient);
        assert!(a.warnings.iter().any(|w| w.starts_with(SUPPLEMENT_EXHAUSTED)));

        // The second round only offered the newly collected document.
        let last = backend.requests_with(ALLOCATION_SYSTEM).pop().unwrap();
        let offered: Vec<String> = listed(&last.prompt).into_iter().map(|(id, _)| id).collect();
        assert_eq!(offered, vec!["s2"]);
    }

    #[tokio::test]
    async fn fixture_run_covers_every_node_and_traces_assets() {
        let (storage, dir) = temp_storage("fixtures").await;
        let docs = read_documents(Path::new("../../../fixtures/json/documents.fixture.json")).unwrap();
        let outline = read_outline(Path::new("../../../fixtures/json/outline.fixture.json")).unwrap();
        let backend = backend(true);
        let config = pipeline_config(&app_config(), &dir.join("out"));

        let report = run(&storage, &docs, &outline, &config, &backend, &empty_collector())
            .await
            .unwrap();

        let manifest = validate_run_dir(&report.out_dir).unwrap();
        assert_eq!(manifest.stats.documents, 3);
        assert_eq!(manifest.stats.coverage.total_nodes, 4);
        assert_eq!(manifest.stats.coverage.sufficient, 4);

        let records = read_allocation(&report.out_dir).unwrap();
        for node in outline.nodes() {
            assert!(records.contains_key(&node.id), "missing entry for {}", node.id);
        }

        let map = storage.load_allocations().await.unwrap();
        let allocated = map.allocated_union();
        let assets = storage.list_visualization_assets().await.unwrap();
        assert!(!assets.is_empty());
        for asset in &assets {
            assert!(asset.feasible);
            assert!(!asset.source_document_ids.contains(&"ghost".to_string()));
            assert!(asset.source_document_ids.iter().all(|id| allocated.contains(id)));
        }
        assert_eq!(manifest.stats.visualization_assets, assets.len());

        let latest = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(latest.status, "completed");
    }

    #[tokio::test]
    async fn rerun_without_new_data_is_identical() {
        let (storage, dir) = temp_storage("rerun").await;
        let docs = vec![
            doc("doc1", TABLE_DOC),
            doc("doc2", "Competition among cell vendors"),
            doc("doc3", "Market and Competition outlook"),
        ];
        let outline = market_and_competition();
        let app = app_config();

        let first_backend = backend(false);
        let first = run(
            &storage,
            &docs,
            &outline,
            &pipeline_config(&app, &dir.join("first")),
            &first_backend,
            &empty_collector(),
        )
        .await
        .unwrap();

        let second_backend = backend(false);
        let second = run(
            &storage,
            &docs,
            &outline,
            &pipeline_config(&app, &dir.join("second")),
            &second_backend,
            &empty_collector(),
        )
        .await
        .unwrap();

        assert_eq!(
            read_allocation(&first.out_dir).unwrap(),
            read_allocation(&second.out_dir).unwrap()
        );
        assert!(second_backend.requests_with(SUMMARY_SYSTEM).is_empty());
    }

    #[tokio::test]
    async fn identical_bodies_and_cached_summaries_skip_calls() {
        let (storage, dir) = temp_storage("cache").await;
        let backend = backend(false);
        let config = pipeline_config(&app_config(), &dir.join("out"));
        let services = services(&backend, &empty_collector());

        let docs = vec![doc("a", "Shared body"), doc("b", "Shared body"), doc("c", "Other body")];
        summarize_only(&storage, &docs, &config, &services, CancellationToken::new(), &SilentProgress)
            .await
            .unwrap();
        assert_eq!(backend.calls(), 2);

        let report = summarize_only(
            &storage,
            &[doc("d", "Other body")],
            &config,
            &services,
            CancellationToken::new(),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(backend.calls(), 2);
        assert_eq!(report.cache_hits, 1);

        let d = storage.get_document("d").await.unwrap().unwrap();
        assert_eq!(d.summary.as_deref(), Some("Other body"));
    }

    #[tokio::test]
    async fn external_calls_stay_under_the_ceiling() {
        let (storage, dir) = temp_storage("ceiling").await;
        let backend = ScriptedBackend::with_delay(Duration::from_millis(10), |req| reply(req, true));
        let mut app = app_config();
        app.defaults.max_concurrency = 2;
        let config = pipeline_config(&app, &dir.join("out"));

        let docs: Vec<Document> = (0..8)
            .map(|i| doc(&format!("doc{i}"), &format!("Market note number {i}")))
            .collect();
        let outline = outline(vec![
            node("A", "Market", "", None),
            node("B", "Pricing", "", None),
            node("C", "Supply", "", None),
        ]);

        run(&storage, &docs, &outline, &config, &backend, &empty_collector())
            .await
            .unwrap();
        assert!(backend.peak_concurrency() <= 2);
        assert!(backend.calls() >= 8);
    }

    #[tokio::test]
    async fn cancelled_run_commits_progress_and_resumes() {
        let (storage, dir) = temp_storage("cancel").await;
        let mut app = app_config();
        app.defaults.max_concurrency = 1;
        let config = pipeline_config(&app, &dir.join("out"));
        let docs: Vec<Document> = (0..6)
            .map(|i| doc(&format!("doc{i}"), &format!("Market memo {i}")))
            .collect();
        let outline = market_and_competition();

        let slow = ScriptedBackend::with_delay(Duration::from_millis(25), |req| reply(req, false));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let err = run_pipeline(
            &storage,
            &docs,
            &outline,
            &config,
            &services(&slow, &empty_collector()),
            cancel,
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReportLoomError::Cancelled));
        assert_eq!(storage.latest_run().await.unwrap().unwrap().status, "cancelled");

        let done = storage.document_stats().await.unwrap().summarized;
        assert!(done < docs.len());

        let fresh = backend(false);
        run(&storage, &docs, &outline, &config, &fresh, &empty_collector())
            .await
            .unwrap();
        assert_eq!(fresh.requests_with(SUMMARY_SYSTEM).len(), docs.len() - done);
        assert_eq!(storage.document_stats().await.unwrap().summarized, docs.len());
    }

    #[tokio::test]
    async fn cancelled_rerun_keeps_committed_allocation() {
        let (storage, dir) = temp_storage("cancel-rerun").await;
        let docs = vec![doc("doc1", TABLE_DOC)];
        let outline = market_and_competition();
        let mut app = app_config();
        app.defaults.max_concurrency = 1;
        let config = pipeline_config(&app, &dir.join("out"));

        run(&storage, &docs, &outline, &config, &backend(false), &empty_collector())
            .await
            .unwrap();
        let committed = storage.load_allocations().await.unwrap();
        assert_eq!(
            committed.get("A").unwrap().document_ids.iter().collect::<Vec<_>>(),
            vec!["doc1"]
        );

        let slow = ScriptedBackend::with_delay(Duration::from_millis(200), |req| reply(req, false));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_pipeline(
            &storage,
            &docs,
            &outline,
            &config,
            &services(&slow, &empty_collector()),
            cancel,
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReportLoomError::Cancelled));

        assert_eq!(storage.load_allocations().await.unwrap(), committed);
    }

    #[tokio::test]
    async fn new_outline_replaces_stored_entries() {
        let (storage, dir) = temp_storage("outline-swap").await;
        let docs = vec![doc("doc1", TABLE_DOC)];
        let config = pipeline_config(&app_config(), &dir.join("out"));

        run(
            &storage,
            &docs,
            &market_and_competition(),
            &config,
            &backend(true),
            &empty_collector(),
        )
        .await
        .unwrap();
        run(
            &storage,
            &docs,
            &outline(vec![node("C", "Pricing", "", None)]),
            &config,
            &backend(true),
            &empty_collector(),
        )
        .await
        .unwrap();

        let stored = storage.load_allocations().await.unwrap();
        assert_eq!(stored.0.keys().collect::<Vec<_>>(), vec!["C"]);
        assert_eq!(stored.coverage().total_nodes, 1);
    }

    #[tokio::test]
    async fn output_dir_is_created() {
        let dir = temp_dir("outdir");
        let (storage, _) = temp_storage("outdir-db").await;
        let backend = backend(true);
        let out = dir.join("nested").join("run");
        let config = pipeline_config(&app_config(), &out);

        run(
            &storage,
            &[doc("doc1", TABLE_DOC)],
            &market_and_competition(),
            &config,
            &backend,
            &empty_collector(),
        )
        .await
        .unwrap();
        assert!(out.join(reportloom_artifacts::MANIFEST_FILE).exists());
    }
}
