//! JSON artifacts exchanged with the report writer.
//!
//! Reads the run inputs (`documents.json`, `outline.json`) and writes the run
//! outputs: the outline allocation, the visualization assets, the flattened
//! document data and a `run_manifest.json` carrying checksums and statistics.
//! Every artifact is written atomically (temp file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use reportloom_shared::{
    AllocationMap, AllocationStatus, CURRENT_SCHEMA_VERSION, CoverageStats, Document, Outline,
    OutlineNode, ReportLoomError, Result, RunId, VisualizationAsset,
};

pub const ALLOCATION_FILE: &str = "outline_data_allocation.json";
pub const VISUALIZATION_FILE: &str = "visualization_assets.json";
pub const DOCUMENTS_FILE: &str = "flattened_document_data.json";
pub const MANIFEST_FILE: &str = "run_manifest.json";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Load the initial document collection from a JSON array.
pub fn read_documents(path: &Path) -> Result<Vec<Document>> {
    let docs: Vec<Document> = read_json(path)?;

    let mut seen = std::collections::HashSet::new();
    for doc in &docs {
        if !seen.insert(doc.id.as_str()) {
            return Err(ReportLoomError::validation(format!(
                "{}: duplicate document id '{}'",
                path.display(),
                doc.id
            )));
        }
    }

    debug!(path = %path.display(), count = docs.len(), "documents loaded");
    Ok(docs)
}

/// Load and validate the outline from a JSON array of nodes.
pub fn read_outline(path: &Path) -> Result<Outline> {
    let nodes: Vec<OutlineNode> = read_json(path)?;
    Outline::new(nodes)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| ReportLoomError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| ReportLoomError::validation(format!("invalid {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Output shapes
// ---------------------------------------------------------------------------

/// One value of `outline_data_allocation.json`, keyed by outline id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub document_ids: Vec<String>,
    pub status: AllocationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Shape the allocation map the way the report writer consumes it.
pub fn allocation_records(map: &AllocationMap) -> BTreeMap<String, AllocationRecord> {
    map.entries()
        .map(|entry| {
            (
                entry.outline_id.clone(),
                AllocationRecord {
                    document_ids: entry.document_ids.iter().cloned().collect(),
                    status: entry.status,
                    warnings: entry.warnings.clone(),
                },
            )
        })
        .collect()
}

/// A chart candidate that failed the feasibility check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedVisualization {
    pub chart_kind: String,
    pub source_document_ids: Vec<String>,
    #[serde(default)]
    pub title: String,
    /// Why the raw content could not support the chart.
    pub reason: String,
}

/// Checksum record for one written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub filename: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Counters describing a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub documents: usize,
    pub supplementary_documents: usize,
    pub summarized: usize,
    pub failed_summaries: usize,
    pub truncated_documents: usize,
    pub coverage: CoverageStats,
    pub coverage_rate: f64,
    /// Allocatable documents no outline node picked.
    pub unallocated_documents: usize,
    pub gap_fill_rounds: u32,
    pub visualization_candidates: usize,
    pub visualization_assets: usize,
}

/// The `run_manifest.json` written next to the artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub run_id: RunId,
    /// Tool version that produced the run.
    pub tool_version: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    #[serde(default)]
    pub artifacts: Vec<ArtifactMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_visualizations: Vec<RejectedVisualization>,
    /// Effective configuration of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl RunManifest {
    pub fn new(run_id: RunId, model: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            model: model.into(),
            started_at,
            finished_at: started_at,
            stats: RunStats::default(),
            artifacts: Vec::new(),
            rejected_visualizations: Vec::new(),
            config: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Everything a completed run hands to the report writer.
#[derive(Debug, Clone, Copy)]
pub struct RunOutputs<'a> {
    pub allocation: &'a AllocationMap,
    pub assets: &'a [VisualizationAsset],
    pub documents: &'a [Document],
}

/// Write all run artifacts into `out_dir`, then the manifest listing their checksums.
///
/// Only feasible assets are written. Returns the manifest as written.
#[instrument(skip_all, fields(out_dir = %out_dir.display()))]
pub fn write_run_artifacts(
    out_dir: &Path,
    outputs: &RunOutputs<'_>,
    mut manifest: RunManifest,
) -> Result<RunManifest> {
    std::fs::create_dir_all(out_dir).map_err(|e| ReportLoomError::io(out_dir, e))?;

    let feasible: Vec<&VisualizationAsset> = outputs.assets.iter().filter(|a| a.feasible).collect();

    manifest.artifacts = vec![
        write_artifact(out_dir, ALLOCATION_FILE, &allocation_records(outputs.allocation))?,
        write_artifact(out_dir, VISUALIZATION_FILE, &feasible)?,
        write_artifact(out_dir, DOCUMENTS_FILE, &outputs.documents)?,
    ];
    manifest.finished_at = Utc::now();

    write_artifact(out_dir, MANIFEST_FILE, &manifest)?;

    info!(
        artifacts = manifest.artifacts.len(),
        assets = feasible.len(),
        "run artifacts written"
    );
    Ok(manifest)
}

/// Serialize `data` as pretty JSON into `dir/filename` atomically.
pub fn write_artifact<T: Serialize + ?Sized>(
    dir: &Path,
    filename: &str,
    data: &T,
) -> Result<ArtifactMeta> {
    let json = serde_json::to_string_pretty(data).map_err(|e| {
        ReportLoomError::validation(format!("JSON serialization failed: {e}"))
    })?;

    let target = dir.join(filename);
    let temp = dir.join(format!(".{filename}.tmp"));

    // Write to temp file first
    std::fs::write(&temp, &json).map_err(|e| ReportLoomError::io(&temp, e))?;

    // Atomic rename
    std::fs::rename(&temp, &target).map_err(|e| ReportLoomError::io(&target, e))?;

    debug!(file = %filename, size = json.len(), "wrote artifact");

    Ok(ArtifactMeta {
        filename: filename.to_string(),
        sha256: sha256_hex(json.as_bytes()),
        size_bytes: json.len(),
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Verify that a run output directory is complete and untampered.
///
/// Checks the manifest schema version and every listed checksum.
pub fn validate_run_dir(out_dir: &Path) -> Result<RunManifest> {
    let manifest_path = out_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(ReportLoomError::validation(format!("missing {MANIFEST_FILE}")));
    }

    let manifest: RunManifest = read_json(&manifest_path)?;
    if manifest.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(ReportLoomError::validation(format!(
            "unsupported schema_version: {} (expected {})",
            manifest.schema_version, CURRENT_SCHEMA_VERSION
        )));
    }

    for meta in &manifest.artifacts {
        let path: PathBuf = out_dir.join(&meta.filename);
        let bytes = std::fs::read(&path).map_err(|e| ReportLoomError::io(&path, e))?;
        if sha256_hex(&bytes) != meta.sha256 {
            return Err(ReportLoomError::validation(format!(
                "checksum mismatch for {}",
                meta.filename
            )));
        }
    }

    Ok(manifest)
}

/// Read back `outline_data_allocation.json`.
pub fn read_allocation(out_dir: &Path) -> Result<BTreeMap<String, AllocationRecord>> {
    read_json(&out_dir.join(ALLOCATION_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportloom_shared::{AllocationEntry, ChartPriority, SourceType};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rl-artifacts-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_allocation() -> AllocationMap {
        let mut map = AllocationMap::new();
        let mut a = AllocationEntry::empty("A");
        a.absorb(["doc1".to_string()]);
        a.status = AllocationStatus::Sufficient;
        map.insert(a);
        let mut b = AllocationEntry::empty("B");
        b.warn("SupplementExhausted");
        map.insert(b);
        map
    }

    fn make_asset(id: &str, feasible: bool) -> VisualizationAsset {
        VisualizationAsset {
            id: id.into(),
            source_document_ids: vec!["doc1".into()],
            chart_kind: "bar".into(),
            feasible,
            title: "Capacity by year".into(),
            reason: "annual series".into(),
            priority: ChartPriority::High,
            outline_ids: vec!["A".into()],
        }
    }

    fn make_docs() -> Vec<Document> {
        let mut doc = Document::new("doc1", "Capacity", "https://example.com", "| a |", SourceType::Pdf);
        doc.summary = Some("capacity grew".into());
        vec![doc]
    }

    #[test]
    fn allocation_records_shape() {
        let records = allocation_records(&make_allocation());
        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(json["A"]["document_ids"], serde_json::json!(["doc1"]));
        assert_eq!(json["A"]["status"], "sufficient");
        assert_eq!(json["B"]["status"], "empty");
        assert_eq!(json["B"]["warnings"][0], "SupplementExhausted");
        assert!(json["A"].get("warnings").is_none());
    }

    #[test]
    fn write_run_artifacts_writes_all_files() {
        let tmp = temp_dir();
        let allocation = make_allocation();
        let assets = vec![make_asset("viz_a", true), make_asset("viz_b", false)];
        let docs = make_docs();

        let manifest = RunManifest::new(RunId::new(), "test-model", Utc::now());
        let outputs = RunOutputs {
            allocation: &allocation,
            assets: &assets,
            documents: &docs,
        };
        let written = write_run_artifacts(&tmp, &outputs, manifest).unwrap();

        assert_eq!(written.artifacts.len(), 3);
        assert!(written.artifacts.iter().all(|m| m.sha256.len() == 64));
        for name in [ALLOCATION_FILE, VISUALIZATION_FILE, DOCUMENTS_FILE, MANIFEST_FILE] {
            assert!(tmp.join(name).exists(), "{name} missing");
        }

        // Infeasible assets are not emitted
        let emitted: Vec<VisualizationAsset> =
            read_json(&tmp.join(VISUALIZATION_FILE)).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].id, "viz_a");

        let records = read_allocation(&tmp).unwrap();
        assert_eq!(records["A"].document_ids, vec!["doc1".to_string()]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn validate_run_dir_checks_checksums() {
        let tmp = temp_dir();
        let allocation = make_allocation();
        let docs = make_docs();
        let outputs = RunOutputs {
            allocation: &allocation,
            assets: &[],
            documents: &docs,
        };
        write_run_artifacts(&tmp, &outputs, RunManifest::new(RunId::new(), "m", Utc::now()))
            .unwrap();

        let manifest = validate_run_dir(&tmp).unwrap();
        assert_eq!(manifest.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(manifest.model, "m");

        std::fs::write(tmp.join(DOCUMENTS_FILE), "[]").unwrap();
        let err = validate_run_dir(&tmp).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn validate_run_dir_missing_manifest() {
        let tmp = temp_dir();
        assert!(validate_run_dir(&tmp).is_err());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn artifacts_atomic_no_temp_files() {
        let tmp = temp_dir();
        write_artifact(&tmp, "x.json", &serde_json::json!({"a": 1})).unwrap();
        for entry in std::fs::read_dir(&tmp).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.starts_with('.'), "temp file left behind: {name}");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn read_inputs_from_fixtures() {
        let docs = read_documents(Path::new("../../../fixtures/json/documents.fixture.json"))
            .expect("read documents");
        assert_eq!(docs.len(), 3);

        let outline = read_outline(Path::new("../../../fixtures/json/outline.fixture.json"))
            .expect("read outline");
        assert_eq!(outline.len(), 4);
    }

    #[test]
    fn read_documents_rejects_duplicate_ids() {
        let tmp = temp_dir();
        let path = tmp.join("documents.json");
        let mut docs = make_docs();
        docs.push(docs[0].clone());
        std::fs::write(&path, serde_json::to_string(&docs).unwrap()).unwrap();

        let err = read_documents(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate document id"));
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
