//! libSQL document store (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding documents and their
//! summaries, allocation entries, visualization assets, the summary cache and
//! run history. Everything a run produces is persisted, so an interrupted run
//! resumes from the same database.
//!
//! **Access rules:**
//! - pipeline orchestrator: read-write (sole writer) via [`Storage::open`]
//! - `reportloom status`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};

use reportloom_shared::{
    AllocationEntry, AllocationMap, AllocationStatus, Document, DocumentOrigin, ReportLoomError,
    Result, RunId, SourceType, SummaryKind, VisualizationAsset,
};

/// Hex SHA-256 of a document body. Used for dedupe and the summary cache.
pub fn content_hash(markdown: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(markdown.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn storage_err(e: impl std::fmt::Display) -> ReportLoomError {
    ReportLoomError::Storage(e.to_string())
}

async fn upsert_entry(conn: &Connection, entry: &AllocationEntry) -> Result<()> {
    let ids_json = serde_json::to_string(&entry.document_ids).map_err(storage_err)?;
    let warnings_json = serde_json::to_string(&entry.warnings).map_err(storage_err)?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO allocations (outline_id, document_ids_json, status, warnings_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(outline_id) DO UPDATE SET
           document_ids_json = excluded.document_ids_json,
           status = excluded.status,
           warnings_json = excluded.warnings_json,
           updated_at = excluded.updated_at",
        params![
            entry.outline_id.as_str(),
            ids_json.as_str(),
            entry.status.as_str(),
            warnings_json.as_str(),
            now.as_str(),
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ReportLoomError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ReportLoomError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ReportLoomError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ReportLoomError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Insert a document unless its id is already stored.
    ///
    /// Returns `true` when the document was new. Existing rows are never
    /// overwritten, so summaries from an earlier run survive re-ingestion.
    pub async fn insert_document(&self, doc: &Document) -> Result<bool> {
        self.check_writable()?;
        let origin_json = serde_json::to_string(&doc.origin).map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        let hash = content_hash(&doc.markdown);

        let inserted = self
            .conn
            .execute(
                "INSERT INTO documents (id, title, url, markdown, source_type, content_hash,
                                        summary, summary_kind, truncated, origin_json, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    doc.id.as_str(),
                    doc.title.as_str(),
                    doc.url.as_str(),
                    doc.markdown.as_str(),
                    doc.source_type.as_str(),
                    hash.as_str(),
                    doc.summary.as_deref(),
                    doc.summary_kind.map(|k| k.as_str()),
                    i64::from(doc.truncated),
                    origin_json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(inserted > 0)
    }

    /// Insert many documents. Returns the ids that were new, in input order.
    pub async fn insert_documents(&self, docs: &[Document]) -> Result<Vec<String>> {
        let mut inserted = Vec::new();
        for doc in docs {
            if self.insert_document(doc).await? {
                inserted.push(doc.id.clone());
            }
        }
        tracing::debug!(offered = docs.len(), inserted = inserted.len(), "documents ingested");
        Ok(inserted)
    }

    /// Get a document by id.
    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_document(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// All documents in ascending id order.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.query_documents(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id"
        ))
        .await
    }

    /// Documents the summarizer has not visited yet, in ascending id order.
    pub async fn list_unsummarized(&self) -> Result<Vec<Document>> {
        self.query_documents(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE summary IS NULL ORDER BY id"
        ))
        .await
    }

    async fn query_documents(&self, sql: &str) -> Result<Vec<Document>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_document(&row)?);
        }
        Ok(results)
    }

    /// Record the outcome of summarizing one document.
    pub async fn set_summary(
        &self,
        id: &str,
        summary: &str,
        kind: Option<SummaryKind>,
        truncated: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE documents SET summary = ?2, summary_kind = ?3, truncated = ?4 WHERE id = ?1",
                params![id, summary, kind.map(|k| k.as_str()), i64::from(truncated)],
            )
            .await
            .map_err(storage_err)?;

        if updated == 0 {
            return Err(ReportLoomError::Storage(format!("unknown document '{id}'")));
        }
        Ok(())
    }

    /// Document counts for status reporting.
    pub async fn document_stats(&self) -> Result<DocumentStats> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(summary IS NOT NULL AND summary <> ''), 0),
                        COALESCE(SUM(summary = ''), 0),
                        COALESCE(SUM(truncated), 0),
                        COALESCE(SUM(origin_json LIKE '%\"supplement\"%'), 0)
                 FROM documents",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let row = rows
            .next()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ReportLoomError::Storage("empty aggregate result".into()))?;

        let get = |i: i32| row.get::<i64>(i).map(|v| v as usize).map_err(storage_err);
        Ok(DocumentStats {
            total: get(0)?,
            summarized: get(1)?,
            failed: get(2)?,
            truncated: get(3)?,
            supplementary: get(4)?,
        })
    }

    // -----------------------------------------------------------------------
    // Allocation operations
    // -----------------------------------------------------------------------

    /// Insert or replace the entry for one outline node.
    pub async fn upsert_allocation(&self, entry: &AllocationEntry) -> Result<()> {
        self.check_writable()?;
        upsert_entry(&self.conn, entry).await
    }

    /// Upsert every entry of `map`, leaving other stored entries untouched.
    pub async fn save_allocations(&self, map: &AllocationMap) -> Result<()> {
        for entry in map.entries() {
            self.upsert_allocation(entry).await?;
        }
        Ok(())
    }

    /// Make `map` the whole stored allocation table, atomically.
    ///
    /// Entries of outline nodes absent from `map` are removed.
    pub async fn replace_allocations(&self, map: &AllocationMap) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM allocations", params![])
            .await
            .map_err(storage_err)?;
        for entry in map.entries() {
            upsert_entry(&tx, entry).await?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Load all stored allocation entries.
    pub async fn load_allocations(&self) -> Result<AllocationMap> {
        let mut rows = self
            .conn
            .query(
                "SELECT outline_id, document_ids_json, status, warnings_json
                 FROM allocations ORDER BY outline_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut map = AllocationMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let outline_id: String = row.get(0).map_err(storage_err)?;
            let ids_json: String = row.get(1).map_err(storage_err)?;
            let status: String = row.get(2).map_err(storage_err)?;
            let warnings_json: String = row.get(3).map_err(storage_err)?;

            let document_ids: BTreeSet<String> =
                serde_json::from_str(&ids_json).map_err(storage_err)?;
            let warnings: Vec<String> = serde_json::from_str(&warnings_json).map_err(storage_err)?;

            map.insert(AllocationEntry {
                outline_id,
                document_ids,
                status: status.parse::<AllocationStatus>()?,
                warnings,
            });
        }
        Ok(map)
    }

    // -----------------------------------------------------------------------
    // Visualization asset operations
    // -----------------------------------------------------------------------

    /// Replace the stored asset set with `assets`.
    pub async fn replace_visualization_assets(&self, assets: &[VisualizationAsset]) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM visualization_assets", params![])
            .await
            .map_err(storage_err)?;

        let now = Utc::now().to_rfc3339();
        for asset in assets {
            let json = serde_json::to_string(asset).map_err(storage_err)?;
            self.conn
                .execute(
                    "INSERT INTO visualization_assets (id, chart_kind, asset_json, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET asset_json = excluded.asset_json",
                    params![asset.id.as_str(), asset.chart_kind.as_str(), json.as_str(), now.as_str()],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    pub async fn list_visualization_assets(&self) -> Result<Vec<VisualizationAsset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT asset_json FROM visualization_assets ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut assets = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json: String = row.get(0).map_err(storage_err)?;
            assets.push(serde_json::from_str(&json).map_err(storage_err)?);
        }
        Ok(assets)
    }

    // -----------------------------------------------------------------------
    // Summary cache operations
    // -----------------------------------------------------------------------

    /// Get a cached summary for a content hash and model.
    pub async fn get_cached_summary(
        &self,
        content_hash: &str,
        model_id: &str,
    ) -> Result<Option<CachedSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT summary, summary_kind FROM summary_cache
                 WHERE content_hash = ?1 AND model_id = ?2",
                params![content_hash, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let summary: String = row.get(0).map_err(storage_err)?;
                let kind: String = row.get(1).map_err(storage_err)?;
                Ok(Some(CachedSummary {
                    summary,
                    kind: kind.parse()?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a summary in the cache (upserts).
    pub async fn set_cached_summary(
        &self,
        content_hash: &str,
        model_id: &str,
        summary: &str,
        kind: SummaryKind,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO summary_cache (content_hash, model_id, summary, summary_kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(content_hash, model_id) DO UPDATE SET
                   summary = excluded.summary,
                   summary_kind = excluded.summary_kind,
                   created_at = excluded.created_at",
                params![content_hash, model_id, summary, kind.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run.
    pub async fn insert_run(&self, run_id: &RunId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let id = run_id.to_string();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, status) VALUES (?1, ?2, 'running')",
                params![id.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark a run finished with a final status and statistics.
    pub async fn finish_run(&self, run_id: &RunId, status: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let id = run_id.to_string();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?2, status = ?3, stats_json = ?4 WHERE id = ?1",
                params![id.as_str(), now.as_str(), status, stats_json],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recently started run, if any.
    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, stats_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let started: String = row.get(1).map_err(storage_err)?;
                Ok(Some(RunRecord {
                    id: row.get(0).map_err(storage_err)?,
                    started_at: parse_time(&started)?,
                    finished_at: match row.get::<String>(2).ok() {
                        Some(s) => Some(parse_time(&s)?),
                        None => None,
                    },
                    status: row.get(3).map_err(storage_err)?,
                    stats_json: row.get::<String>(4).ok(),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

/// Document counts in a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentStats {
    pub total: usize,
    /// Non-empty summary.
    pub summarized: usize,
    /// Summarization gave up; empty summary.
    pub failed: usize,
    pub truncated: usize,
    pub supplementary: usize,
}

impl DocumentStats {
    pub fn pending(&self) -> usize {
        self.total - self.summarized - self.failed
    }
}

/// A summary cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSummary {
    pub summary: String,
    pub kind: SummaryKind,
}

/// One row of run history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub stats_json: Option<String>,
}

const DOCUMENT_COLUMNS: &str =
    "id, title, url, markdown, source_type, summary, summary_kind, truncated, origin_json";

/// Convert a database row to a [`Document`].
fn row_to_document(row: &libsql::Row) -> Result<Document> {
    let source_type: String = row.get(4).map_err(storage_err)?;
    let summary_kind = match row.get::<String>(6).ok() {
        Some(kind) => Some(kind.parse::<SummaryKind>()?),
        None => None,
    };
    let origin_json: String = row.get(8).map_err(storage_err)?;
    let origin: DocumentOrigin = serde_json::from_str(&origin_json).map_err(storage_err)?;

    Ok(Document {
        id: row.get(0).map_err(storage_err)?,
        title: row.get(1).map_err(storage_err)?,
        url: row.get(2).map_err(storage_err)?,
        markdown: row.get(3).map_err(storage_err)?,
        source_type: source_type.parse::<SourceType>()?,
        summary: row.get::<String>(5).ok(),
        summary_kind,
        truncated: row.get::<i64>(7).map_err(storage_err)? != 0,
        origin,
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReportLoomError::Storage(format!("invalid date: {e}")))
}
