//! SQL migration definitions for the reportloom document store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: documents, allocations, visualization_assets, summary_cache, runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Normalized source documents
CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    url          TEXT NOT NULL,
    markdown     TEXT NOT NULL,
    source_type  TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    summary      TEXT,
    summary_kind TEXT,
    truncated    INTEGER NOT NULL DEFAULT 0,
    origin_json  TEXT NOT NULL,
    inserted_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(content_hash);

-- One allocation entry per outline node
CREATE TABLE IF NOT EXISTS allocations (
    outline_id        TEXT PRIMARY KEY,
    document_ids_json TEXT NOT NULL,
    status            TEXT NOT NULL,
    warnings_json     TEXT NOT NULL DEFAULT '[]',
    updated_at        TEXT NOT NULL
);

-- Feasible chart bindings
CREATE TABLE IF NOT EXISTS visualization_assets (
    id          TEXT PRIMARY KEY,
    chart_kind  TEXT NOT NULL,
    asset_json  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Summaries keyed by content, reused across runs
CREATE TABLE IF NOT EXISTS summary_cache (
    content_hash TEXT NOT NULL,
    model_id     TEXT NOT NULL,
    summary      TEXT NOT NULL,
    summary_kind TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (content_hash, model_id)
);

-- Pipeline run history
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL,
    stats_json  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
