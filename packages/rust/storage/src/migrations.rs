//! SQL migration definitions for the forecaster database.
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
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, documents, capabilities, threats, mappings, cycle runs, FTS5",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Publication sources
CREATE TABLE IF NOT EXISTS sources (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    kind            TEXT NOT NULL,
    endpoint        TEXT NOT NULL,
    category        TEXT NOT NULL DEFAULT '',
    active          INTEGER NOT NULL DEFAULT 1,
    last_fetched_at TEXT,
    created_at      TEXT NOT NULL
);

-- Fetched documents; immutable once stored
CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    source_id    TEXT NOT NULL REFERENCES sources(id),
    external_id  TEXT NOT NULL,
    title        TEXT NOT NULL,
    url          TEXT,
    authors      TEXT,
    body         TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    published_at TEXT,
    retrieved_at TEXT NOT NULL,
    UNIQUE(source_id, external_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id);

-- Extraction attempts per document
CREATE TABLE IF NOT EXISTS extractions (
    document_id      TEXT PRIMARY KEY REFERENCES documents(id),
    cycle_run_id     TEXT NOT NULL,
    status           TEXT NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    capability_count INTEGER NOT NULL DEFAULT 0,
    error            TEXT,
    attempted_at     TEXT NOT NULL
);

-- Extracted capability statements
CREATE TABLE IF NOT EXISTS capabilities (
    id                   TEXT PRIMARY KEY,
    document_id          TEXT NOT NULL REFERENCES documents(id),
    statement            TEXT NOT NULL,
    normalized_statement TEXT NOT NULL,
    confidence           REAL NOT NULL,
    model_id             TEXT NOT NULL,
    extracted_at         TEXT NOT NULL,
    UNIQUE(document_id, normalized_statement)
);

-- Curated threat taxonomy
CREATE TABLE IF NOT EXISTS threat_categories (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    grp               TEXT NOT NULL,
    description       TEXT NOT NULL,
    criteria_json     TEXT NOT NULL DEFAULT '[]',
    timeline_estimate TEXT,
    content_hash      TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

-- Scored mappings; one active row per pair
CREATE TABLE IF NOT EXISTS mappings (
    id                 TEXT PRIMARY KEY,
    capability_id      TEXT NOT NULL REFERENCES capabilities(id),
    threat_category_id TEXT NOT NULL REFERENCES threat_categories(id),
    feasibility_score  REAL NOT NULL,
    rationale          TEXT NOT NULL,
    category_hash      TEXT NOT NULL,
    model_id           TEXT NOT NULL,
    scored_at          TEXT NOT NULL,
    active             INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_active_pair
    ON mappings(capability_id, threat_category_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_mappings_category ON mappings(threat_category_id, active);
CREATE INDEX IF NOT EXISTS idx_mappings_scored_at ON mappings(scored_at);

-- Latest evaluation per pair, for skip/retry decisions
CREATE TABLE IF NOT EXISTS evaluations (
    capability_id      TEXT NOT NULL REFERENCES capabilities(id),
    threat_category_id TEXT NOT NULL REFERENCES threat_categories(id),
    category_hash      TEXT NOT NULL,
    outcome            TEXT NOT NULL,
    score              REAL,
    attempts           INTEGER NOT NULL DEFAULT 0,
    error              TEXT,
    evaluated_at       TEXT NOT NULL,
    PRIMARY KEY (capability_id, threat_category_id)
);

-- Cycle run history
CREATE TABLE IF NOT EXISTS cycle_runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    since        TEXT,
    stage        TEXT NOT NULL,
    status       TEXT NOT NULL,
    outcome_json TEXT NOT NULL DEFAULT '{}',
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_cycle_runs_status ON cycle_runs(status);

-- Full-text search on documents
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    title,
    body,
    content=documents,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS documents_fts_insert AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, title, body)
    VALUES (new.rowid, new.title, new.body);
END;

CREATE TRIGGER IF NOT EXISTS documents_fts_delete AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, title, body)
    VALUES ('delete', old.rowid, old.title, old.body);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Cycle run heartbeat column",
            sql: r#"
ALTER TABLE cycle_runs ADD COLUMN updated_at TEXT;
UPDATE cycle_runs SET updated_at = COALESCE(completed_at, started_at) WHERE updated_at IS NULL;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
