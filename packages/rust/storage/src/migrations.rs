//! SQL migration definitions for the enricher database.
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
            description: "Orchestration state: queue, checked_subjects, budget_counters, throttle_cells, runs, settings",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Records awaiting enrichment; one row per record
CREATE TABLE IF NOT EXISTS queue (
    record_id      TEXT PRIMARY KEY,
    enqueued_at_ms INTEGER NOT NULL,
    claimed_by     TEXT,
    claimed_at_ms  INTEGER
);

CREATE INDEX IF NOT EXISTS idx_queue_enqueued ON queue(enqueued_at_ms);

-- Recheck cache
CREATE TABLE IF NOT EXISTS checked_subjects (
    subject            TEXT PRIMARY KEY,
    last_checked_at_ms INTEGER NOT NULL,
    retry_count        INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_checked_subjects_last ON checked_subjects(last_checked_at_ms);

-- Named consumable budgets; capacity 0 means unlimited
CREATE TABLE IF NOT EXISTS budget_counters (
    name            TEXT PRIMARY KEY,
    capacity        INTEGER NOT NULL,
    remaining       INTEGER NOT NULL CHECK (remaining >= 0),
    period_ms       INTEGER NOT NULL,
    window_start_ms INTEGER NOT NULL,
    refreshed_at_ms INTEGER
);

-- Shared last-dispatch stamps, updated by compare-and-swap
CREATE TABLE IF NOT EXISTS throttle_cells (
    key        TEXT PRIMARY KEY,
    last_at_ms INTEGER NOT NULL
);

-- Invocation history
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

-- Operator-accepted settings (e.g. the validated mapping)
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Record store: fields, records, record_values, terms",
            sql: r#"
CREATE TABLE IF NOT EXISTS fields (
    id           TEXT PRIMARY KEY,
    schema_id    TEXT NOT NULL,
    name         TEXT NOT NULL COLLATE NOCASE UNIQUE,
    kind         TEXT NOT NULL,
    multi_valued INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS records (
    id         TEXT PRIMARY KEY,
    schema_id  TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_schema ON records(schema_id);

CREATE TABLE IF NOT EXISTS record_values (
    record_id  TEXT NOT NULL,
    field_id   TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (record_id, field_id)
);

-- Canonical values of enumerable fields
CREATE TABLE IF NOT EXISTS terms (
    id       TEXT PRIMARY KEY,
    field_id TEXT NOT NULL,
    label    TEXT NOT NULL COLLATE NOCASE,
    UNIQUE (field_id, label)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
