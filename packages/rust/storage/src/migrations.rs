//! SQL migration definitions for the curator execution database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

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
        description: "Initial schema: pipeline_executions, stage_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per end-to-end pipeline attempt
CREATE TABLE IF NOT EXISTS pipeline_executions (
    id                    TEXT PRIMARY KEY,
    pipeline_name         TEXT NOT NULL,
    run_date              TEXT NOT NULL,
    config_snapshot       TEXT NOT NULL,
    config_fingerprint    TEXT NOT NULL,
    status                TEXT NOT NULL DEFAULT 'pending',
    started_at            TEXT NOT NULL,
    completed_at          TEXT,
    last_successful_stage INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_executions_status ON pipeline_executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_name_date
    ON pipeline_executions(pipeline_name, run_date);

-- One row per numbered stage of an execution. Rows are reset, never deleted.
CREATE TABLE IF NOT EXISTS stage_runs (
    id           TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES pipeline_executions(id) ON DELETE CASCADE,
    stage_number INTEGER NOT NULL,
    name         TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    started_at   TEXT,
    completed_at TEXT,
    heartbeat_at TEXT,
    error_message TEXT,
    metrics_json TEXT,
    UNIQUE(execution_id, stage_number)
);

CREATE INDEX IF NOT EXISTS idx_stage_runs_execution ON stage_runs(execution_id);
CREATE INDEX IF NOT EXISTS idx_stage_runs_status ON stage_runs(status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
