//! SQLite schema and migrations for the investigation store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Whether the schema has been applied to this database.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='investigations'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for concurrent readers alongside the writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS investigations (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 3,
            severity TEXT,
            confidence REAL,
            step_count INTEGER NOT NULL DEFAULT 0,
            max_steps INTEGER NOT NULL DEFAULT 20,
            planner_model TEXT NOT NULL,
            model_mode TEXT NOT NULL,
            llm_status TEXT,
            llm_error TEXT,
            llm_model TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            duration_ms INTEGER,
            error_summary TEXT,
            runtime_feature_flags TEXT NOT NULL,
            runtime_safeguards TEXT NOT NULL,
            stage_durations TEXT,
            partial INTEGER NOT NULL DEFAULT 0,
            trigger_ref TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // At most one active investigation per transaction
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_investigations_active
         ON investigations(transaction_id)
         WHERE status IN ('pending', 'in_progress')",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_investigations_transaction
         ON investigations(transaction_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS investigation_state (
            investigation_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (investigation_id) REFERENCES investigations(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tool_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            investigation_id TEXT NOT NULL,
            step_number INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            status TEXT NOT NULL,
            input_summary TEXT NOT NULL DEFAULT '',
            output_summary TEXT NOT NULL DEFAULT '',
            execution_time_ms INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (investigation_id, step_number),
            FOREIGN KEY (investigation_id) REFERENCES investigations(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS insights (
            id TEXT PRIMARY KEY,
            investigation_id TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            evaluation_type TEXT NOT NULL,
            insight_type TEXT NOT NULL,
            model_mode TEXT NOT NULL,
            severity TEXT NOT NULL,
            summary TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            transaction_timestamp TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_insights_investigation
         ON insights(investigation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evidence (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            insight_id TEXT NOT NULL,
            evidence_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            category TEXT NOT NULL,
            strength REAL NOT NULL,
            freshness_weight REAL NOT NULL DEFAULT 1.0,
            description TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            related_transaction_ids TEXT,
            payload TEXT,
            FOREIGN KEY (insight_id) REFERENCES insights(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evidence_insight ON evidence(insight_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS recommendations (
            id TEXT PRIMARY KEY,
            insight_id TEXT NOT NULL,
            rec_type TEXT NOT NULL,
            priority INTEGER NOT NULL,
            title TEXT NOT NULL,
            impact TEXT NOT NULL,
            payload TEXT,
            signature_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            acknowledged_by TEXT,
            acknowledged_at TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            UNIQUE (insight_id, signature_hash),
            FOREIGN KEY (insight_id) REFERENCES insights(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_recommendations_worklist
         ON recommendations(created_at DESC, id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rule_drafts (
            id TEXT PRIMARY KEY,
            recommendation_id TEXT NOT NULL UNIQUE,
            rule_name TEXT NOT NULL,
            rule_description TEXT NOT NULL,
            conditions TEXT NOT NULL,
            thresholds TEXT,
            metadata TEXT,
            status TEXT NOT NULL DEFAULT 'not_exported',
            export_ref TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (recommendation_id) REFERENCES recommendations(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            performed_by TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            ts TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transaction_embeddings (
            transaction_id TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            vector BLOB NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}
