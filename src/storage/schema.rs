//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS batches (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            provider TEXT,
            version TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS evaluators (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS llm_answers (
            id INTEGER PRIMARY KEY,
            batch_id INTEGER NOT NULL REFERENCES batches(id),
            model_id INTEGER NOT NULL REFERENCES models(id),
            question_id INTEGER NOT NULL,
            question_type TEXT NOT NULL,
            repeat_index INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS evaluations (
            id INTEGER PRIMARY KEY,
            llm_answer_id INTEGER NOT NULL REFERENCES llm_answers(id),
            evaluator_id INTEGER REFERENCES evaluators(id),
            score_type TEXT,
            raw_score REAL,
            normalized_score REAL,
            evaluation_status TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS evaluation_runs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            run_time TEXT NOT NULL,
            last_activity_time TEXT,
            timeout_seconds INTEGER,
            is_auto_resume INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            pause_time TEXT,
            pause_reason TEXT,
            resume_count INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS model_batch_scores (
            id INTEGER PRIMARY KEY,
            batch_id INTEGER NOT NULL REFERENCES batches(id),
            model_id INTEGER NOT NULL REFERENCES models(id),
            evaluator_id INTEGER REFERENCES evaluators(id),
            score_type TEXT NOT NULL,
            repeat_index INTEGER NOT NULL,
            average_score REAL NOT NULL,
            total_answers INTEGER NOT NULL,
            scored_answers INTEGER NOT NULL,
            max_score REAL,
            min_score REAL,
            calculated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_llm_answers_batch_model ON llm_answers(batch_id, model_id);
        CREATE INDEX IF NOT EXISTS idx_evaluations_answer ON evaluations(llm_answer_id);
        CREATE INDEX IF NOT EXISTS idx_evaluation_runs_status ON evaluation_runs(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_model_batch_scores_key ON model_batch_scores(
            batch_id, model_id, COALESCE(evaluator_id, -1), score_type, repeat_index
        );",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["evaluation_runs", "llm_answers", "evaluations", "model_batch_scores"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_fresh_runs_table_has_resume_count() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO evaluation_runs (name, status, run_time) VALUES ('r', 'PENDING', 'now')",
            [],
        )
        .unwrap();

        let resumes: i64 = conn
            .query_row("SELECT resume_count FROM evaluation_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(resumes, 0);
    }

    #[test]
    fn test_score_key_is_unique_with_null_evaluator() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO batches (id, name) VALUES (1, 'b');
             INSERT INTO models (id, name) VALUES (1, 'm');",
        )
        .unwrap();

        let insert = "INSERT INTO model_batch_scores
            (batch_id, model_id, evaluator_id, score_type, repeat_index, average_score,
             total_answers, scored_answers, calculated_at)
            VALUES (1, 1, NULL, 'OVERALL', -1, 0.5, 1, 1, 'now')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
