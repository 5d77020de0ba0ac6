//! Run persistence: the contract the monitor depends on and its SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::{EvaluationRun, RunStatus, StoreError};
use crate::storage::{opt_time_column, placeholders, time_column, to_db_time, Pool};

/// Persistence operations the lifecycle monitor needs.
///
/// `update_status` must be a single conditional write: it only succeeds
/// when the run is still in one of `expected`, so a run that finished
/// between the monitor's read and its write is left untouched.
pub trait RunStore: Send + Sync {
    /// Runs in `statuses` whose last activity (or creation) is more than
    /// `min(timeout_seconds, coarse_secs)` before `now`. A run without its
    /// own timeout uses `coarse_secs`.
    fn find_stale(
        &self,
        statuses: &[RunStatus],
        now: DateTime<Utc>,
        coarse_secs: i64,
    ) -> Result<Vec<EvaluationRun>, StoreError>;

    /// Auto-resumable PAUSED runs paused before `cutoff`.
    fn find_paused_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRun>, StoreError>;

    /// Move a run to `new_status` if it is currently in `expected`.
    /// Terminal statuses in `expected` are ignored. Returns whether a row changed.
    fn update_status(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        new_status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, StoreError>;

    fn get(&self, run_id: i64) -> Result<Option<EvaluationRun>, StoreError>;
}

const RUN_COLUMNS: &str = "id, name, status, run_time, last_activity_time, timeout_seconds,
     is_auto_resume, error_message, pause_time, pause_reason, resume_count, completed_at,
     deleted_at";

fn read_run(row: &Row<'_>) -> rusqlite::Result<EvaluationRun> {
    Ok(EvaluationRun {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        run_time: time_column(row, 3)?,
        last_activity_time: opt_time_column(row, 4)?,
        timeout_seconds: row.get(5)?,
        is_auto_resume: row.get::<_, i64>(6)? != 0,
        error_message: row.get(7)?,
        pause_time: opt_time_column(row, 8)?,
        pause_reason: row.get(9)?,
        resume_count: row.get(10)?,
        completed_at: opt_time_column(row, 11)?,
        deleted_at: opt_time_column(row, 12)?,
    })
}

/// Fields the run-starting workflow supplies.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub status: RunStatus,
    pub run_time: DateTime<Utc>,
    pub timeout_seconds: Option<i64>,
    pub is_auto_resume: bool,
}

impl NewRun {
    pub fn pending(name: &str, run_time: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            status: RunStatus::Pending,
            run_time,
            timeout_seconds: None,
            is_auto_resume: false,
        }
    }
}

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: Pool,
}

impl SqliteRunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    pub fn insert(&self, run: &NewRun) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO evaluation_runs (name, status, run_time, timeout_seconds, is_auto_resume)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.name,
                run.status,
                to_db_time(run.run_time),
                run.timeout_seconds,
                run.is_auto_resume as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record executor progress. Terminal runs ignore heartbeats.
    pub fn heartbeat(&self, run_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE evaluation_runs SET last_activity_time = ?1
             WHERE id = ?2 AND deleted_at IS NULL AND status NOT IN ('COMPLETED', 'FAILED')",
            params![to_db_time(at), run_id],
        )?;
        Ok(changed == 1)
    }

    /// Pause a running run.
    pub fn pause(
        &self,
        run_id: i64,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE evaluation_runs
             SET status = 'PAUSED', pause_time = ?1, pause_reason = ?2, last_activity_time = ?1
             WHERE id = ?3 AND deleted_at IS NULL AND status IN ('IN_PROGRESS', 'RESUMING')",
            params![to_db_time(at), reason, run_id],
        )?;
        Ok(changed == 1)
    }

    /// Normal completion by the executor.
    pub fn complete(&self, run_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE evaluation_runs
             SET status = 'COMPLETED', completed_at = ?1, last_activity_time = ?1
             WHERE id = ?2 AND deleted_at IS NULL AND status = 'IN_PROGRESS'",
            params![to_db_time(at), run_id],
        )?;
        Ok(changed == 1)
    }

    /// Restart bookkeeping used by [`super::StoreResumer`]: move to RESUMING,
    /// bump `resume_count`, clear the pause and refresh activity.
    pub fn mark_resuming(&self, run_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "UPDATE evaluation_runs
             SET status = 'RESUMING', resume_count = resume_count + 1,
                 pause_time = NULL, pause_reason = NULL, last_activity_time = ?
             WHERE id = ? AND deleted_at IS NULL AND status IN ({})",
            placeholders(RunStatus::RESUMABLE.len())
        );
        let at = to_db_time(at);
        let mut bound: Vec<&dyn ToSql> = vec![&at, &run_id];
        bound.extend(RunStatus::RESUMABLE.iter().map(|s| s as &dyn ToSql));
        let changed = conn.execute(&sql, params_from_iter(bound))?;
        Ok(changed == 1)
    }

    pub fn soft_delete(&self, run_id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE evaluation_runs SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![to_db_time(at), run_id],
        )?;
        Ok(changed == 1)
    }

    /// All live runs, optionally restricted to one status.
    pub fn list(&self, status: Option<RunStatus>) -> Result<Vec<EvaluationRun>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs
             WHERE deleted_at IS NULL AND (?1 IS NULL OR status = ?1)
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![status], read_run)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

impl RunStore for SqliteRunStore {
    fn find_stale(
        &self,
        statuses: &[RunStatus],
        now: DateTime<Utc>,
        coarse_secs: i64,
    ) -> Result<Vec<EvaluationRun>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs
             WHERE status IN ({})
             AND CAST(strftime('%s', COALESCE(last_activity_time, run_time)) AS INTEGER)
                 < ? - MIN(CASE WHEN timeout_seconds > 0 THEN timeout_seconds ELSE ? END, ?)
             AND deleted_at IS NULL
             ORDER BY id",
            placeholders(statuses.len())
        );
        let now_secs = now.timestamp();
        let mut bound: Vec<&dyn ToSql> = statuses.iter().map(|s| s as &dyn ToSql).collect();
        bound.push(&now_secs);
        bound.push(&coarse_secs);
        bound.push(&coarse_secs);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), read_run)?;
        let runs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn find_paused_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EvaluationRun>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM evaluation_runs
             WHERE status = 'PAUSED'
             AND is_auto_resume = 1
             AND COALESCE(pause_time, last_activity_time, run_time) < ?1
             AND deleted_at IS NULL
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![to_db_time(cutoff)], read_run)?;
        let runs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn update_status(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        new_status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let guard: Vec<RunStatus> = expected.iter().copied().filter(|s| !s.is_terminal()).collect();
        if guard.is_empty() {
            return Ok(false);
        }

        let conn = self.pool.get()?;
        let now = to_db_time(Utc::now());
        let completed_at: Option<&String> = (new_status == RunStatus::Completed).then_some(&now);
        let sql = format!(
            "UPDATE evaluation_runs
             SET status = ?, error_message = COALESCE(?, error_message),
                 last_activity_time = ?, completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND deleted_at IS NULL AND status IN ({})",
            placeholders(guard.len())
        );
        let mut bound: Vec<&dyn ToSql> = vec![&new_status, &message, &now, &completed_at, &run_id];
        bound.extend(guard.iter().map(|s| s as &dyn ToSql));

        let changed = conn.execute(&sql, params_from_iter(bound))?;
        Ok(changed == 1)
    }

    fn get(&self, run_id: i64) -> Result<Option<EvaluationRun>, StoreError> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM evaluation_runs
                     WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![run_id],
                read_run,
            )
            .optional()?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use chrono::{Duration, TimeZone};

    fn store() -> (tempfile::TempDir, SqliteRunStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("runs.db").to_str().unwrap()).unwrap();
        (dir, SqliteRunStore::new(pool))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn active(store: &SqliteRunStore, name: &str, status: RunStatus, at: DateTime<Utc>) -> i64 {
        store
            .insert(&NewRun { status, ..NewRun::pending(name, at) })
            .unwrap()
    }

    #[test]
    fn test_find_stale_uses_heartbeat_then_run_time() {
        let (_dir, store) = store();
        let quiet = active(&store, "quiet", RunStatus::InProgress, t0());
        let beating = active(&store, "beating", RunStatus::InProgress, t0());
        store.heartbeat(beating, t0() + Duration::minutes(10)).unwrap();
        let done = active(&store, "done", RunStatus::InProgress, t0());
        store.complete(done, t0() + Duration::minutes(1)).unwrap();

        let stale = store
            .find_stale(&RunStatus::ACTIVE, t0() + Duration::minutes(65), 3600)
            .unwrap();
        assert_eq!(stale.iter().map(|r| r.id).collect::<Vec<_>>(), vec![quiet]);
    }

    #[test]
    fn test_find_stale_cutoff_is_per_run() {
        let (_dir, store) = store();
        let short = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                timeout_seconds: Some(60),
                ..NewRun::pending("short", t0())
            })
            .unwrap();
        let long = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                timeout_seconds: Some(7200),
                ..NewRun::pending("long", t0())
            })
            .unwrap();
        let fallback = active(&store, "fallback", RunStatus::InProgress, t0());

        let ids = |now: DateTime<Utc>| {
            store
                .find_stale(&RunStatus::ACTIVE, now, 3600)
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect::<Vec<_>>()
        };
        assert!(ids(t0() + Duration::seconds(60)).is_empty());
        assert_eq!(ids(t0() + Duration::seconds(90)), vec![short]);
        // Long timeouts are capped at the coarse cutoff.
        assert_eq!(ids(t0() + Duration::minutes(61)), vec![short, long, fallback]);
    }

    #[test]
    fn test_update_status_is_conditional() {
        let (_dir, store) = store();
        let id = active(&store, "r", RunStatus::InProgress, t0());

        assert!(store
            .update_status(id, &RunStatus::ACTIVE, RunStatus::Failed, Some("timed out"))
            .unwrap());
        // Second attempt finds the run terminal and writes nothing.
        assert!(!store
            .update_status(id, &RunStatus::ACTIVE, RunStatus::Failed, Some("again"))
            .unwrap());

        let run = store.get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_update_status_never_leaves_terminal_state() {
        let (_dir, store) = store();
        let id = active(&store, "r", RunStatus::InProgress, t0());
        store.complete(id, t0()).unwrap();

        assert!(!store
            .update_status(id, &[RunStatus::Completed], RunStatus::Failed, None)
            .unwrap());
        assert_eq!(store.get(id).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_find_paused_requires_auto_resume() {
        let (_dir, store) = store();
        let auto = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                is_auto_resume: true,
                ..NewRun::pending("auto", t0())
            })
            .unwrap();
        let manual = active(&store, "manual", RunStatus::InProgress, t0());
        store.pause(auto, t0(), Some("rate limited")).unwrap();
        store.pause(manual, t0(), None).unwrap();

        let due = store.find_paused_older_than(t0() + Duration::minutes(6)).unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![auto]);
        assert_eq!(due[0].pause_reason.as_deref(), Some("rate limited"));

        assert!(store.find_paused_older_than(t0()).unwrap().is_empty());
    }

    #[test]
    fn test_mark_resuming_clears_pause() {
        let (_dir, store) = store();
        let id = active(&store, "r", RunStatus::InProgress, t0());
        store.pause(id, t0(), Some("quota")).unwrap();

        assert!(store.mark_resuming(id, t0() + Duration::minutes(7)).unwrap());
        let run = store.get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Resuming);
        assert_eq!(run.resume_count, 1);
        assert!(run.pause_time.is_none());
        assert_eq!(run.last_activity_time, Some(t0() + Duration::minutes(7)));
    }

    #[test]
    fn test_soft_deleted_runs_are_invisible() {
        let (_dir, store) = store();
        let id = active(&store, "r", RunStatus::Pending, t0());
        store.soft_delete(id, t0()).unwrap();

        assert!(store.get(id).unwrap().is_none());
        assert!(store.list(None).unwrap().is_empty());
        assert!(store
            .find_stale(&RunStatus::ACTIVE, t0() + Duration::days(1), 3600)
            .unwrap()
            .is_empty());
    }
}
