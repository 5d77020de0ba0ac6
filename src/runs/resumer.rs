//! Resume contract and the store-backed implementation used by the daemon.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use super::{RunStatus, RunStore, SqliteRunStore, StoreError};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("run {0} not found")]
    NotFound(i64),

    #[error("run {run_id} cannot be resumed from {status}")]
    NotResumable { run_id: i64, status: RunStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("resume of run {run_id} failed: {reason}")]
    Dispatch { run_id: i64, reason: String },
}

/// Restarts processing of a run.
///
/// Callers treat every error as transient: the run keeps its status and the
/// next monitor tick tries again. Implementations bound their own latency.
#[async_trait]
pub trait RunResumer: Send + Sync {
    async fn resume(&self, run_id: i64) -> Result<(), ResumeError>;
}

/// Hands a run back to the executor by flipping it to RESUMING.
///
/// The executor polls for RESUMING runs and continues from its last
/// checkpoint; queueing and worker dispatch live on that side.
#[derive(Clone)]
pub struct StoreResumer {
    store: SqliteRunStore,
}

impl StoreResumer {
    pub fn new(store: SqliteRunStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RunResumer for StoreResumer {
    async fn resume(&self, run_id: i64) -> Result<(), ResumeError> {
        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(), ResumeError> {
            let run = store.get(run_id)?.ok_or(ResumeError::NotFound(run_id))?;
            if !run.status.can_transition_to(RunStatus::Resuming) {
                return Err(ResumeError::NotResumable { run_id, status: run.status });
            }
            if store.mark_resuming(run_id, Utc::now())? {
                return Ok(());
            }
            // Lost a race with the executor; report what it left behind.
            let status = store.get(run_id)?.map(|r| r.status).ok_or(ResumeError::NotFound(run_id))?;
            Err(ResumeError::NotResumable { run_id, status })
        })
        .await
        .map_err(|e| ResumeError::Dispatch { run_id, reason: e.to_string() })?;

        if outcome.is_ok() {
            info!(run_id, "run handed back to executor");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{NewRun, RunStore};
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, SqliteRunStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("resume.db").to_str().unwrap()).unwrap();
        (dir, SqliteRunStore::new(pool))
    }

    #[tokio::test]
    async fn test_resume_paused_run() {
        let (_dir, store) = store();
        let id = store
            .insert(&NewRun { status: RunStatus::InProgress, ..NewRun::pending("r", Utc::now()) })
            .unwrap();
        store.pause(id, Utc::now(), None).unwrap();

        StoreResumer::new(store.clone()).resume(id).await.unwrap();
        let run = store.get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Resuming);
        assert_eq!(run.resume_count, 1);
    }

    #[tokio::test]
    async fn test_resume_rejects_terminal_and_missing_runs() {
        let (_dir, store) = store();
        let id = store
            .insert(&NewRun { status: RunStatus::InProgress, ..NewRun::pending("r", Utc::now()) })
            .unwrap();
        store.complete(id, Utc::now()).unwrap();
        let resumer = StoreResumer::new(store.clone());

        match resumer.resume(id).await {
            Err(ResumeError::NotResumable { status, .. }) => {
                assert_eq!(status, RunStatus::Completed)
            }
            other => panic!("expected NotResumable, got {other:?}"),
        }
        assert!(matches!(resumer.resume(9999).await, Err(ResumeError::NotFound(9999))));
    }

    #[tokio::test]
    async fn test_resume_rejects_pending_run() {
        let (_dir, store) = store();
        let id = store.insert(&NewRun::pending("queued", Utc::now())).unwrap();

        match StoreResumer::new(store.clone()).resume(id).await {
            Err(ResumeError::NotResumable { status, .. }) => assert_eq!(status, RunStatus::Pending),
            other => panic!("expected NotResumable, got {other:?}"),
        }
        assert_eq!(store.get(id).unwrap().unwrap().resume_count, 0);
    }
}
