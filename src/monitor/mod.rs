//! Run lifecycle monitor: timeout reaper and auto-resume trigger.
//!
//! Both tasks are plain functions of `now` over a [`RunStore`] and a
//! [`RunResumer`]; [`engine`] owns the timers that drive them. They watch
//! disjoint status sets (active vs. paused), so they need no lock between
//! them. Writes go through the store's conditional update, which is what
//! protects against the executor advancing the same run concurrently.

mod auto_resume;
pub mod engine;
mod reaper;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::runs::{RunResumer, RunStore, StoreError};

pub use self::engine::{spawn, MonitorHandle};
pub use self::reaper::timeout_message;

/// Outcome of one timeout-reaper pass.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReaperReport {
    /// Runs returned by the staleness query.
    pub examined: usize,
    /// Runs transitioned to FAILED by this pass.
    pub timed_out: Vec<i64>,
    /// Stalled auto-resume runs handed to the resumer.
    pub resumed: Vec<i64>,
    pub resume_failed: Vec<i64>,
    /// Runs that left the active set between the query and the write.
    pub skipped: Vec<i64>,
    pub write_failed: Vec<i64>,
}

/// Outcome of one auto-resume pass.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AutoResumeReport {
    pub examined: usize,
    pub resumed: Vec<i64>,
    pub resume_failed: Vec<i64>,
}

/// Detects timed-out and paused runs and drives their recovery.
pub struct RunLifecycleMonitor {
    store: Arc<dyn RunStore>,
    resumer: Arc<dyn RunResumer>,
    config: MonitorConfig,
}

impl RunLifecycleMonitor {
    pub fn new(
        store: Arc<dyn RunStore>,
        resumer: Arc<dyn RunResumer>,
        config: MonitorConfig,
    ) -> Self {
        Self { store, resumer, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// One reaper tick against the wall clock. Never fails; errors are logged.
    pub async fn run_reaper_tick(&self) -> Option<ReaperReport> {
        let report = self
            .observe("timeout_reaper", self.reap_timeouts(chrono::Utc::now()))
            .await?;
        if !report.timed_out.is_empty()
            || !report.resumed.is_empty()
            || !report.resume_failed.is_empty()
        {
            tracing::info!(
                examined = report.examined,
                timed_out = report.timed_out.len(),
                resumed = report.resumed.len(),
                resume_failed = report.resume_failed.len(),
                "timeout reaper pass finished"
            );
        }
        Some(report)
    }

    /// One auto-resume tick against the wall clock. Never fails; errors are logged.
    pub async fn run_auto_resume_tick(&self) -> Option<AutoResumeReport> {
        let report = self
            .observe("auto_resume", self.auto_resume(chrono::Utc::now()))
            .await?;
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                resumed = report.resumed.len(),
                resume_failed = report.resume_failed.len(),
                "auto-resume pass finished"
            );
        }
        Some(report)
    }

    /// One reaper tick followed by one auto-resume tick.
    pub async fn run_once(&self) -> (Option<ReaperReport>, Option<AutoResumeReport>) {
        let reaped = self.run_reaper_tick().await;
        let resumed = self.run_auto_resume_tick().await;
        (reaped, resumed)
    }

    /// Run `fut` inside a tick span and warn when it overruns the soft deadline.
    async fn observe<T, F>(&self, task: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let tick_id = Uuid::new_v4();
        let span = info_span!("monitor_tick", task, %tick_id);
        let started = Instant::now();

        let result = fut.instrument(span.clone()).await;

        let elapsed = started.elapsed();
        let deadline = self.config.tick_deadline();
        span.in_scope(|| {
            if !deadline.is_zero() && elapsed > deadline {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    deadline_ms = deadline.as_millis() as u64,
                    "monitor tick overran its deadline"
                );
            }
            match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(error = %e, "monitor tick failed");
                    None
                }
            }
        })
    }

    /// Run a store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn RunStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{NewRun, ResumeError, RunStatus, SqliteRunStore};
    use crate::storage::open_pool;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Mutex;

    /// Records resume calls; ids in `fail` return a dispatch error.
    #[derive(Default)]
    struct RecordingResumer {
        calls: Mutex<Vec<i64>>,
        fail: Vec<i64>,
    }

    #[async_trait]
    impl RunResumer for RecordingResumer {
        async fn resume(&self, run_id: i64) -> Result<(), ResumeError> {
            self.calls.lock().unwrap().push(run_id);
            if self.fail.contains(&run_id) {
                return Err(ResumeError::Dispatch { run_id, reason: "worker pool full".into() });
            }
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn setup(
        resumer: Arc<RecordingResumer>,
    ) -> (tempfile::TempDir, SqliteRunStore, RunLifecycleMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("monitor.db").to_str().unwrap()).unwrap();
        let store = SqliteRunStore::new(pool);
        let monitor =
            RunLifecycleMonitor::new(Arc::new(store.clone()), resumer, MonitorConfig::default());
        (dir, store, monitor)
    }

    #[tokio::test]
    async fn test_reaper_fails_run_past_its_timeout() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, monitor) = setup(resumer.clone());
        let id = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                timeout_seconds: Some(60),
                ..NewRun::pending("short", t0())
            })
            .unwrap();

        let report = monitor.reap_timeouts(t0() + Duration::seconds(61)).await.unwrap();
        assert_eq!(report.timed_out, vec![id]);

        let run = store.get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("over 1 min"));
        assert!(resumer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reaper_resumes_stalled_auto_resume_run() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, monitor) = setup(resumer.clone());
        let id = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                timeout_seconds: Some(7200),
                is_auto_resume: true,
                ..NewRun::pending("stalled", t0())
            })
            .unwrap();

        // Past the default hour but inside the run's own two hours.
        let report = monitor.reap_timeouts(t0() + Duration::minutes(90)).await.unwrap();
        assert!(report.timed_out.is_empty());
        assert_eq!(report.resumed, vec![id]);
        assert_eq!(store.get(id).unwrap().unwrap().status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn test_reaper_leaves_briefly_quiet_auto_resume_run_alone() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, monitor) = setup(resumer.clone());
        let default_timeout = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                is_auto_resume: true,
                ..NewRun::pending("default", t0())
            })
            .unwrap();
        let long_timeout = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                timeout_seconds: Some(7200),
                is_auto_resume: true,
                ..NewRun::pending("long", t0())
            })
            .unwrap();

        let report = monitor.reap_timeouts(t0() + Duration::seconds(90)).await.unwrap();
        assert_eq!(report, ReaperReport::default());
        assert!(resumer.calls.lock().unwrap().is_empty());
        for id in [default_timeout, long_timeout] {
            assert_eq!(store.get(id).unwrap().unwrap().status, RunStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn test_reaper_ignores_fresh_and_terminal_runs() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, monitor) = setup(resumer.clone());
        let fresh = store
            .insert(&NewRun { status: RunStatus::InProgress, ..NewRun::pending("fresh", t0()) })
            .unwrap();
        let done = store
            .insert(&NewRun { status: RunStatus::InProgress, ..NewRun::pending("done", t0()) })
            .unwrap();
        store.complete(done, t0()).unwrap();

        let report = monitor.reap_timeouts(t0() + Duration::seconds(30)).await.unwrap();
        assert_eq!(report.examined, 0);
        let report = monitor.reap_timeouts(t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(report.timed_out, vec![fresh]);
        assert_eq!(store.get(done).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_auto_resume_continues_after_failure() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, _) = setup(resumer.clone());
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let id = store
                .insert(&NewRun {
                    status: RunStatus::InProgress,
                    is_auto_resume: true,
                    ..NewRun::pending(name, t0())
                })
                .unwrap();
            store.pause(id, t0(), Some("rate limited")).unwrap();
            ids.push(id);
        }
        let failing = Arc::new(RecordingResumer {
            fail: vec![ids[0]],
            ..RecordingResumer::default()
        });
        let monitor = RunLifecycleMonitor::new(
            Arc::new(store.clone()),
            failing.clone(),
            MonitorConfig::default(),
        );

        let report = monitor.auto_resume(t0() + Duration::minutes(6)).await.unwrap();
        assert_eq!(report.resume_failed, vec![ids[0]]);
        assert_eq!(report.resumed, vec![ids[1]]);
        assert_eq!(*failing.calls.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn test_auto_resume_waits_for_grace_period() {
        let resumer = Arc::new(RecordingResumer::default());
        let (_dir, store, monitor) = setup(resumer.clone());
        let id = store
            .insert(&NewRun {
                status: RunStatus::InProgress,
                is_auto_resume: true,
                ..NewRun::pending("r", t0())
            })
            .unwrap();
        store.pause(id, t0(), None).unwrap();

        let report = monitor.auto_resume(t0() + Duration::minutes(4)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert!(resumer.calls.lock().unwrap().is_empty());
    }
}
