use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::{ReaperReport, RunLifecycleMonitor};
use crate::runs::{EvaluationRun, RunStatus, StoreError};

/// Failure message stored on a timed-out run.
pub fn timeout_message(timeout_secs: i64, idle: Duration) -> String {
    format!(
        "evaluation run timed out: no activity for over {} min (idle {} min)",
        timeout_secs / 60,
        idle.num_minutes()
    )
}

impl RunLifecycleMonitor {
    /// Fail active runs idle past their own timeout; nudge merely stalled
    /// auto-resume runs through the resumer.
    ///
    /// A run is looked at once it is idle past the shorter of its own
    /// timeout and `default_timeout_secs`. Only runs idle past
    /// `default_timeout_secs` but still inside a longer timeout of their own
    /// count as stalled.
    pub async fn reap_timeouts(&self, now: DateTime<Utc>) -> Result<ReaperReport, StoreError> {
        let coarse_secs = self.config.default_timeout_secs.max(0);
        let stale = self
            .with_store(move |store| store.find_stale(&RunStatus::ACTIVE, now, coarse_secs))
            .await?;

        let mut report = ReaperReport {
            examined: stale.len(),
            ..ReaperReport::default()
        };
        if stale.is_empty() {
            debug!("no stale runs");
            return Ok(report);
        }

        for run in stale {
            self.handle_stale_run(run, now, &mut report).await;
        }
        Ok(report)
    }

    async fn handle_stale_run(
        &self,
        run: EvaluationRun,
        now: DateTime<Utc>,
        report: &mut ReaperReport,
    ) {
        let timeout_secs = run.effective_timeout_secs(self.config.default_timeout_secs);
        let threshold = now - Duration::seconds(timeout_secs);
        let last_activity = run.last_activity();

        if last_activity < threshold {
            let message = timeout_message(timeout_secs, now - last_activity);
            let run_id = run.id;
            let written = self
                .with_store(move |store| {
                    store.update_status(
                        run_id,
                        &RunStatus::ACTIVE,
                        RunStatus::Failed,
                        Some(&message),
                    )
                })
                .await;

            match written {
                Ok(true) => {
                    warn!(
                        run_id,
                        timeout_secs,
                        status = %run.status,
                        "run timed out, marked FAILED"
                    );
                    report.timed_out.push(run_id);
                }
                Ok(false) => {
                    debug!(run_id, "run left the active set before the timeout write");
                    report.skipped.push(run_id);
                }
                Err(e) => {
                    error!(run_id, error = %e, "failed to mark run as timed out");
                    report.write_failed.push(run_id);
                }
            }
            return;
        }

        let coarse_cutoff = now - Duration::seconds(self.config.default_timeout_secs.max(0));
        if last_activity >= coarse_cutoff {
            debug!(run_id = run.id, timeout_secs, "run idle but inside its timeout");
            return;
        }

        if run.is_auto_resume && run.status != RunStatus::Failed {
            match self.resumer.resume(run.id).await {
                Ok(()) => {
                    info!(run_id = run.id, "resumed stalled run");
                    report.resumed.push(run.id);
                }
                Err(e) => {
                    error!(run_id = run.id, error = %e, "failed to resume stalled run");
                    report.resume_failed.push(run.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_uses_minutes() {
        let msg = timeout_message(60, Duration::seconds(61));
        assert!(msg.contains("over 1 min"), "{msg}");
        assert!(msg.contains("idle 1 min"), "{msg}");

        let msg = timeout_message(3600, Duration::minutes(95));
        assert!(msg.contains("over 60 min"), "{msg}");
        assert!(msg.contains("idle 95 min"), "{msg}");
    }
}
