use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use super::{AutoResumeReport, RunLifecycleMonitor};
use crate::runs::StoreError;

impl RunLifecycleMonitor {
    /// Hand every auto-resumable run paused for longer than the grace
    /// period to the resumer. A failed resume leaves the run PAUSED for the
    /// next pass and does not stop this one.
    pub async fn auto_resume(&self, now: DateTime<Utc>) -> Result<AutoResumeReport, StoreError> {
        let cutoff = now - Duration::seconds(self.config.pause_grace_secs.max(0));
        let due = self
            .with_store(move |store| store.find_paused_older_than(cutoff))
            .await?;

        let mut report = AutoResumeReport {
            examined: due.len(),
            ..AutoResumeReport::default()
        };
        if due.is_empty() {
            debug!("no paused runs due for resume");
            return Ok(report);
        }

        for run in due {
            let paused_for = (now - run.paused_since()).num_seconds();
            match self.resumer.resume(run.id).await {
                Ok(()) => {
                    info!(
                        run_id = run.id,
                        paused_for_secs = paused_for,
                        reason = ?run.pause_reason,
                        "auto-resumed paused run"
                    );
                    report.resumed.push(run.id);
                }
                Err(e) => {
                    error!(run_id = run.id, error = %e, "auto-resume failed");
                    report.resume_failed.push(run.id);
                }
            }
        }
        Ok(report)
    }
}
