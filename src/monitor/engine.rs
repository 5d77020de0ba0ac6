//! Timer loops driving the monitor.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use super::RunLifecycleMonitor;

/// Handles to the two monitor loops. Dropping it leaves them running.
pub struct MonitorHandle {
    reaper: JoinHandle<()>,
    auto_resume: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop both loops.
    pub fn abort(&self) {
        self.reaper.abort();
        self.auto_resume.abort();
    }

    /// Wait for both loops; only returns once they were aborted.
    pub async fn join(self) {
        let _ = self.reaper.await;
        let _ = self.auto_resume.await;
    }
}

/// Start the timeout reaper and auto-resume loops on the current runtime.
///
/// A tick that overruns its period delays the next one instead of bursting,
/// so each loop never overlaps with itself.
pub fn spawn(monitor: Arc<RunLifecycleMonitor>) -> MonitorHandle {
    let reaper = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            let period = monitor.config().timeout_check_interval();
            info!(period_secs = period.as_secs(), "timeout reaper started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                monitor.run_reaper_tick().await;
            }
        })
    };

    let auto_resume = tokio::spawn(async move {
        let period = monitor.config().auto_resume_interval();
        info!(period_secs = period.as_secs(), "auto-resume loop started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            monitor.run_auto_resume_tick().await;
        }
    });

    MonitorHandle { reaper, auto_resume }
}
