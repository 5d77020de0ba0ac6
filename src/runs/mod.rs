//! Evaluation runs: status machine, persistence contract, and resume contract.

pub mod resumer;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::resumer::{ResumeError, RunResumer, StoreResumer};
pub use self::store::{NewRun, RunStore, SqliteRunStore};

/// Timeout applied to runs that never configured one.
pub const DEFAULT_TIMEOUT_SECS: i64 = 3600;

/// Lifecycle status of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Resuming,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Statuses the timeout reaper watches.
    pub const ACTIVE: [RunStatus; 3] =
        [RunStatus::InProgress, RunStatus::Pending, RunStatus::Resuming];

    /// Statuses a resume may start from.
    pub const RESUMABLE: [RunStatus; 3] =
        [RunStatus::Paused, RunStatus::InProgress, RunStatus::Resuming];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Resuming => "RESUMING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (Pending, InProgress) => true,
            (InProgress, Completed | Paused) => true,
            (Paused, Resuming) => true,
            (Resuming, InProgress) => true,
            (Pending | InProgress | Resuming, Failed) => true,
            // a stalled run may be restarted by the resumer
            (InProgress | Resuming, Resuming) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RunStatus::Pending),
            "IN_PROGRESS" => Ok(RunStatus::InProgress),
            "RESUMING" => Ok(RunStatus::Resuming),
            "PAUSED" => Ok(RunStatus::Paused),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A long-running evaluation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRun {
    pub id: i64,
    pub name: String,
    pub status: RunStatus,
    /// Creation instant.
    pub run_time: DateTime<Utc>,
    /// Last progress heartbeat from the executor.
    pub last_activity_time: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub is_auto_resume: bool,
    pub error_message: Option<String>,
    pub pause_time: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub resume_count: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EvaluationRun {
    /// Last heartbeat, or the creation instant when none was ever recorded.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity_time.unwrap_or(self.run_time)
    }

    /// The run's own timeout; unset or non-positive values fall back to `default_secs`.
    pub fn effective_timeout_secs(&self, default_secs: i64) -> i64 {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => secs,
            _ => default_secs,
        }
    }

    /// When the pause grace period is measured from.
    pub fn paused_since(&self) -> DateTime<Utc> {
        self.pause_time.unwrap_or_else(|| self.last_activity())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
