//! Score aggregation: folds evaluation records into per-model batch leaderboard rows.

pub mod engine;
pub mod query;
mod stats;
mod views;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use self::engine::{BatchSummary, ModelFailure, ModelOutcome, ScoreAggregator};
pub use self::query::{model_score_details, rank_models_in_batch, ModelRanking, ModelScoreDetails};
pub use self::stats::ScoreStats;

/// Pooled score over every score type.
pub const OVERALL: &str = "OVERALL";
/// Pooled score over single and multiple choice answers.
pub const OBJECTIVE: &str = "OBJECTIVE";
/// Completeness-filtered score over subjective and simple-fact answers.
pub const SUBJECTIVE: &str = "SUBJECTIVE";

/// Repeat index of a row folded across all repeats.
pub const FOLDED_REPEAT: i32 = -1;

/// Identity of a score row within one `(batch, model)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ScoreKey {
    /// `None` for rows aggregated across evaluators.
    pub evaluator_id: Option<i64>,
    pub score_type: String,
    pub repeat_index: i32,
}

impl ScoreKey {
    pub fn new(evaluator_id: Option<i64>, score_type: &str, repeat_index: i32) -> Self {
        Self {
            evaluator_id,
            score_type: score_type.to_string(),
            repeat_index,
        }
    }

    pub fn is_folded(&self) -> bool {
        self.repeat_index == FOLDED_REPEAT
    }
}

/// Aggregate values of one row before it is bound to a batch and model.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub key: ScoreKey,
    pub average_score: f64,
    pub total_answers: i64,
    pub scored_answers: i64,
    pub max_score: Option<f64>,
    pub min_score: Option<f64>,
}

impl AggregateRow {
    /// Row for a non-empty group; `None` when the group is empty.
    pub fn from_stats(key: ScoreKey, stats: &ScoreStats) -> Option<Self> {
        let average_score = stats.mean()?;
        Some(Self {
            key,
            average_score,
            total_answers: stats.count as i64,
            scored_answers: stats.count as i64,
            max_score: stats.max(),
            min_score: stats.min(),
        })
    }
}

/// A persisted leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelBatchScore {
    pub id: i64,
    pub batch_id: i64,
    pub model_id: i64,
    pub evaluator_id: Option<i64>,
    pub score_type: String,
    pub repeat_index: i32,
    pub average_score: f64,
    pub total_answers: i64,
    pub scored_answers: i64,
    pub max_score: Option<f64>,
    pub min_score: Option<f64>,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl AggregationError {
    pub fn batch_not_found(id: i64) -> Self {
        AggregationError::NotFound { entity: "batch", id }
    }

    pub fn model_not_found(id: i64) -> Self {
        AggregationError::NotFound { entity: "model", id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AggregationError::NotFound { .. })
    }
}
