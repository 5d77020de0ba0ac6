//! Read side of the leaderboard.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{AggregationError, ModelBatchScore, FOLDED_REPEAT, OVERALL};
use crate::storage::catalog::{self, Batch, Model};
use crate::storage::time_column;

/// One model's position in a batch leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRanking {
    /// 1-based position.
    pub rank: usize,
    pub model_id: i64,
    pub model_name: String,
    pub provider: Option<String>,
    pub version: Option<String>,
    pub score_type: String,
    pub average_score: f64,
    pub total_answers: i64,
    pub scored_answers: i64,
    pub max_score: Option<f64>,
    pub min_score: Option<f64>,
}

/// Every row of one model in one batch, grouped by score type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelScoreDetails {
    pub batch: Batch,
    pub model: Model,
    pub scores_by_type: BTreeMap<String, Vec<ModelBatchScore>>,
}

/// Models by descending folded cross-evaluator average for `score_type`
/// (OVERALL when `None`).
pub fn rank_models_in_batch(
    conn: &Connection,
    batch_id: i64,
    score_type: Option<&str>,
) -> Result<Vec<ModelRanking>, AggregationError> {
    if catalog::get_batch(conn, batch_id)?.is_none() {
        return Err(AggregationError::batch_not_found(batch_id));
    }
    let score_type = score_type.unwrap_or(OVERALL);

    let mut stmt = conn.prepare(
        "SELECT s.model_id, m.name, m.provider, m.version, s.score_type, s.average_score,
                s.total_answers, s.scored_answers, s.max_score, s.min_score
         FROM model_batch_scores s
         JOIN models m ON m.id = s.model_id
         WHERE s.batch_id = ?1 AND s.score_type = ?2
         AND s.evaluator_id IS NULL AND s.repeat_index = ?3
         AND m.deleted_at IS NULL
         ORDER BY s.average_score DESC, s.model_id",
    )?;
    let rows = stmt.query_map(params![batch_id, score_type, FOLDED_REPEAT], |row| {
        Ok(ModelRanking {
            rank: 0,
            model_id: row.get(0)?,
            model_name: row.get(1)?,
            provider: row.get(2)?,
            version: row.get(3)?,
            score_type: row.get(4)?,
            average_score: row.get(5)?,
            total_answers: row.get(6)?,
            scored_answers: row.get(7)?,
            max_score: row.get(8)?,
            min_score: row.get(9)?,
        })
    })?;

    let mut rankings = Vec::new();
    for (i, r) in rows.enumerate() {
        let mut ranking = r?;
        ranking.rank = i + 1;
        rankings.push(ranking);
    }
    Ok(rankings)
}

fn read_score(row: &Row<'_>) -> rusqlite::Result<ModelBatchScore> {
    Ok(ModelBatchScore {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        model_id: row.get(2)?,
        evaluator_id: row.get(3)?,
        score_type: row.get(4)?,
        repeat_index: row.get(5)?,
        average_score: row.get(6)?,
        total_answers: row.get(7)?,
        scored_answers: row.get(8)?,
        max_score: row.get(9)?,
        min_score: row.get(10)?,
        calculated_at: time_column(row, 11)?,
    })
}

/// Batch and model descriptors plus their rows, ordered by evaluator then repeat
/// (cross-evaluator rows first, folded rows first).
pub fn model_score_details(
    conn: &Connection,
    batch_id: i64,
    model_id: i64,
) -> Result<ModelScoreDetails, AggregationError> {
    let batch = catalog::get_batch(conn, batch_id)?
        .ok_or(AggregationError::batch_not_found(batch_id))?;
    let model = catalog::get_model(conn, model_id)?
        .ok_or(AggregationError::model_not_found(model_id))?;

    let mut stmt = conn.prepare(
        "SELECT id, batch_id, model_id, evaluator_id, score_type, repeat_index, average_score,
                total_answers, scored_answers, max_score, min_score, calculated_at
         FROM model_batch_scores
         WHERE batch_id = ?1 AND model_id = ?2
         ORDER BY score_type, evaluator_id, repeat_index",
    )?;
    let rows = stmt.query_map(params![batch_id, model_id], read_score)?;

    let mut scores_by_type: BTreeMap<String, Vec<ModelBatchScore>> = BTreeMap::new();
    for r in rows {
        let score = r?;
        scores_by_type.entry(score.score_type.clone()).or_default().push(score);
    }

    Ok(ModelScoreDetails {
        batch,
        model,
        scores_by_type,
    })
}
