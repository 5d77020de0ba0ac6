//! Recomputes and clears leaderboard rows.

use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::views::{self, ViewRows};
use super::{query, AggregateRow, AggregationError, ModelRanking, ModelScoreDetails};
use crate::config::FailurePolicy;
use crate::storage::answers::{self, AnswerScope};
use crate::storage::evaluations::{self, RecordFilter};
use crate::storage::{catalog, to_db_time, Pool};

/// Rows written for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOutcome {
    pub model_id: i64,
    pub rows: usize,
}

/// A model whose recompute failed under [`FailurePolicy::Continue`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelFailure {
    pub model_id: i64,
    pub error: String,
}

/// Result of recomputing a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub computed: Vec<ModelOutcome>,
    pub failed: Vec<ModelFailure>,
}

/// Owns the `model_batch_scores` table.
#[derive(Clone)]
pub struct ScoreAggregator {
    pool: Pool,
    policy: FailurePolicy,
}

impl ScoreAggregator {
    pub fn new(pool: Pool, policy: FailurePolicy) -> Self {
        Self { pool, policy }
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Recompute every model that has answers in the batch.
    pub fn compute_for_batch(&self, batch_id: i64) -> Result<BatchSummary, AggregationError> {
        let model_ids = {
            let conn = self.pool.get()?;
            if catalog::get_batch(&conn, batch_id)?.is_none() {
                return Err(AggregationError::batch_not_found(batch_id));
            }
            answers::models_in_batch(&conn, batch_id)?
        };

        let mut summary = BatchSummary::default();
        if model_ids.is_empty() {
            warn!(batch_id, "batch has no answers, nothing to aggregate");
            return Ok(summary);
        }

        for model_id in model_ids {
            match self.compute_for_model(batch_id, model_id) {
                Ok(rows) => summary.computed.push(ModelOutcome { model_id, rows }),
                Err(e) if self.policy == FailurePolicy::Continue => {
                    error!(batch_id, model_id, error = %e, "model aggregation failed, continuing");
                    summary.failed.push(ModelFailure { model_id, error: e.to_string() });
                }
                Err(e) => {
                    error!(
                        batch_id,
                        model_id,
                        error = %e,
                        "model aggregation failed, aborting batch"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            batch_id,
            computed = summary.computed.len(),
            failed = summary.failed.len(),
            "batch aggregation finished"
        );
        Ok(summary)
    }

    /// Replace every row of `(batch_id, model_id)` in one immediate
    /// transaction. Returns the number of rows written.
    pub fn compute_for_model(
        &self,
        batch_id: i64,
        model_id: i64,
    ) -> Result<usize, AggregationError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if catalog::get_batch(&tx, batch_id)?.is_none() {
            return Err(AggregationError::batch_not_found(batch_id));
        }
        if catalog::get_model(&tx, model_id)?.is_none() {
            return Err(AggregationError::model_not_found(model_id));
        }

        let removed = tx.execute(
            "DELETE FROM model_batch_scores WHERE batch_id = ?1 AND model_id = ?2",
            params![batch_id, model_id],
        )?;

        let rows = collect_rows(&tx, batch_id, model_id)?;
        insert_rows(&tx, batch_id, model_id, &rows)?;
        tx.commit()?;

        debug!(batch_id, model_id, removed, written = rows.len(), "model scores recomputed");
        Ok(rows.len())
    }

    /// Delete every row of the batch. Returns the number removed.
    pub fn clear_for_batch(&self, batch_id: i64) -> Result<usize, AggregationError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM model_batch_scores WHERE batch_id = ?1",
            params![batch_id],
        )?;
        info!(batch_id, removed, "cleared batch scores");
        Ok(removed)
    }

    pub fn rank_models_in_batch(
        &self,
        batch_id: i64,
        score_type: Option<&str>,
    ) -> Result<Vec<ModelRanking>, AggregationError> {
        let conn = self.pool.get()?;
        query::rank_models_in_batch(&conn, batch_id, score_type)
    }

    pub fn model_score_details(
        &self,
        batch_id: i64,
        model_id: i64,
    ) -> Result<ModelScoreDetails, AggregationError> {
        let conn = self.pool.get()?;
        query::model_score_details(&conn, batch_id, model_id)
    }
}

/// Run the four views in order; a later view's row wins on a shared key.
fn collect_rows(
    conn: &Connection,
    batch_id: i64,
    model_id: i64,
) -> Result<Vec<AggregateRow>, AggregationError> {
    let mut rows = ViewRows::default();

    let all = answers::for_model(conn, batch_id, model_id, AnswerScope::All)?;
    if all.is_empty() {
        debug!(batch_id, model_id, "no answers, overall view skipped");
        return Ok(Vec::new());
    }
    let all_ids: Vec<i64> = all.iter().map(|a| a.id).collect();
    let records = evaluations::successful_for_answers(conn, &all_ids, &RecordFilter::default())?;
    if records.is_empty() {
        debug!(batch_id, model_id, "no successful evaluations, overall view skipped");
    } else {
        rows.extend(views::overall_view(&records));
    }

    let objective = answers::for_model(conn, batch_id, model_id, AnswerScope::Objective)?;
    if objective.is_empty() {
        debug!(batch_id, model_id, "no objective answers");
    } else {
        let ids: Vec<i64> = objective.iter().map(|a| a.id).collect();
        let records = evaluations::successful_for_answers(conn, &ids, &RecordFilter::default())?;
        rows.extend(views::objective_view(&records));
    }

    let subjective = answers::for_model(conn, batch_id, model_id, AnswerScope::Subjective)?;
    if subjective.is_empty() {
        debug!(batch_id, model_id, "no subjective answers");
    } else {
        let ids: Vec<i64> = subjective.iter().map(|a| a.id).collect();
        let records = evaluations::successful_for_answers(conn, &ids, &RecordFilter::default())?;
        rows.extend(views::subjective_view(subjective.len(), &records));
    }

    for score_type in evaluations::score_types_for_answers(conn, &all_ids)? {
        if !views::is_dimension(&score_type) {
            continue;
        }
        let filter = RecordFilter {
            score_type: Some(&score_type),
            ..RecordFilter::default()
        };
        let records = evaluations::successful_for_answers(conn, &all_ids, &filter)?;
        rows.extend(views::dimension_view(&score_type, &records));
    }

    Ok(rows.into_rows())
}

fn insert_rows(
    conn: &Connection,
    batch_id: i64,
    model_id: i64,
    rows: &[AggregateRow],
) -> Result<(), AggregationError> {
    let calculated_at = to_db_time(Utc::now());
    let mut stmt = conn.prepare(
        "INSERT INTO model_batch_scores
            (batch_id, model_id, evaluator_id, score_type, repeat_index, average_score,
             total_answers, scored_answers, max_score, min_score, calculated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for row in rows {
        stmt.execute(params![
            batch_id,
            model_id,
            row.key.evaluator_id,
            row.key.score_type,
            row.key.repeat_index,
            row.average_score,
            row.total_answers,
            row.scored_answers,
            row.max_score,
            row.min_score,
            calculated_at,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::{FOLDED_REPEAT, OBJECTIVE, OVERALL};
    use crate::storage::answers::{NewAnswer, QuestionType};
    use crate::storage::evaluations::{EvaluationStatus, NewEvaluation};
    use crate::storage::open_pool;

    fn setup() -> (tempfile::TempDir, ScoreAggregator, i64, i64, i64) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("scores.db").to_str().unwrap()).unwrap();
        let conn = pool.get().unwrap();
        let batch = catalog::insert_batch(&conn, "batch", None).unwrap();
        let model = catalog::insert_model(&conn, "model", Some("acme"), None).unwrap();
        let evaluator = catalog::insert_evaluator(&conn, "judge").unwrap();
        drop(conn);
        (dir, ScoreAggregator::new(pool, FailurePolicy::Abort), batch, model, evaluator)
    }

    fn score(conn: &Connection, answer_id: i64, evaluator: i64, score_type: &str, value: f64) {
        evaluations::insert(
            conn,
            &NewEvaluation {
                answer_id,
                evaluator_id: Some(evaluator),
                score_type: Some(score_type.to_string()),
                raw_score: Some(value * 10.0),
                normalized_score: Some(value),
                status: EvaluationStatus::Success,
            },
        )
        .unwrap();
    }

    type StoredRow = (Option<i64>, String, i32, f64, i64);

    fn stored(agg: &ScoreAggregator, batch: i64, model: i64) -> Vec<StoredRow> {
        let conn = agg.get_pool().get().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT evaluator_id, score_type, repeat_index, average_score, total_answers
                 FROM model_batch_scores WHERE batch_id = ?1 AND model_id = ?2
                 ORDER BY score_type, evaluator_id, repeat_index",
            )
            .unwrap();
        let rows = stmt
            .query_map(params![batch, model], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    #[test]
    fn test_objective_rows_and_idempotent_recompute() {
        let (_dir, agg, batch, model, judge) = setup();
        {
            let conn = agg.get_pool().get().unwrap();
            let questions = [
                (1, QuestionType::SingleChoice, 1.0),
                (2, QuestionType::MultipleChoice, 0.0),
            ];
            for (q, qt, value) in questions {
                let a = answers::insert(
                    &conn,
                    &NewAnswer {
                        batch_id: batch,
                        model_id: model,
                        question_id: q,
                        question_type: qt,
                        repeat_index: 0,
                    },
                )
                .unwrap();
                score(&conn, a, judge, OVERALL, value);
            }
        }

        let first = agg.compute_for_model(batch, model).unwrap();
        let before = stored(&agg, batch, model);
        let second = agg.compute_for_model(batch, model).unwrap();
        assert_eq!(first, second);
        assert_eq!(before, stored(&agg, batch, model));

        let objective: Vec<_> = before.iter().filter(|r| r.1 == OBJECTIVE).collect();
        assert_eq!(objective.len(), 2);
        assert!(objective
            .iter()
            .any(|r| r.2 == FOLDED_REPEAT && (r.3 - 0.5).abs() < 1e-12 && r.4 == 2));
    }

    #[test]
    fn test_missing_batch_or_model_is_not_found() {
        let (_dir, agg, batch, _model, _) = setup();
        let err = agg.compute_for_model(batch, 4242).unwrap_err();
        assert!(err.is_not_found());
        assert!(agg.compute_for_batch(999).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_batch_yields_empty_summary() {
        let (_dir, agg, batch, _, _) = setup();
        assert_eq!(agg.compute_for_batch(batch).unwrap(), BatchSummary::default());
    }

    #[test]
    fn test_clear_for_batch_counts_rows() {
        let (_dir, agg, batch, model, judge) = setup();
        {
            let conn = agg.get_pool().get().unwrap();
            let a = answers::insert(
                &conn,
                &NewAnswer {
                    batch_id: batch,
                    model_id: model,
                    question_id: 1,
                    question_type: QuestionType::SimpleFact,
                    repeat_index: 0,
                },
            )
            .unwrap();
            score(&conn, a, judge, OVERALL, 0.5);
        }
        let written = agg.compute_for_model(batch, model).unwrap();
        assert!(written > 0);
        assert_eq!(agg.clear_for_batch(batch).unwrap(), written);
        assert_eq!(agg.clear_for_batch(batch).unwrap(), 0);
    }
}
