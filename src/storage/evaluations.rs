//! Evaluation record store: per-answer scores written by evaluators.
//!
//! Records are immutable once written. A re-evaluation inserts a new
//! record; the old one is soft-deleted by the evaluation workflow.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use super::{placeholders, to_db_time, MAX_IN_PARAMS};

/// Outcome of a single evaluation attempt. Only `Success` is aggregable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    Pending,
    Success,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "PENDING",
            EvaluationStatus::Success => "SUCCESS",
            EvaluationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful, aggregable score joined with its answer's repeat index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub evaluation_id: i64,
    pub answer_id: i64,
    pub evaluator_id: Option<i64>,
    pub score_type: Option<String>,
    pub normalized_score: f64,
    pub repeat_index: i32,
}

#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub answer_id: i64,
    pub evaluator_id: Option<i64>,
    pub score_type: Option<String>,
    pub raw_score: Option<f64>,
    pub normalized_score: Option<f64>,
    pub status: EvaluationStatus,
}

/// Optional narrowing of [`successful_for_answers`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter<'a> {
    pub evaluator_id: Option<i64>,
    pub score_type: Option<&'a str>,
}

pub fn insert(conn: &Connection, evaluation: &NewEvaluation) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO evaluations
            (llm_answer_id, evaluator_id, score_type, raw_score, normalized_score,
             evaluation_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            evaluation.answer_id,
            evaluation.evaluator_id,
            evaluation.score_type,
            evaluation.raw_score,
            evaluation.normalized_score,
            evaluation.status.as_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn soft_delete(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE evaluations SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![to_db_time(at), id],
    )?;
    Ok(changed == 1)
}

/// Successful, live records with a normalized score for the given answers,
/// ordered by evaluation id.
pub fn successful_for_answers(
    conn: &Connection,
    answer_ids: &[i64],
    filter: &RecordFilter<'_>,
) -> rusqlite::Result<Vec<ScoreRecord>> {
    let mut records = Vec::new();

    for chunk in answer_ids.chunks(MAX_IN_PARAMS) {
        let mut sql = format!(
            "SELECT e.id, e.llm_answer_id, e.evaluator_id, e.score_type, e.normalized_score,
                    la.repeat_index
             FROM evaluations e
             JOIN llm_answers la ON e.llm_answer_id = la.id
             WHERE e.llm_answer_id IN ({})
             AND e.evaluation_status = 'SUCCESS'
             AND e.normalized_score IS NOT NULL
             AND e.deleted_at IS NULL",
            placeholders(chunk.len())
        );

        let mut bound: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
        if let Some(evaluator_id) = filter.evaluator_id.as_ref() {
            sql.push_str(" AND e.evaluator_id = ?");
            bound.push(evaluator_id);
        }
        if let Some(score_type) = filter.score_type.as_ref() {
            sql.push_str(" AND e.score_type = ?");
            bound.push(score_type);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            Ok(ScoreRecord {
                evaluation_id: row.get(0)?,
                answer_id: row.get(1)?,
                evaluator_id: row.get(2)?,
                score_type: row.get(3)?,
                normalized_score: row.get(4)?,
                repeat_index: row.get(5)?,
            })
        })?;
        for r in rows {
            records.push(r?);
        }
    }

    records.sort_by_key(|r| r.evaluation_id);
    Ok(records)
}

/// Distinct non-null score types among the successful records of the answers.
pub fn score_types_for_answers(
    conn: &Connection,
    answer_ids: &[i64],
) -> rusqlite::Result<Vec<String>> {
    let mut types = std::collections::BTreeSet::new();

    for chunk in answer_ids.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT DISTINCT score_type FROM evaluations
             WHERE llm_answer_id IN ({})
             AND score_type IS NOT NULL
             AND evaluation_status = 'SUCCESS'
             AND deleted_at IS NULL",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
        for r in rows {
            types.insert(r?);
        }
    }

    Ok(types.into_iter().collect())
}
