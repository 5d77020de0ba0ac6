//! Answer store: which answers a model produced in a batch, and of what kind.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use super::{opt_time_column, placeholders, to_db_time};

/// Question type of the standard question an answer responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    SimpleFact,
    Subjective,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "SINGLE_CHOICE",
            QuestionType::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionType::SimpleFact => "SIMPLE_FACT",
            QuestionType::Subjective => "SUBJECTIVE",
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SINGLE_CHOICE" => Ok(QuestionType::SingleChoice),
            "MULTIPLE_CHOICE" => Ok(QuestionType::MultipleChoice),
            "SIMPLE_FACT" => Ok(QuestionType::SimpleFact),
            "SUBJECTIVE" => Ok(QuestionType::Subjective),
            other => Err(format!("unknown question type '{other}'")),
        }
    }
}

impl ToSql for QuestionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for QuestionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Which slice of a model's answers a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerScope {
    All,
    /// Single and multiple choice questions.
    Objective,
    /// Subjective and simple-fact questions.
    Subjective,
}

impl AnswerScope {
    fn question_types(&self) -> &'static [QuestionType] {
        match self {
            AnswerScope::All => &[],
            AnswerScope::Objective => &[QuestionType::SingleChoice, QuestionType::MultipleChoice],
            AnswerScope::Subjective => &[QuestionType::Subjective, QuestionType::SimpleFact],
        }
    }
}

/// One generated answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub id: i64,
    pub batch_id: i64,
    pub model_id: i64,
    pub question_id: i64,
    pub question_type: QuestionType,
    pub repeat_index: i32,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields the generation workflow supplies when it stores an answer.
#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub batch_id: i64,
    pub model_id: i64,
    pub question_id: i64,
    pub question_type: QuestionType,
    pub repeat_index: i32,
}

pub fn insert(conn: &Connection, answer: &NewAnswer) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO llm_answers (batch_id, model_id, question_id, question_type, repeat_index)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            answer.batch_id,
            answer.model_id,
            answer.question_id,
            answer.question_type,
            answer.repeat_index
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Soft-delete an answer so it stops counting toward aggregates.
pub fn soft_delete(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE llm_answers SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![to_db_time(at), id],
    )?;
    Ok(changed == 1)
}

/// Every live model that produced at least one live answer in the batch.
pub fn models_in_batch(conn: &Connection, batch_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT la.model_id FROM llm_answers la
         JOIN models m ON m.id = la.model_id
         WHERE la.batch_id = ?1 AND la.deleted_at IS NULL AND m.deleted_at IS NULL
         ORDER BY la.model_id",
    )?;
    let rows = stmt.query_map(params![batch_id], |row| row.get::<_, i64>(0))?;
    rows.collect()
}

/// Live answers of one model in one batch, restricted to `scope`.
pub fn for_model(
    conn: &Connection,
    batch_id: i64,
    model_id: i64,
    scope: AnswerScope,
) -> rusqlite::Result<Vec<Answer>> {
    let types = scope.question_types();
    let mut sql = String::from(
        "SELECT id, batch_id, model_id, question_id, question_type, repeat_index, deleted_at
         FROM llm_answers
         WHERE batch_id = ? AND model_id = ? AND deleted_at IS NULL",
    );
    if !types.is_empty() {
        sql.push_str(&format!(" AND question_type IN ({})", placeholders(types.len())));
    }
    sql.push_str(" ORDER BY id");

    let mut bound: Vec<&dyn ToSql> = vec![&batch_id, &model_id];
    bound.extend(types.iter().map(|t| t as &dyn ToSql));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bound), |row| {
        Ok(Answer {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            model_id: row.get(2)?,
            question_id: row.get(3)?,
            question_type: row.get(4)?,
            repeat_index: row.get(5)?,
            deleted_at: opt_time_column(row, 6)?,
        })
    })?;
    rows.collect()
}
