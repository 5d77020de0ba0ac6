//! Batches, models and evaluators referenced by answers and score rows.
//!
//! These tables belong to the surrounding CRUD system; only the handful of
//! operations the aggregation engine and its callers need live here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{opt_time_column, to_db_time};

/// An answer generation batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A registered LLM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub provider: Option<String>,
    pub version: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

pub fn insert_batch(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO batches (name, description) VALUES (?1, ?2)",
        params![name, description],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_model(
    conn: &Connection,
    name: &str,
    provider: Option<&str>,
    version: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO models (name, provider, version) VALUES (?1, ?2, ?3)",
        params![name, provider, version],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_evaluator(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.execute("INSERT INTO evaluators (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

/// Fetch a live (not soft-deleted) batch.
pub fn get_batch(conn: &Connection, id: i64) -> rusqlite::Result<Option<Batch>> {
    conn.query_row(
        "SELECT id, name, description, deleted_at FROM batches
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id],
        |row| {
            Ok(Batch {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                deleted_at: opt_time_column(row, 3)?,
            })
        },
    )
    .optional()
}

/// Fetch a live (not soft-deleted) model.
pub fn get_model(conn: &Connection, id: i64) -> rusqlite::Result<Option<Model>> {
    conn.query_row(
        "SELECT id, name, provider, version, deleted_at FROM models
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id],
        |row| {
            Ok(Model {
                id: row.get(0)?,
                name: row.get(1)?,
                provider: row.get(2)?,
                version: row.get(3)?,
                deleted_at: opt_time_column(row, 4)?,
            })
        },
    )
    .optional()
}

/// Soft-delete a batch. Returns false when it was already gone.
pub fn soft_delete_batch(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE batches SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![to_db_time(at), id],
    )?;
    Ok(changed == 1)
}

/// Soft-delete a model. Its answers stay but it drops out of batch discovery.
pub fn soft_delete_model(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE models SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![to_db_time(at), id],
    )?;
    Ok(changed == 1)
}
