//! SQLite storage layer -- pool, schema, and the answer/evaluation record stores.

pub mod answers;
pub mod catalog;
pub mod evaluations;
pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::Row;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Upper bound on bound parameters per `IN (...)` list.
pub(crate) const MAX_IN_PARAMS: usize = 500;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).context("failed to build connection pool")?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Render a timestamp in the fixed-width form every table stores.
///
/// Microsecond precision with a literal `Z` keeps lexical order equal to
/// chronological order, so range filters can compare the text directly.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Read a non-null timestamp column.
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw, idx)
}

/// Read a nullable timestamp column.
pub(crate) fn opt_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_db_time(&s, idx)).transpose()
}

fn parse_db_time(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// `?, ?, ?` for an `IN (...)` clause of `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_time_orders_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(to_db_time(early) < to_db_time(late));
        assert_eq!(to_db_time(late), "2026-01-10T00:00:00.000000Z");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_open_pool_creates_parent_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("evalboard.db");
        let pool = open_pool(path.to_str().unwrap())?;
        let conn = pool.get()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM evaluation_runs", [], |row| row.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }
}
