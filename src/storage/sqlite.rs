//! Embedded backend: SQLite through an r2d2 pool, WAL mode

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::Connection;

use super::driver::{Dialect, Executor, Row, SqlValue};
use super::PoolSettings;
use crate::error::Result;

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Open (creating if needed) the database file and build the pool
pub fn open_pool(path: &Path, settings: &PoolSettings) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Performance settings applied to every pooled connection
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            PRAGMA cache_size=-16000;
            "#,
        )
    });

    let pool = Pool::builder()
        .max_size(settings.max_size)
        .min_idle(Some(settings.min_idle))
        .connection_timeout(settings.connection_timeout)
        .idle_timeout(Some(settings.idle_timeout))
        .build(manager)?;

    tracing::debug!(path = %path.display(), "SQLite pool ready");
    Ok(pool)
}

pub struct SqliteExecutor<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteExecutor<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(b) | ValueRef::Blob(b) => {
            SqlValue::Text(String::from_utf8_lossy(b).into_owned())
        }
    }
}

impl Executor for SqliteExecutor<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let n = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        Ok(n as u64)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: std::sync::Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_ref(row.get_ref(i)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Size of the main database file, excluding the WAL
pub fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_roundtrip_values() {
        let conn = Connection::open_in_memory().unwrap();
        let mut ex = SqliteExecutor::new(&conn);
        ex.execute_batch("CREATE TABLE t (a TEXT, b INTEGER, c REAL, d TEXT)")
            .unwrap();
        let n = ex
            .execute(
                "INSERT INTO t VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::from("x"),
                    SqlValue::from(7i64),
                    SqlValue::from(1.5),
                    SqlValue::Null,
                ],
            )
            .unwrap();
        assert_eq!(n, 1);
        let row = ex.query_one("SELECT * FROM t", &[]).unwrap().unwrap();
        assert_eq!(row.string("a"), "x");
        assert_eq!(row.int("b"), Some(7));
        assert_eq!(row.real("c"), Some(1.5));
        assert_eq!(row.text("d"), None);
    }
}
