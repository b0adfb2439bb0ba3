//! Backend-neutral SQL plumbing
//!
//! ```text
//! Store ──→ &mut dyn Executor ──┬──→ SqliteExecutor   (rusqlite, `?` params)
//!                               └──→ PgExecutor       (postgres, `$n` params)
//! ```
//!
//! Store code writes SQL once with `?` placeholders and the portable subset of
//! syntax both engines share (`ON CONFLICT … DO UPDATE`, `RETURNING`). The
//! few places where the engines differ go through [`Dialect`].

use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::model::json;

// ─────────────────────────────────────────────────────────────────────────────
// Values and rows
// ─────────────────────────────────────────────────────────────────────────────

/// A single parameter or column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Text(json::format_ts(&v))
    }
}

impl From<&DateTime<Utc>> for SqlValue {
    fn from(v: &DateTime<Utc>) -> Self {
        SqlValue::Text(json::format_ts(v))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl<T: Clone + Into<SqlValue>> From<&Option<T>> for SqlValue {
    fn from(v: &Option<T>) -> Self {
        v.clone().map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row, addressed by column name
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

static NULL: SqlValue = SqlValue::Null;

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> &SqlValue {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NULL)
    }

    /// Columns named `<prefix><name>`, renamed to `<name>`. Used to split
    /// the two halves of a join.
    pub fn prefixed(&self, prefix: &str) -> Row {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (c, v) in self.columns.iter().zip(&self.values) {
            if let Some(stripped) = c.strip_prefix(prefix) {
                columns.push(stripped.to_string());
                values.push(v.clone());
            }
        }
        Row::new(columns.into(), values)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        match self.get(column) {
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Null => None,
        }
    }

    pub fn string(&self, column: &str) -> String {
        self.text(column).unwrap_or_default()
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(f) => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn real(&self, column: &str) -> Option<f64> {
        match self.get(column) {
            SqlValue::Real(f) => Some(*f),
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn flag(&self, column: &str) -> bool {
        self.int(column).is_some_and(|v| v != 0)
    }

    pub fn ts(&self, column: &str) -> Option<DateTime<Utc>> {
        self.text(column).and_then(|s| json::parse_ts(&s))
    }

    /// Timestamp column that must be present; unparseable values read as epoch
    pub fn ts_or_epoch(&self, column: &str) -> DateTime<Utc> {
        self.ts(column).unwrap_or_default()
    }

    /// JSON container column; undecodable text yields the empty container
    pub fn json<T: DeserializeOwned + Default>(&self, column: &str) -> T {
        json::decode_or_default(self.text(column).as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dialect
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Rewrite `?` placeholders into `$1, $2, …`. Quoted literals are left alone.
    pub fn placeholders<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if *self == Dialect::Sqlite || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }
        let mut out = String::with_capacity(sql.len() + 16);
        let mut n = 0;
        let mut in_quote = false;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_quote = !in_quote;
                    out.push(ch);
                }
                '?' if !in_quote => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(ch),
            }
        }
        Cow::Owned(out)
    }

    /// Expand type tokens in a DDL template: `{serial_pk}`, `{int}`, `{real}`
    pub fn ddl(&self, template: &str) -> String {
        let (serial, int, real) = match self {
            Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER", "REAL"),
            Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "BIGINT", "DOUBLE PRECISION"),
        };
        template
            .replace("{serial_pk}", serial)
            .replace("{int}", int)
            .replace("{real}", real)
    }

    /// Insert that silently keeps an existing row with the same key
    pub fn insert_ignore(&self, table: &str, key: &str, columns: &[&str]) -> String {
        let cols = columns.join(", ");
        let marks = vec!["?"; columns.len()].join(", ");
        match self {
            Dialect::Sqlite => format!("INSERT OR IGNORE INTO {table} ({cols}) VALUES ({marks})"),
            Dialect::Postgres => format!(
                "INSERT INTO {table} ({cols}) VALUES ({marks}) ON CONFLICT ({key}) DO NOTHING"
            ),
        }
    }

    /// Query returning one row with a `present` column when `table.column` exists
    pub fn column_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT COUNT(*) AS present FROM pragma_table_info(?) WHERE name = ?"
            }
            Dialect::Postgres => {
                "SELECT COUNT(*) AS present FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = ? AND column_name = ?"
            }
        }
    }

    /// Statement to run after rows were written with explicit serial ids
    pub fn resync_serial(&self, table: &str, key: &str) -> Option<String> {
        match self {
            Dialect::Sqlite => None,
            Dialect::Postgres => Some(format!(
                "SELECT setval(pg_get_serial_sequence('{table}', '{key}'), \
                 GREATEST((SELECT COALESCE(MAX({key}), 0) FROM {table}), 1))"
            )),
        }
    }
}

/// Upsert that overwrites every non-key column. `overrides` replaces the
/// update expression for selected columns.
pub fn upsert_sql(table: &str, key: &str, columns: &[&str], overrides: &[(&str, &str)]) -> String {
    let cols = columns.join(", ");
    let marks = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != key)
        .map(|c| match overrides.iter().find(|(name, _)| name == c) {
            Some((_, expr)) => format!("{c} = {expr}"),
            None => format!("{c} = excluded.{c}"),
        })
        .collect();
    format!(
        "INSERT INTO {table} ({cols}) VALUES ({marks}) ON CONFLICT ({key}) DO UPDATE SET {}",
        updates.join(", ")
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// A connection or open transaction on either backend
pub trait Executor {
    fn dialect(&self) -> Dialect;

    /// Run a statement and return the number of affected rows
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run several parameterless statements separated by `;`
    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    fn query_one(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_postgres() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?";
        assert_eq!(
            Dialect::Postgres.placeholders(sql),
            "SELECT * FROM t WHERE a = $1 AND b = '?' AND c = $2"
        );
        assert_eq!(Dialect::Sqlite.placeholders(sql), sql);
    }

    #[test]
    fn test_ddl_tokens() {
        let t = "CREATE TABLE x (id {serial_pk}, n {int}, r {real})";
        assert_eq!(
            Dialect::Postgres.ddl(t),
            "CREATE TABLE x (id BIGSERIAL PRIMARY KEY, n BIGINT, r DOUBLE PRECISION)"
        );
        assert!(Dialect::Sqlite.ddl(t).contains("AUTOINCREMENT"));
    }

    #[test]
    fn test_upsert_sql_overrides() {
        let sql = upsert_sql(
            "prompts",
            "id",
            &["id", "text", "status"],
            &[("status", "CASE WHEN prompts.status = 'linked' THEN prompts.status ELSE excluded.status END")],
        );
        assert!(sql.starts_with("INSERT INTO prompts (id, text, status) VALUES (?, ?, ?)"));
        assert!(sql.contains("text = excluded.text"));
        assert!(sql.contains("status = CASE WHEN"));
        assert!(!sql.contains("id = excluded.id"));
    }

    #[test]
    fn test_insert_ignore_per_dialect() {
        let s = Dialect::Sqlite.insert_ignore("entries", "id", &["id", "notes"]);
        assert_eq!(s, "INSERT OR IGNORE INTO entries (id, notes) VALUES (?, ?)");
        let p = Dialect::Postgres.insert_ignore("entries", "id", &["id", "notes"]);
        assert!(p.ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn test_row_accessors_and_prefix() {
        let row = Row::new(
            vec!["id".to_string(), "p_id".to_string(), "p_text".to_string()].into(),
            vec![
                SqlValue::Text("e1".into()),
                SqlValue::Integer(3),
                SqlValue::Text("hello".into()),
            ],
        );
        assert_eq!(row.string("id"), "e1");
        assert_eq!(row.int("p_id"), Some(3));
        let p = row.prefixed("p_");
        assert_eq!(p.int("id"), Some(3));
        assert_eq!(p.string("text"), "hello");
        assert_eq!(row.get("missing"), &SqlValue::Null);
    }
}
