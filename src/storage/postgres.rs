//! Networked backend: PostgreSQL through an r2d2 pool
//!
//! Parameters are bound from [`SqlValue`] with a lenient `ToSql`: the server
//! infers each placeholder's type from the statement and the value is coerced
//! to it (an `Integer` bound to an `INT4` slot is narrowed, to a `TEXT` slot is
//! formatted). Integer columns are declared `BIGINT`, so narrowing only
//! happens for expressions the server types on its own.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::BytesMut;
use postgres::types::{IsNull, ToSql, Type};
use postgres::{GenericClient, NoTls};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use super::driver::{Dialect, Executor, Row, SqlValue};
use super::PoolSettings;
use crate::error::{Error, Result};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Build the pool from a `postgres://` URL. Must be called off the async runtime.
pub fn open_pool(url: &str, settings: &PoolSettings) -> Result<PgPool> {
    let config: postgres::Config = url
        .parse()
        .map_err(|e: postgres::Error| Error::InvalidInput(format!("DATABASE_URL: {}", e)))?;
    let manager = PostgresConnectionManager::new(config, NoTls);
    let pool = Pool::builder()
        .max_size(settings.max_size)
        .min_idle(Some(settings.min_idle))
        .connection_timeout(settings.connection_timeout)
        .idle_timeout(Some(settings.idle_timeout))
        .build(manager)?;
    tracing::debug!("PostgreSQL pool ready");
    Ok(pool)
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Integer(v) => {
                if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::BOOL {
                    (*v != 0).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Real(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    v.to_string().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Text(s) => s.as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    postgres::types::to_sql_checked!();
}

fn column_value(row: &postgres::Row, idx: usize) -> Result<SqlValue> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Integer)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Integer(v.into()))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Integer(v.into()))
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?
            .map(|v| SqlValue::Integer(v as i64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Real)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Real(v.into()))
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Executor over a pooled client or an open transaction
pub struct PgExecutor<'a, C: GenericClient> {
    client: &'a mut C,
}

impl<'a, C: GenericClient> PgExecutor<'a, C> {
    pub fn new(client: &'a mut C) -> Self {
        Self { client }
    }
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl<C: GenericClient> Executor for PgExecutor<'_, C> {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let sql = Dialect::Postgres.placeholders(sql);
        Ok(self.client.execute(sql.as_ref(), &bind(params))?)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let sql = Dialect::Postgres.placeholders(sql);
        let rows = self.client.query(sql.as_ref(), &bind(params))?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(column_value(row, idx)?);
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql)?;
        Ok(())
    }
}
