//! PostgreSQL backend. Same capability set as the other backends; compiles
//! to `$n`-parameterized SQL through the shared query compiler.

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row as _, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, info};

use crate::connectors::query::{
    render_select, render_update, MaskUpdate, ReadQuery, SqlDialect, SqlQuery,
};
use crate::connectors::secrets::PostgresSecrets;
use crate::connectors::{ConnectorError, ConnectorFailure, InputData};
use crate::core::value::{FieldValue, Row};
use crate::graph::dataset_graph::Node;
use crate::policy::Policy;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct PostgresConnector {
    key: String,
    secrets: PostgresSecrets,
}

impl PostgresConnector {
    pub(crate) fn new(key: &str, secrets: PostgresSecrets) -> Self {
        Self {
            key: key.to_string(),
            secrets,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn pool(&self) -> Result<PgPool, ConnectorError> {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&self.secrets.uri())
            .await
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Client, e))
    }

    pub async fn test_connection(&self) -> Result<(), ConnectorError> {
        let pool = self.pool().await?;
        let probe = sqlx::query("SELECT 1").execute(&pool).await;
        pool.close().await;
        probe.map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Liveness, e))?;
        Ok(())
    }

    pub async fn retrieve(
        &self,
        node: &Node,
        _policy: &Policy,
        input: &InputData,
    ) -> Result<Vec<Row>, ConnectorError> {
        let Some(read) = ReadQuery::build(node, input) else {
            debug!(node = %node.address, "no compilable query, returning empty result");
            return Ok(Vec::new());
        };
        let sql = render_select(&node.address.collection, &read, SqlDialect::Postgres);

        let pool = self.pool().await?;
        let fetched = bind_params(sqlx::query(&sql.text), &sql).fetch_all(&pool).await;
        pool.close().await;

        let db_rows =
            fetched.map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Retrieve, e))?;
        let mut rows = Vec::with_capacity(db_rows.len());
        for db_row in &db_rows {
            rows.push(decode_row(&self.key, db_row)?);
        }
        info!(node = %node.address, count = rows.len(), "postgres retrieval finished");
        Ok(rows)
    }

    pub async fn mask(
        &self,
        node: &Node,
        policy: &Policy,
        rows: &[Row],
    ) -> Result<u64, ConnectorError> {
        let pool = self.pool().await?;
        let mut mutated = 0u64;
        for row in rows {
            let Some(update) = MaskUpdate::build(node, row, policy) else {
                continue;
            };
            let sql = render_update(&node.address.collection, &update, SqlDialect::Postgres);
            match bind_params(sqlx::query(&sql.text), &sql).execute(&pool).await {
                Ok(done) => mutated += done.rows_affected(),
                Err(e) => {
                    pool.close().await;
                    return Err(ConnectorError::new(&self.key, ConnectorFailure::Mask, e));
                }
            }
        }
        pool.close().await;
        Ok(mutated)
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    sql: &SqlQuery,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in &sql.params {
        query = match param {
            FieldValue::Null => query.bind(Option::<String>::None),
            FieldValue::Bool(b) => query.bind(*b),
            FieldValue::Int(i) => query.bind(*i),
            FieldValue::Float(x) => query.bind(*x),
            FieldValue::String(s) => query.bind(s.clone()),
            other => query.bind(serde_json::Value::from(other.clone()).to_string()),
        };
    }
    query
}

fn decode_row(key: &str, db_row: &PgRow) -> Result<Row, ConnectorError> {
    let mut row = Row::new();
    for column in db_row.columns() {
        let i = column.ordinal();
        let raw = db_row
            .try_get_raw(i)
            .map_err(|e| ConnectorError::new(key, ConnectorFailure::Retrieve, e))?;
        let value = if raw.is_null() {
            FieldValue::Null
        } else {
            match raw.type_info().name() {
                "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => db_row
                    .try_get::<String, _>(i)
                    .map(FieldValue::String)
                    .unwrap_or(FieldValue::Null),
                "INT2" => db_row
                    .try_get::<i16, _>(i)
                    .map(|v| FieldValue::Int(v as i64))
                    .unwrap_or(FieldValue::Null),
                "INT4" => db_row
                    .try_get::<i32, _>(i)
                    .map(|v| FieldValue::Int(v as i64))
                    .unwrap_or(FieldValue::Null),
                "INT8" => db_row
                    .try_get::<i64, _>(i)
                    .map(FieldValue::Int)
                    .unwrap_or(FieldValue::Null),
                "FLOAT4" => db_row
                    .try_get::<f32, _>(i)
                    .map(|v| FieldValue::Float(v as f64))
                    .unwrap_or(FieldValue::Null),
                "FLOAT8" => db_row
                    .try_get::<f64, _>(i)
                    .map(FieldValue::Float)
                    .unwrap_or(FieldValue::Null),
                "BOOL" => db_row
                    .try_get::<bool, _>(i)
                    .map(FieldValue::Bool)
                    .unwrap_or(FieldValue::Null),
                // uuid, timestamps, numerics: fall back to their text form
                _ => db_row
                    .try_get::<String, _>(i)
                    .map(FieldValue::String)
                    .unwrap_or(FieldValue::Null),
            }
        };
        row.insert(column.name().to_string(), value);
    }
    Ok(row)
}
