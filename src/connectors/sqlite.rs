//! SQLite backend. Compiles to `?`-parameterized SQL through the shared
//! query compiler.

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::connectors::query::{
    render_select, render_update, MaskUpdate, ReadQuery, SqlDialect, SqlQuery,
};
use crate::connectors::secrets::SqliteSecrets;
use crate::connectors::{ConnectorError, ConnectorFailure, InputData};
use crate::core::value::{FieldValue, Row};
use crate::graph::dataset_graph::Node;
use crate::policy::Policy;

#[derive(Debug)]
pub struct SqliteConnector {
    key: String,
    secrets: SqliteSecrets,
}

impl SqliteConnector {
    pub(crate) fn new(key: &str, secrets: SqliteSecrets) -> Self {
        Self {
            key: key.to_string(),
            secrets,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn pool(&self) -> Result<SqlitePool, ConnectorError> {
        SqlitePoolOptions::new()
            .max_connections(1)
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
        let sql = render_select(&node.address.collection, &read, SqlDialect::Sqlite);

        let pool = self.pool().await?;
        let fetched = bind_params(sqlx::query(&sql.text), &sql).fetch_all(&pool).await;
        pool.close().await;

        let db_rows =
            fetched.map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Retrieve, e))?;
        let mut rows = Vec::with_capacity(db_rows.len());
        for db_row in &db_rows {
            rows.push(decode_row(&self.key, db_row)?);
        }
        info!(node = %node.address, count = rows.len(), "sqlite retrieval finished");
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
            let sql = render_update(&node.address.collection, &update, SqlDialect::Sqlite);
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
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    sql: &SqlQuery,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
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

fn decode_row(key: &str, db_row: &SqliteRow) -> Result<Row, ConnectorError> {
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
                "TEXT" | "DATETIME" | "DATE" | "TIME" => db_row
                    .try_get::<String, _>(i)
                    .map(FieldValue::String)
                    .unwrap_or(FieldValue::Null),
                "INTEGER" | "NUMERIC" => db_row
                    .try_get::<i64, _>(i)
                    .map(FieldValue::Int)
                    .unwrap_or(FieldValue::Null),
                "REAL" => db_row
                    .try_get::<f64, _>(i)
                    .map(FieldValue::Float)
                    .unwrap_or(FieldValue::Null),
                "BOOLEAN" => db_row
                    .try_get::<bool, _>(i)
                    .map(FieldValue::Bool)
                    .unwrap_or(FieldValue::Null),
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
