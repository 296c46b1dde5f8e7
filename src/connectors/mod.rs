//! Store access behind one capability set.
//!
//! Supported backends form a closed set: [`build_connector`] is a pure
//! lookup on [`ConnectionKind`], and every backend failure is normalized to
//! [`ConnectorError`] so the executor's retry logic never inspects
//! backend-specific causes. Each operation owns its connection lifecycle
//! (acquire, operate, release); no pooling survives across calls.

pub mod mongo;
pub mod postgres;
pub mod query;
pub mod secrets;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::core::errors::Result;
use crate::core::value::{FieldValue, Row};
use crate::graph::dataset_graph::Node;
use crate::policy::Policy;

pub use mongo::MongoConnector;
pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;

/// Field name → candidate values gathered from seeds and upstream rows.
pub type InputData = BTreeMap<String, Vec<FieldValue>>;

/// Which capability failed; retry behavior does not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorFailure {
    Client,
    Liveness,
    Retrieve,
    Mask,
}

impl fmt::Display for ConnectorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectorFailure::Client => "client",
            ConnectorFailure::Liveness => "liveness",
            ConnectorFailure::Retrieve => "retrieve",
            ConnectorFailure::Mask => "mask",
        };
        write!(f, "{}", label)
    }
}

/// The single error kind every backend failure collapses into.
#[derive(Debug, Error)]
#[error("{failure} operation failed for connection '{key}': {message}")]
pub struct ConnectorError {
    pub key: String,
    pub failure: ConnectorFailure,
    pub message: String,
    /// Backend-specific cause, kept for diagnostics only; retry decisions
    /// never inspect it.
    pub cause: Option<anyhow::Error>,
}

impl ConnectorError {
    pub fn new<E>(key: &str, failure: ConnectorFailure, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            key: key.to_string(),
            failure,
            message: cause.to_string(),
            cause: Some(anyhow::Error::new(cause)),
        }
    }

    pub fn message<M: Into<String>>(key: &str, failure: ConnectorFailure, message: M) -> Self {
        Self {
            key: key.to_string(),
            failure,
            message: message.into(),
            cause: None,
        }
    }
}

/// Supported backend kinds. Relational kinds compile to parameterized SQL;
/// document kinds compile to filter + projection documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Postgres,
    Sqlite,
    Mongodb,
}

/// Declarative connection configuration handed over by the configuration
/// layer. Secrets stay an opaque document until validated by the selected
/// backend's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub key: String,
    pub kind: ConnectionKind,
    pub secrets: JsonValue,
}

/// One connected store. The executor only ever sees this type; the variant
/// decides how operations are compiled and executed.
#[derive(Debug)]
pub enum Connector {
    Postgres(PostgresConnector),
    Sqlite(SqliteConnector),
    Mongodb(MongoConnector),
}

/// Builds the connector for a configuration, validating its secrets
/// against the backend's schema first.
pub fn build_connector(config: &ConnectionConfig) -> Result<Connector> {
    let connector = match config.kind {
        ConnectionKind::Postgres => Connector::Postgres(PostgresConnector::new(
            &config.key,
            secrets::PostgresSecrets::parse(&config.key, &config.secrets)?,
        )),
        ConnectionKind::Sqlite => Connector::Sqlite(SqliteConnector::new(
            &config.key,
            secrets::SqliteSecrets::parse(&config.key, &config.secrets)?,
        )),
        ConnectionKind::Mongodb => Connector::Mongodb(MongoConnector::new(
            &config.key,
            secrets::MongoSecrets::parse(&config.key, &config.secrets)?,
        )),
    };
    Ok(connector)
}

impl Connector {
    pub fn key(&self) -> &str {
        match self {
            Connector::Postgres(c) => c.key(),
            Connector::Sqlite(c) => c.key(),
            Connector::Mongodb(c) => c.key(),
        }
    }

    /// Connects and runs a trivial probe against the store.
    pub async fn test_connection(&self) -> std::result::Result<(), ConnectorError> {
        match self {
            Connector::Postgres(c) => c.test_connection().await,
            Connector::Sqlite(c) => c.test_connection().await,
            Connector::Mongodb(c) => c.test_connection().await,
        }
    }

    /// Compiles and runs the node's read. An uncompilable query (no usable
    /// input) returns an empty row set.
    pub async fn retrieve(
        &self,
        node: &Node,
        policy: &Policy,
        input: &InputData,
    ) -> std::result::Result<Vec<Row>, ConnectorError> {
        match self {
            Connector::Postgres(c) => c.retrieve(node, policy, input).await,
            Connector::Sqlite(c) => c.retrieve(node, policy, input).await,
            Connector::Mongodb(c) => c.retrieve(node, policy, input).await,
        }
    }

    /// Applies the policy's masking to the given rows, returning how many
    /// records the store reported as mutated.
    pub async fn mask(
        &self,
        node: &Node,
        policy: &Policy,
        rows: &[Row],
    ) -> std::result::Result<u64, ConnectorError> {
        match self {
            Connector::Postgres(c) => c.mask(node, policy, rows).await,
            Connector::Sqlite(c) => c.mask(node, policy, rows).await,
            Connector::Mongodb(c) => c.mask(node, policy, rows).await,
        }
    }
}
