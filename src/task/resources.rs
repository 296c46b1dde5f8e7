//! Shared environment for all nodes of one request: seed values, lazily
//! built connectors, the cache handle, and the log sink.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::audit::{ExecutionLogEntry, ExecutionLogSink, ExecutionLogStatus};
use crate::cache::{request_prefix, result_key, ResultCache};
use crate::connectors::{build_connector, ConnectionConfig, Connector};
use crate::core::errors::{EngineError, Result};
use crate::core::value::{rows_from_value, rows_to_value, Row};
use crate::graph::config::CollectionAddress;
use crate::graph::traversal::SeedSnapshot;
use crate::policy::{ActionType, Policy};

pub struct TaskResources {
    pub request_id: String,
    pub policy: Policy,
    pub seeds: SeedSnapshot,
    connection_configs: HashMap<String, ConnectionConfig>,
    /// Connectors built on first use, reused for the rest of the request.
    connectors: DashMap<String, Arc<Connector>>,
    pub cache: Arc<dyn ResultCache>,
    pub log: Arc<dyn ExecutionLogSink>,
}

impl TaskResources {
    pub fn new(
        request_id: String,
        policy: Policy,
        seeds: SeedSnapshot,
        connections: Vec<ConnectionConfig>,
        cache: Arc<dyn ResultCache>,
        log: Arc<dyn ExecutionLogSink>,
    ) -> Self {
        Self {
            request_id,
            policy,
            seeds,
            connection_configs: connections.into_iter().map(|c| (c.key.clone(), c)).collect(),
            connectors: DashMap::new(),
            cache,
            log,
        }
    }

    /// Returns the connector for a connection key, building it on first
    /// use. An unknown key is a request-level error, not a store failure.
    pub fn connector(&self, key: &str) -> Result<Arc<Connector>> {
        if let Some(connector) = self.connectors.get(key) {
            return Ok(Arc::clone(&connector));
        }
        let config = self
            .connection_configs
            .get(key)
            .ok_or_else(|| EngineError::ConnectorNotFound { key: key.to_string() })?;
        let connector = Arc::new(build_connector(config)?);
        self.connectors.insert(key.to_string(), Arc::clone(&connector));
        Ok(connector)
    }

    /// Appends an audit entry. Log writes are independent of node success;
    /// a failed append is reported but never fails the node.
    pub async fn write_log(
        &self,
        address: &CollectionAddress,
        action_type: ActionType,
        status: ExecutionLogStatus,
        fields_affected: Vec<String>,
        message: Option<String>,
    ) {
        let mut entry = ExecutionLogEntry::new(&self.request_id, address, action_type, status)
            .with_fields(fields_affected);
        if let Some(message) = message {
            entry = entry.with_message(message);
        }
        if let Err(error) = self.log.append(entry).await {
            warn!(%address, %error, "execution log append failed");
        }
    }

    pub async fn cache_rows(
        &self,
        action: ActionType,
        address: &CollectionAddress,
        rows: &[Row],
        ttl: Duration,
    ) -> Result<()> {
        let key = result_key(&self.request_id, action, address);
        self.cache.set(&key, rows_to_value(rows), ttl).await
    }

    pub async fn cached_rows(
        &self,
        action: ActionType,
        address: &CollectionAddress,
    ) -> Result<Option<Vec<Row>>> {
        let key = result_key(&self.request_id, action, address);
        Ok(self.cache.get(&key).await?.map(|value| rows_from_value(&value)))
    }

    /// Every cached access result for this request, keyed by address.
    pub async fn all_cached_results(&self) -> Result<BTreeMap<CollectionAddress, Vec<Row>>> {
        all_cached_results(self.cache.as_ref(), &self.request_id).await
    }
}

/// Reads back the per-node access results for a request. Usable without a
/// live [`TaskResources`], e.g. by report assembly after completion.
pub async fn all_cached_results(
    cache: &dyn ResultCache,
    request_id: &str,
) -> Result<BTreeMap<CollectionAddress, Vec<Row>>> {
    let prefix = request_prefix(request_id);
    let access_marker = format!("__{}__", ActionType::Access);
    let mut results = BTreeMap::new();
    for (key, value) in cache.get_by_prefix(&prefix).await? {
        let Some(position) = key.find(&access_marker) else {
            continue;
        };
        let address_part = &key[position + access_marker.len()..];
        let Some((dataset, collection)) = address_part.split_once(':') else {
            continue;
        };
        results.insert(
            CollectionAddress::new(dataset, collection),
            rows_from_value(&value),
        );
    }
    Ok(results)
}
