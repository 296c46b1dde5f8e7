//! Drives one request's traversal: per-node retrieval and masking with
//! bounded retries, result caching, audit logging, and outcome events.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

use crate::audit::{ExecutionLogSink, ExecutionLogStatus};
use crate::cache::ResultCache;
use crate::connectors::{build_connector, ConnectionConfig, ConnectorError, InputData};
use crate::core::errors::{EngineError, Result};
use crate::core::value::{FieldValue, Row};
use crate::graph::config::{CollectionAddress, Dataset};
use crate::graph::dataset_graph::{DatasetGraph, Node};
use crate::graph::traversal::{SeedSnapshot, Traversal};
use crate::policy::{ActionType, Policy};
use crate::task::resources::{all_cached_results, TaskResources};

/// Pacing between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryStrategy {
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    Linear {
        delay_ms: u64,
    },
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Delay before the attempt following `attempt`. Exponential pacing adds
/// jitter so concurrent requests don't retry in lockstep.
fn retry_delay(strategy: &RetryStrategy, attempt: u32) -> Duration {
    let millis = match strategy {
        RetryStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } => {
            let raw = (*initial_delay_ms as f64
                * multiplier.powi(attempt.saturating_sub(1) as i32))
            .round() as u64;
            let capped = raw.min(*max_delay_ms);
            capped + fastrand::u64(0..=capped / 4)
        }
        RetryStrategy::Linear { delay_ms } => *delay_ms,
        RetryStrategy::Immediate => 0,
    };
    Duration::from_millis(millis)
}

/// Engine-wide execution behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Attempts per node operation before it is terminal.
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    /// Lifetime of cached node results.
    pub result_ttl_secs: u64,
    /// Bound on one request's total execution.
    pub deadline_secs: u64,
    /// Nodes of one readiness layer run concurrently up to this bound;
    /// 1 keeps strict planner order.
    pub max_parallel_nodes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_strategy: RetryStrategy::default(),
            result_ttl_secs: 600,
            deadline_secs: 3600,
            max_parallel_nodes: 1,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::validation("max_attempts must be greater than 0"));
        }
        if self.result_ttl_secs == 0 {
            return Err(EngineError::validation("result_ttl_secs must be greater than 0"));
        }
        if self.deadline_secs == 0 {
            return Err(EngineError::validation("deadline_secs must be greater than 0"));
        }
        if self.max_parallel_nodes == 0 {
            return Err(EngineError::validation("max_parallel_nodes must be greater than 0"));
        }
        if let RetryStrategy::Exponential { multiplier, .. } = &self.retry_strategy {
            if *multiplier < 1.0 {
                return Err(EngineError::validation("retry multiplier must be at least 1.0"));
            }
        }
        Ok(())
    }

    fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// Per-node result consumed by the control loop; retry and halt decisions
/// are made on this data, not on exceptions bubbling through the stack.
enum NodeRun<T> {
    Complete(T),
    Retryable(ConnectorError),
    Fatal(EngineError),
}

/// One privacy request as handed to [`Engine::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub policy: Policy,
    pub identity_values: BTreeMap<String, FieldValue>,
    pub datasets: Vec<Dataset>,
    pub connections: Vec<ConnectionConfig>,
}

impl ExecutionRequest {
    pub fn new(
        policy: Policy,
        identity_values: BTreeMap<String, FieldValue>,
        datasets: Vec<Dataset>,
        connections: Vec<ConnectionConfig>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            policy,
            identity_values,
            datasets,
            connections,
        }
    }

    pub fn with_request_id<I: Into<String>>(mut self, request_id: I) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Terminal state of one node, emitted on the event channel as the node
/// finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub address: CollectionAddress,
    pub status: ExecutionLogStatus,
    pub rows_retrieved: usize,
    pub records_masked: u64,
    pub attempts: u32,
    /// True when still-cached rows from an earlier run were reused.
    pub from_cache: bool,
    pub error: Option<String>,
}

/// Aggregate outcome of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub request_id: String,
    pub node_outcomes: Vec<NodeOutcome>,
    pub overall_success: bool,
    /// Why the request halted, when it did.
    pub error: Option<String>,
}

/// Result of a validation-only dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalDetails {
    pub traversable: bool,
    pub message: Option<String>,
}

/// The task executor. Holds the process-wide cache client and log sink;
/// everything request-scoped lives in a per-request [`TaskResources`].
pub struct Engine {
    cache: Arc<dyn ResultCache>,
    log: Arc<dyn ExecutionLogSink>,
    config: ExecutionConfig,
    event_tx: Option<mpsc::UnboundedSender<NodeOutcome>>,
    stopped: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        cache: Arc<dyn ResultCache>,
        log: Arc<dyn ExecutionLogSink>,
        config: ExecutionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache,
            log,
            config,
            event_tx: None,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers the channel per-node outcomes are streamed to.
    pub fn set_event_channel(&mut self, tx: mpsc::UnboundedSender<NodeOutcome>) {
        self.event_tx = Some(tx);
    }

    /// Handle for stopping execution; checked at node boundaries only, so
    /// an in-flight node attempt always runs to completion.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Checks that the datasets, bound to one connection, form a
    /// traversable graph. Pure dry run with null seed values: no store
    /// I/O, no log entries, no cache writes, safe to call repeatedly.
    pub fn validate(datasets: &[Dataset], connection_key: &str) -> TraversalDetails {
        let mut bound = datasets.to_vec();
        for dataset in &mut bound {
            dataset.connection_key = connection_key.to_string();
        }
        let outcome = DatasetGraph::new(bound).and_then(|graph| Traversal::dry_run(&graph));
        match outcome {
            Ok(_) => TraversalDetails {
                traversable: true,
                message: None,
            },
            Err(error) => TraversalDetails {
                traversable: false,
                message: Some(error.to_string()),
            },
        }
    }

    /// Builds the connector for a configuration and probes the store.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<()> {
        let connector = build_connector(config)?;
        connector.test_connection().await.map_err(|e| EngineError::Connection {
            key: config.key.clone(),
            message: e.to_string(),
            cause: Some(anyhow::Error::new(e)),
        })
    }

    /// Executes one request to completion or terminal failure. Setup
    /// failures (validation, graph construction, unreachable cache) are
    /// returned as errors before any side effect; node-level failures are
    /// recorded in the report and halt the remaining traversal.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        request.policy.validate()?;
        // No request may begin without a functioning cache: every
        // inter-node handoff depends on it.
        self.cache.ping().await?;

        let graph = DatasetGraph::new(request.datasets)?;
        let seeds: SeedSnapshot = request
            .identity_values
            .iter()
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        let traversal = Traversal::plan(&graph, &seeds)?;
        info!(
            request_id = %request.request_id,
            nodes = traversal.order.len(),
            layers = traversal.layers.len(),
            "traversal planned"
        );

        let resources = TaskResources::new(
            request.request_id.clone(),
            request.policy,
            seeds,
            request.connections,
            Arc::clone(&self.cache),
            Arc::clone(&self.log),
        );
        let deadline = Instant::now() + Duration::from_secs(self.config.deadline_secs);

        let mut report = ExecutionReport {
            request_id: request.request_id.clone(),
            node_outcomes: Vec::with_capacity(traversal.order.len()),
            overall_success: true,
            error: None,
        };

        for layer in &traversal.layers {
            let concurrency = self.config.max_parallel_nodes;
            let outcomes: Vec<NodeOutcome> = stream::iter(
                layer
                    .iter()
                    .map(|address| self.run_node(&resources, &graph, address, deadline)),
            )
            .buffered(concurrency)
            .collect()
            .await;

            for outcome in outcomes {
                if let Some(tx) = &self.event_tx {
                    let _ = tx.send(outcome.clone());
                }
                if outcome.status == ExecutionLogStatus::Error {
                    report.overall_success = false;
                    if report.error.is_none() {
                        report.error = outcome.error.clone();
                    }
                }
                report.node_outcomes.push(outcome);
            }
            if !report.overall_success {
                error!(
                    request_id = %report.request_id,
                    error = report.error.as_deref().unwrap_or_default(),
                    "request halted"
                );
                break;
            }
        }
        Ok(report)
    }

    /// Reads back every cached per-node result for a request, keyed by
    /// address, for downstream report assembly.
    pub async fn export_results(
        &self,
        request_id: &str,
    ) -> Result<BTreeMap<CollectionAddress, Vec<Row>>> {
        all_cached_results(self.cache.as_ref(), request_id).await
    }

    async fn run_node(
        &self,
        resources: &TaskResources,
        graph: &DatasetGraph,
        address: &CollectionAddress,
        deadline: Instant,
    ) -> NodeOutcome {
        let Some(node) = graph.node(address) else {
            return failed_outcome(address, 0, format!("node {} missing from graph", address));
        };
        if self.stopped.load(Ordering::SeqCst) {
            return failed_outcome(address, 0, EngineError::Cancelled.to_string());
        }
        if Instant::now() >= deadline {
            let error = EngineError::DeadlineExceeded {
                node: address.clone(),
                limit_secs: self.config.deadline_secs,
            };
            return failed_outcome(address, 0, error.to_string());
        }

        resources
            .write_log(address, ActionType::Access, ExecutionLogStatus::Started, vec![], None)
            .await;

        let input = match self.gather_input(resources, node).await {
            Ok(input) => input,
            Err(error) => return self.terminal_failure(resources, node, 0, error).await,
        };

        // Reuse still-cached rows from an earlier run of this request
        // instead of re-querying the store.
        let mut from_cache = false;
        let mut attempts = 0u32;
        let rows = match resources.cached_rows(ActionType::Access, address).await {
            Ok(Some(cached)) => {
                from_cache = true;
                cached
            }
            Ok(None) => {
                match self.retrieve_with_retries(resources, node, &input, &mut attempts).await {
                    Ok(rows) => rows,
                    Err(error) => {
                        return self.terminal_failure(resources, node, attempts, error).await
                    }
                }
            }
            Err(error) => return self.terminal_failure(resources, node, 0, error).await,
        };

        if !from_cache {
            if let Err(error) = resources
                .cache_rows(ActionType::Access, address, &rows, self.config.result_ttl())
                .await
            {
                return self.terminal_failure(resources, node, attempts, error).await;
            }
        }

        let fields_affected = if rows.is_empty() {
            Vec::new()
        } else {
            node.collection.field_names()
        };
        let message = if from_cache {
            format!("reused {} cached rows", rows.len())
        } else {
            format!("{} rows retrieved", rows.len())
        };
        resources
            .write_log(
                address,
                ActionType::Access,
                ExecutionLogStatus::Complete,
                fields_affected,
                Some(message),
            )
            .await;

        let mut records_masked = 0u64;
        let mask_targets = resources.policy.erasure_fields(&node.collection);
        if !mask_targets.is_empty() && !rows.is_empty() {
            let masked_fields: Vec<String> =
                mask_targets.iter().map(|(field, _)| field.to_string()).collect();
            resources
                .write_log(
                    address,
                    ActionType::Erasure,
                    ExecutionLogStatus::Started,
                    masked_fields.clone(),
                    None,
                )
                .await;
            match self.mask_with_retries(resources, node, &rows).await {
                Ok(count) => {
                    records_masked = count;
                    resources
                        .write_log(
                            address,
                            ActionType::Erasure,
                            ExecutionLogStatus::Complete,
                            masked_fields,
                            Some(format!("masked {} records", count)),
                        )
                        .await;
                }
                Err(error) => {
                    resources
                        .write_log(
                            address,
                            ActionType::Erasure,
                            ExecutionLogStatus::Error,
                            masked_fields,
                            Some(error.to_string()),
                        )
                        .await;
                    return failed_outcome(address, attempts, error.to_string());
                }
            }
        }

        NodeOutcome {
            address: address.clone(),
            status: ExecutionLogStatus::Complete,
            rows_retrieved: rows.len(),
            records_masked,
            attempts,
            from_cache,
            error: None,
        }
    }

    /// Collects per-field candidate values: seed values for this node's
    /// seed fields plus, for every inbound edge, the referenced values of
    /// the upstream node's cached rows. An upstream that produced nothing
    /// contributes nothing; the edge still counts as satisfied.
    async fn gather_input(&self, resources: &TaskResources, node: &Node) -> Result<InputData> {
        let mut input = InputData::new();
        for (field, identity_key) in &node.seed_fields {
            if let Some(Some(value)) = resources.seeds.get(identity_key) {
                input.entry(field.clone()).or_default().push(value.clone());
            }
        }
        for edge in &node.incoming {
            if edge.is_self_edge() {
                continue;
            }
            let upstream = edge.from.collection_address();
            let upstream_rows = resources
                .cached_rows(ActionType::Access, &upstream)
                .await?
                .unwrap_or_default();
            for row in &upstream_rows {
                if let Some(value) = row.get(&edge.from.field) {
                    input.entry(edge.to.field.clone()).or_default().push(value.clone());
                }
            }
        }
        Ok(input)
    }

    async fn retrieve_with_retries(
        &self,
        resources: &TaskResources,
        node: &Node,
        input: &InputData,
        attempts: &mut u32,
    ) -> Result<Vec<Row>> {
        loop {
            *attempts += 1;
            let run = match resources.connector(&node.connection_key) {
                Err(error) => NodeRun::Fatal(error),
                Ok(connector) => match connector
                    .retrieve(node, &resources.policy, input)
                    .await
                {
                    Ok(rows) => NodeRun::Complete(rows),
                    Err(error) => NodeRun::Retryable(error),
                },
            };
            match run {
                NodeRun::Complete(rows) => return Ok(rows),
                NodeRun::Fatal(error) => return Err(error),
                NodeRun::Retryable(error) => {
                    if *attempts >= self.config.max_attempts {
                        return Err(EngineError::Retrieval {
                            node: node.address.clone(),
                            attempts: *attempts,
                            source: error,
                        });
                    }
                    self.log_retry(resources, node, ActionType::Access, *attempts, &error).await;
                }
            }
        }
    }

    async fn mask_with_retries(
        &self,
        resources: &TaskResources,
        node: &Node,
        rows: &[Row],
    ) -> Result<u64> {
        let mut mask_attempts = 0u32;
        loop {
            mask_attempts += 1;
            let run = match resources.connector(&node.connection_key) {
                Err(error) => NodeRun::Fatal(error),
                Ok(connector) => match connector.mask(node, &resources.policy, rows).await {
                    Ok(count) => NodeRun::Complete(count),
                    Err(error) => NodeRun::Retryable(error),
                },
            };
            match run {
                NodeRun::Complete(count) => return Ok(count),
                NodeRun::Fatal(error) => return Err(error),
                NodeRun::Retryable(error) => {
                    if mask_attempts >= self.config.max_attempts {
                        return Err(EngineError::Masking {
                            node: node.address.clone(),
                            attempts: mask_attempts,
                            source: error,
                        });
                    }
                    self.log_retry(resources, node, ActionType::Erasure, mask_attempts, &error)
                        .await;
                }
            }
        }
    }

    async fn log_retry(
        &self,
        resources: &TaskResources,
        node: &Node,
        action: ActionType,
        attempt: u32,
        error: &ConnectorError,
    ) {
        warn!(
            node = %node.address,
            attempt,
            max_attempts = self.config.max_attempts,
            %error,
            "node attempt failed, retrying"
        );
        resources
            .write_log(
                &node.address,
                action,
                ExecutionLogStatus::Retrying,
                vec![],
                Some(format!("attempt {} failed: {}", attempt, error)),
            )
            .await;
        sleep(retry_delay(&self.config.retry_strategy, attempt)).await;
    }

    async fn terminal_failure(
        &self,
        resources: &TaskResources,
        node: &Node,
        attempts: u32,
        error: EngineError,
    ) -> NodeOutcome {
        resources
            .write_log(
                &node.address,
                ActionType::Access,
                ExecutionLogStatus::Error,
                vec![],
                Some(error.to_string()),
            )
            .await;
        failed_outcome(&node.address, attempts, error.to_string())
    }
}

fn failed_outcome(address: &CollectionAddress, attempts: u32, error: String) -> NodeOutcome {
    NodeOutcome {
        address: address.clone(),
        status: ExecutionLogStatus::Error,
        rows_retrieved: 0,
        records_masked: 0,
        attempts,
        from_cache: false,
        error: Some(error),
    }
}
