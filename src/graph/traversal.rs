//! Traversal planning: computing a dependency-respecting visit order from a
//! concrete seed snapshot.
//!
//! Planning is a pure function of the graph and the snapshot. It performs no
//! I/O, so a caller can dry-run it with null seed values to check that a
//! dataset is traversable before anything is executed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::is_cyclic_directed;

use crate::core::errors::{EngineError, Result};
use crate::core::value::FieldValue;
use crate::graph::config::CollectionAddress;
use crate::graph::dataset_graph::DatasetGraph;

/// Identity key → concrete value. `None` marks a validation-only dry run:
/// the key counts as supplied for planning but produces no query input.
pub type SeedSnapshot = BTreeMap<String, Option<FieldValue>>;

/// A computed visit order over a [`DatasetGraph`] for one seed snapshot.
///
/// A node appears only after every collection feeding one of its required
/// inbound edges. The order is deterministic for a fixed graph + snapshot:
/// ties are broken by address ordering.
#[derive(Debug, Clone)]
pub struct Traversal {
    pub order: Vec<CollectionAddress>,
    /// Nodes grouped by readiness: members of one layer have no dependency
    /// on each other and may run in parallel.
    pub layers: Vec<Vec<CollectionAddress>>,
}

impl Traversal {
    pub fn plan(graph: &DatasetGraph, seeds: &SeedSnapshot) -> Result<Self> {
        // Entry points: nodes with at least one seed field whose identity
        // key appears in the snapshot.
        let entries: BTreeSet<CollectionAddress> = graph
            .nodes()
            .filter(|node| node.seed_fields.values().any(|key| seeds.contains_key(key)))
            .map(|node| node.address.clone())
            .collect();

        let all: BTreeSet<CollectionAddress> = graph.addresses().cloned().collect();
        if entries.is_empty() && !all.is_empty() {
            return Err(EngineError::UnreachableNodes {
                nodes: all.into_iter().collect(),
            });
        }

        // Downstream adjacency between distinct collections.
        let mut downstream: HashMap<CollectionAddress, BTreeSet<CollectionAddress>> =
            HashMap::new();
        let mut upstream: HashMap<CollectionAddress, BTreeSet<CollectionAddress>> = HashMap::new();
        for edge in &graph.edges {
            if edge.is_self_edge() {
                continue;
            }
            let from = edge.from.collection_address();
            let to = edge.to.collection_address();
            downstream.entry(from.clone()).or_default().insert(to.clone());
            upstream.entry(to).or_default().insert(from);
        }

        // Anything not reachable from an entry point can never be queried.
        let mut reachable: HashSet<CollectionAddress> = HashSet::new();
        let mut queue: VecDeque<CollectionAddress> = entries.iter().cloned().collect();
        while let Some(address) = queue.pop_front() {
            if !reachable.insert(address.clone()) {
                continue;
            }
            if let Some(next) = downstream.get(&address) {
                queue.extend(next.iter().cloned());
            }
        }
        let unreachable: Vec<CollectionAddress> = all
            .iter()
            .filter(|a| !reachable.contains(*a))
            .cloned()
            .collect();
        if !unreachable.is_empty() {
            return Err(EngineError::UnreachableNodes { nodes: unreachable });
        }

        // Kahn's algorithm; the ready set is ordered so the visit order is
        // stable run to run.
        let mut indegree: HashMap<CollectionAddress, usize> = all
            .iter()
            .map(|a| (a.clone(), upstream.get(a).map_or(0, BTreeSet::len)))
            .collect();
        let mut ready: BTreeSet<CollectionAddress> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(a, _)| a.clone())
            .collect();

        let mut order = Vec::with_capacity(all.len());
        while let Some(address) = ready.iter().next().cloned() {
            ready.remove(&address);
            order.push(address.clone());
            if let Some(next) = downstream.get(&address) {
                for target in next {
                    if let Some(d) = indegree.get_mut(target) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(target.clone());
                        }
                    }
                }
            }
        }

        if order.len() < all.len() {
            let mut stuck: Vec<CollectionAddress> = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(a, _)| a)
                .collect();
            stuck.sort();
            debug_assert!(is_cyclic_directed(graph.petgraph()));
            return Err(EngineError::CycleDetected { nodes: stuck });
        }

        // Readiness layers: a node's layer is one past its deepest upstream.
        let mut level: HashMap<CollectionAddress, usize> = HashMap::new();
        let mut layers: Vec<Vec<CollectionAddress>> = Vec::new();
        for address in &order {
            let depth = upstream
                .get(address)
                .map(|ups| ups.iter().map(|u| level[u] + 1).max().unwrap_or(0))
                .unwrap_or(0);
            level.insert(address.clone(), depth);
            while layers.len() <= depth {
                layers.push(Vec::new());
            }
            layers[depth].push(address.clone());
        }

        Ok(Self { order, layers })
    }

    /// Plans with null placeholders for every identity key the graph
    /// declares. Used to check traversability without seed values.
    pub fn dry_run(graph: &DatasetGraph) -> Result<Self> {
        let seeds: SeedSnapshot = graph
            .identity_key_set()
            .into_iter()
            .map(|key| (key, None))
            .collect();
        Self::plan(graph, &seeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::config::{Collection, Dataset, Field, FieldAddress, RefDirection};

    fn dataset(collections: Vec<Collection>) -> Vec<Dataset> {
        vec![Dataset {
            name: "s1".into(),
            connection_key: "c1".into(),
            collections,
        }]
    }

    fn seeded(key: &str) -> SeedSnapshot {
        SeedSnapshot::from([(key.to_string(), Some(FieldValue::from("x@example.com")))])
    }

    fn chain_graph() -> DatasetGraph {
        // users <- orders <- shipments, plus a payments node also fed by users
        DatasetGraph::new(dataset(vec![
            Collection {
                name: "users".into(),
                fields: vec![Field::new("email").with_identity("email")],
            },
            Collection {
                name: "orders".into(),
                fields: vec![Field::new("user_email").with_reference(
                    FieldAddress::new("s1", "users", "email"),
                    RefDirection::From,
                )],
            },
            Collection {
                name: "shipments".into(),
                fields: vec![Field::new("order_id").with_reference(
                    FieldAddress::new("s1", "orders", "user_email"),
                    RefDirection::From,
                )],
            },
            Collection {
                name: "payments".into(),
                fields: vec![Field::new("billing_email").with_reference(
                    FieldAddress::new("s1", "users", "email"),
                    RefDirection::From,
                )],
            },
        ]))
        .unwrap()
    }

    #[test]
    fn test_visit_order_respects_dependencies() {
        let graph = chain_graph();
        let traversal = Traversal::plan(&graph, &seeded("email")).unwrap();

        let position: std::collections::HashMap<_, _> = traversal
            .order
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), i))
            .collect();
        assert_eq!(traversal.order.len(), 4);
        assert!(position[&CollectionAddress::new("s1", "users")]
            < position[&CollectionAddress::new("s1", "orders")]);
        assert!(position[&CollectionAddress::new("s1", "orders")]
            < position[&CollectionAddress::new("s1", "shipments")]);
        assert!(position[&CollectionAddress::new("s1", "users")]
            < position[&CollectionAddress::new("s1", "payments")]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let graph = chain_graph();
        let a = Traversal::plan(&graph, &seeded("email")).unwrap();
        let b = Traversal::plan(&graph, &seeded("email")).unwrap();
        assert_eq!(a.order, b.order);
        assert_eq!(a.layers, b.layers);
    }

    #[test]
    fn test_layers_group_independent_nodes() {
        let graph = chain_graph();
        let traversal = Traversal::plan(&graph, &seeded("email")).unwrap();
        assert_eq!(traversal.layers[0], vec![CollectionAddress::new("s1", "users")]);
        // orders and payments both depend only on users
        assert_eq!(
            traversal.layers[1],
            vec![
                CollectionAddress::new("s1", "orders"),
                CollectionAddress::new("s1", "payments"),
            ]
        );
        assert_eq!(
            traversal.layers[2],
            vec![CollectionAddress::new("s1", "shipments")]
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let graph = DatasetGraph::new(dataset(vec![
            Collection {
                name: "anchor".into(),
                fields: vec![
                    Field::new("email").with_identity("email"),
                    Field::new("link").with_reference(
                        FieldAddress::new("s1", "orders", "id"),
                        RefDirection::To,
                    ),
                ],
            },
            Collection {
                name: "orders".into(),
                fields: vec![Field::new("id").with_reference(
                    FieldAddress::new("s1", "customers", "order_id"),
                    RefDirection::To,
                )],
            },
            Collection {
                name: "customers".into(),
                fields: vec![Field::new("order_id").with_reference(
                    FieldAddress::new("s1", "orders", "id"),
                    RefDirection::To,
                )],
            },
        ]))
        .unwrap();
        let err = Traversal::plan(&graph, &seeded("email")).unwrap_err();
        match err {
            EngineError::CycleDetected { nodes } => {
                assert!(nodes.contains(&CollectionAddress::new("s1", "orders")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unseeded_graph_is_unreachable() {
        let graph = chain_graph();
        let err = Traversal::plan(&graph, &seeded("phone")).unwrap_err();
        assert!(matches!(err, EngineError::UnreachableNodes { .. }));
    }

    #[test]
    fn test_disconnected_node_is_named() {
        let graph = DatasetGraph::new(dataset(vec![
            Collection {
                name: "users".into(),
                fields: vec![Field::new("email").with_identity("email")],
            },
            Collection {
                name: "island".into(),
                fields: vec![Field::new("value")],
            },
        ]))
        .unwrap();
        match Traversal::plan(&graph, &seeded("email")).unwrap_err() {
            EngineError::UnreachableNodes { nodes } => {
                assert_eq!(nodes, vec![CollectionAddress::new("s1", "island")]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_dry_run_with_null_seeds() {
        let graph = chain_graph();
        let traversal = Traversal::dry_run(&graph).unwrap();
        assert_eq!(traversal.order.len(), 4);
    }
}
