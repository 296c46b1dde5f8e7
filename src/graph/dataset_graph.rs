//! Merges per-dataset declarations into one execution graph.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::errors::{EngineError, Result};
use crate::graph::config::{Collection, CollectionAddress, Dataset, FieldAddress, RefDirection};

/// A resolved dependency edge between two fields: rows of `to`'s collection
/// are located using values read from `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: FieldAddress,
    pub to: FieldAddress,
}

impl Edge {
    /// Self-references connect a collection to itself; they never gate
    /// readiness during traversal.
    pub fn is_self_edge(&self) -> bool {
        self.from.collection_address() == self.to.collection_address()
    }
}

/// A collection's schema plus its resolved edges and seed fields. Immutable
/// once the graph is built.
#[derive(Debug, Clone)]
pub struct Node {
    pub address: CollectionAddress,
    pub connection_key: String,
    pub collection: Collection,
    /// Edges producing input values for this collection.
    pub incoming: Vec<Edge>,
    /// Edges feeding downstream collections from this one.
    pub outgoing: Vec<Edge>,
    /// Field name → identity key, for identity fields with no satisfying
    /// inbound edge. These are the only valid traversal entry points.
    pub seed_fields: BTreeMap<String, String>,
}

impl Node {
    pub fn contains_field<P: Fn(&crate::graph::config::Field) -> bool>(&self, pred: P) -> bool {
        self.collection.fields.iter().any(pred)
    }
}

/// Two nodes are equal if they share a collection address.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

/// The merged graph across every dataset bound to the active connections.
#[derive(Debug, Clone)]
pub struct DatasetGraph {
    nodes: BTreeMap<CollectionAddress, Node>,
    pub edges: Vec<Edge>,
    /// All identity keys declared by seed fields, e.g. {"email"}.
    pub identity_keys: BTreeMap<FieldAddress, String>,
    graph: DiGraph<CollectionAddress, ()>,
}

impl DatasetGraph {
    /// Builds the graph, failing when two datasets declare the same
    /// collection address or a reference targets a collection or field that
    /// no dataset provides.
    pub fn new(datasets: Vec<Dataset>) -> Result<Self> {
        let mut nodes: BTreeMap<CollectionAddress, Node> = BTreeMap::new();

        for dataset in &datasets {
            dataset.validate()?;
            for collection in &dataset.collections {
                let address = dataset.collection_address(&collection.name);
                if nodes.contains_key(&address) {
                    return Err(EngineError::DuplicateAddress { address });
                }
                nodes.insert(
                    address.clone(),
                    Node {
                        address,
                        connection_key: dataset.connection_key.clone(),
                        collection: collection.clone(),
                        incoming: Vec::new(),
                        outgoing: Vec::new(),
                        seed_fields: BTreeMap::new(),
                    },
                );
            }
        }

        // Resolve declared references into directed edges. Direction is
        // relative to the declaring field: `from` means the target runs
        // first, `to` means the declaring collection runs first.
        let mut edges: Vec<Edge> = Vec::new();
        for dataset in &datasets {
            for collection in &dataset.collections {
                let address = dataset.collection_address(&collection.name);
                for field in &collection.fields {
                    for reference in &field.references {
                        let target = &reference.target;
                        let target_address = target.collection_address();
                        let resolves = nodes
                            .get(&target_address)
                            .map(|n| n.collection.field(&target.field).is_some())
                            .unwrap_or(false);
                        if !resolves {
                            return Err(EngineError::MissingReferenceTarget {
                                target: target.clone(),
                                declared_by: address.clone(),
                            });
                        }
                        let local = address.field(&field.name);
                        let edge = match reference.direction {
                            RefDirection::From => Edge {
                                from: target.clone(),
                                to: local,
                            },
                            RefDirection::To => Edge {
                                from: local,
                                to: target.clone(),
                            },
                        };
                        edges.push(edge);
                    }
                }
            }
        }

        for edge in &edges {
            if let Some(node) = nodes.get_mut(&edge.from.collection_address()) {
                node.outgoing.push(edge.clone());
            }
            if let Some(node) = nodes.get_mut(&edge.to.collection_address()) {
                node.incoming.push(edge.clone());
            }
        }

        // Seed fields: identity-flagged fields with no inbound edge
        // landing on them.
        let mut identity_keys = BTreeMap::new();
        for node in nodes.values_mut() {
            for field in &node.collection.fields {
                if let Some(identity) = &field.identity {
                    let field_address = node.address.field(&field.name);
                    let satisfied = node
                        .incoming
                        .iter()
                        .any(|e| !e.is_self_edge() && e.to == field_address);
                    if !satisfied {
                        node.seed_fields.insert(field.name.clone(), identity.clone());
                        identity_keys.insert(field_address, identity.clone());
                    }
                }
            }
        }

        let mut graph = DiGraph::new();
        let mut indices: HashMap<CollectionAddress, NodeIndex> = HashMap::new();
        for address in nodes.keys() {
            let idx = graph.add_node(address.clone());
            indices.insert(address.clone(), idx);
        }
        for edge in &edges {
            if edge.is_self_edge() {
                continue;
            }
            let a = indices[&edge.from.collection_address()];
            let b = indices[&edge.to.collection_address()];
            graph.add_edge(a, b, ());
        }

        Ok(Self {
            nodes,
            edges,
            identity_keys,
            graph,
        })
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&Node> {
        self.nodes.get(address)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Addresses in deterministic (sorted) order.
    pub fn addresses(&self) -> impl Iterator<Item = &CollectionAddress> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// The distinct identity keys a traversal can be seeded with.
    pub fn identity_key_set(&self) -> BTreeSet<String> {
        self.identity_keys.values().cloned().collect()
    }

    pub(crate) fn petgraph(&self) -> &DiGraph<CollectionAddress, ()> {
        &self.graph
    }
}
