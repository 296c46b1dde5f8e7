pub mod config;
pub mod dataset_graph;
pub mod traversal;

pub use config::{Collection, CollectionAddress, Dataset, Field, FieldAddress, RefDirection, Reference};
pub use dataset_graph::{DatasetGraph, Edge, Node};
pub use traversal::{SeedSnapshot, Traversal};
