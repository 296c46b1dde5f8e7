//! Declarative dataset model: addresses, fields, and the references that
//! become graph edges.
//!
//! Datasets are normally loaded from YAML produced by the configuration
//! layer; everything here is plain data and carries no connection state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::{EngineError, Result};

/// Unique identifier of a queryable unit: one collection within one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionAddress {
    pub dataset: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new<D: Into<String>, C: Into<String>>(dataset: D, collection: C) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    pub fn field<F: Into<String>>(&self, field: F) -> FieldAddress {
        FieldAddress {
            dataset: self.dataset.clone(),
            collection: self.collection.clone(),
            field: field.into(),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

/// Unique identifier of a field within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldAddress {
    pub dataset: String,
    pub collection: String,
    pub field: String,
}

impl FieldAddress {
    pub fn new<D, C, F>(dataset: D, collection: C, field: F) -> Self
    where
        D: Into<String>,
        C: Into<String>,
        F: Into<String>,
    {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
            field: field.into(),
        }
    }

    pub fn collection_address(&self) -> CollectionAddress {
        CollectionAddress::new(self.dataset.clone(), self.collection.clone())
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.dataset, self.collection, self.field)
    }
}

/// Direction of a declared reference, relative to the declaring field.
///
/// `From` means the declaring field is populated from the target field (the
/// target's collection runs first); `To` means the declaring field feeds the
/// target (the declaring collection runs first). Self-references stay
/// distinguished edges either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefDirection {
    From,
    To,
}

/// A declared field-to-field dependency, possibly across datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub target: FieldAddress,
    pub direction: RefDirection,
}

/// A field declaration within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Data categories attached to this field, matched against policy rules.
    #[serde(default)]
    pub data_categories: Vec<String>,
    /// When set, names the identity key this field can be seeded from
    /// (e.g. "email").
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Field {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            data_categories: Vec::new(),
            identity: None,
            primary_key: false,
            references: Vec::new(),
        }
    }

    pub fn with_identity<K: Into<String>>(mut self, key: K) -> Self {
        self.identity = Some(key.into());
        self
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_category<C: Into<String>>(mut self, category: C) -> Self {
        self.data_categories.push(category.into());
        self
    }

    pub fn with_reference(mut self, target: FieldAddress, direction: RefDirection) -> Self {
        self.references.push(Reference { target, direction });
        self
    }
}

/// A collection declaration: a named set of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Collection {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn primary_key_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }
}

/// One dataset bound to a connection: the unit the configuration layer
/// hands over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    /// Key of the connection configuration this dataset is served by.
    pub connection_key: String,
    pub collections: Vec<Collection>,
}

impl Dataset {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let dataset: Dataset = serde_yaml::from_str(raw)
            .map_err(|e| EngineError::validation(format!("invalid dataset yaml: {}", e)))?;
        dataset.validate()?;
        Ok(dataset)
    }

    /// Structural checks that do not need the rest of the graph: unique
    /// collection names, unique field names, non-empty identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::validation_field("dataset name is empty", "name"));
        }
        if self.connection_key.is_empty() {
            return Err(EngineError::validation_field(
                format!("dataset '{}' has no connection key", self.name),
                "connection_key",
            ));
        }
        let mut seen_collections = std::collections::HashSet::new();
        for collection in &self.collections {
            if !seen_collections.insert(&collection.name) {
                return Err(EngineError::validation(format!(
                    "collection '{}' declared twice in dataset '{}'",
                    collection.name, self.name
                )));
            }
            let mut seen_fields = std::collections::HashSet::new();
            for field in &collection.fields {
                if !seen_fields.insert(&field.name) {
                    return Err(EngineError::validation(format!(
                        "field '{}' declared twice in collection '{}:{}'",
                        field.name, self.name, collection.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn collection_address(&self, collection: &str) -> CollectionAddress {
        CollectionAddress::new(self.name.clone(), collection)
    }
}
