//! Per-node query and update compilation.
//!
//! The compiler turns the values gathered from seeds and upstream rows into
//! a backend-neutral [`ReadQuery`] (predicates OR-ed across fields,
//! projected to the node's declared fields) and, for erasure, one
//! [`MaskUpdate`] per target row covering only policy-matched fields.
//! Rendering to SQL text or filter documents happens here too, so the
//! connectors stay thin.

use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::connectors::InputData;
use crate::core::value::{FieldValue, Row};
use crate::graph::dataset_graph::Node;
use crate::policy::Policy;

/// A single field predicate: equality for one candidate value,
/// set-membership for several.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, FieldValue),
    In(String, Vec<FieldValue>),
}

impl Predicate {
    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq(field, _) | Predicate::In(field, _) => field,
        }
    }
}

/// A compiled read: projection plus predicates. A row matches when any
/// predicate matches.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    pub fields: Vec<String>,
    pub predicates: Vec<Predicate>,
}

impl ReadQuery {
    /// Compiles the node's read operation. Returns `None` when no usable
    /// predicate can be built from the available input; the node is then
    /// treated as empty, not as an error.
    pub fn build(node: &Node, input: &InputData) -> Option<Self> {
        let mut predicates = Vec::new();
        for (field, values) in input {
            if node.collection.field(field).is_none() {
                continue;
            }
            let mut usable: Vec<FieldValue> = Vec::new();
            for value in values {
                if value.is_null() || !value.is_scalar() || usable.contains(value) {
                    continue;
                }
                usable.push(value.clone());
            }
            match usable.len() {
                0 => {}
                1 => predicates.push(Predicate::Eq(field.clone(), usable.pop().unwrap())),
                _ => predicates.push(Predicate::In(field.clone(), usable)),
            }
        }
        if predicates.is_empty() {
            return None;
        }
        Some(Self {
            fields: node.collection.field_names(),
            predicates,
        })
    }
}

/// A compiled masking update for one row: the new values for matched
/// fields, and the equality matches that locate the row.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskUpdate {
    pub assignments: BTreeMap<String, FieldValue>,
    pub matches: Vec<(String, FieldValue)>,
}

impl MaskUpdate {
    /// Compiles one update. Returns `None` when the policy matches no field
    /// present on the row, or when nothing can locate the row. Fields the
    /// policy does not match are never touched.
    pub fn build(node: &Node, row: &Row, policy: &Policy) -> Option<Self> {
        let mut assignments = BTreeMap::new();
        for (field, strategy) in policy.erasure_fields(&node.collection) {
            if let Some(current) = row.get(field) {
                assignments.insert(field.to_string(), strategy.apply(current));
            }
        }
        if assignments.is_empty() {
            return None;
        }

        // Locate the row by primary key, or by its remaining scalar values
        // when the collection declares none.
        let mut matches: Vec<(String, FieldValue)> = node
            .collection
            .primary_key_fields()
            .iter()
            .filter_map(|f| row.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .collect();
        if matches.is_empty() {
            matches = row
                .iter()
                .filter(|(name, value)| !assignments.contains_key(*name) && value.is_scalar())
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
        }
        if matches.is_empty() {
            return None;
        }
        Some(Self { assignments, matches })
    }
}

/// Placeholder style per SQL family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    fn placeholder(&self, position: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", position),
            SqlDialect::Sqlite => "?".to_string(),
        }
    }
}

/// Parameterized SQL text plus its bind values, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub text: String,
    pub params: Vec<FieldValue>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn render_select(table: &str, query: &ReadQuery, dialect: SqlDialect) -> SqlQuery {
    let projection = query
        .fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::new();
    let mut clauses = Vec::new();
    for predicate in &query.predicates {
        match predicate {
            Predicate::Eq(field, value) => {
                params.push(value.clone());
                clauses.push(format!(
                    "{} = {}",
                    quote_ident(field),
                    dialect.placeholder(params.len())
                ));
            }
            Predicate::In(field, values) => {
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    params.push(value.clone());
                    slots.push(dialect.placeholder(params.len()));
                }
                clauses.push(format!("{} IN ({})", quote_ident(field), slots.join(", ")));
            }
        }
    }

    SqlQuery {
        text: format!(
            "SELECT {} FROM {} WHERE {}",
            projection,
            quote_ident(table),
            clauses.join(" OR ")
        ),
        params,
    }
}

pub fn render_update(table: &str, update: &MaskUpdate, dialect: SqlDialect) -> SqlQuery {
    let mut params = Vec::new();
    let mut sets = Vec::new();
    for (field, value) in &update.assignments {
        params.push(value.clone());
        sets.push(format!(
            "{} = {}",
            quote_ident(field),
            dialect.placeholder(params.len())
        ));
    }
    let mut conditions = Vec::new();
    for (field, value) in &update.matches {
        params.push(value.clone());
        conditions.push(format!(
            "{} = {}",
            quote_ident(field),
            dialect.placeholder(params.len())
        ));
    }
    SqlQuery {
        text: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            sets.join(", "),
            conditions.join(" AND ")
        ),
        params,
    }
}

/// Filter + projection documents for document stores.
pub fn render_document_query(query: &ReadQuery) -> (JsonValue, JsonValue) {
    let clause = |predicate: &Predicate| -> JsonValue {
        let mut doc = Map::new();
        match predicate {
            Predicate::Eq(field, value) => {
                doc.insert(field.clone(), JsonValue::from(value.clone()));
            }
            Predicate::In(field, values) => {
                let candidates: Vec<JsonValue> =
                    values.iter().cloned().map(JsonValue::from).collect();
                doc.insert(field.clone(), json!({ "$in": candidates }));
            }
        }
        JsonValue::Object(doc)
    };
    let filter = if query.predicates.len() == 1 {
        clause(&query.predicates[0])
    } else {
        json!({ "$or": query.predicates.iter().map(clause).collect::<Vec<_>>() })
    };

    let mut projection = Map::new();
    for field in &query.fields {
        projection.insert(field.clone(), json!(1));
    }
    (filter, JsonValue::Object(projection))
}

/// Filter + `$set` documents for a document-store masking update.
pub fn render_document_update(update: &MaskUpdate) -> (JsonValue, JsonValue) {
    let mut filter = Map::new();
    for (field, value) in &update.matches {
        filter.insert(field.clone(), JsonValue::from(value.clone()));
    }
    let mut set = Map::new();
    for (field, value) in &update.assignments {
        set.insert(field.clone(), JsonValue::from(value.clone()));
    }
    (JsonValue::Object(filter), json!({ "$set": set }))
}
