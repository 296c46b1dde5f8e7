//! MongoDB backend. The dataset maps to a database and the collection to a
//! collection; reads compile to filter + projection documents, masking to
//! one `update_one` per target row.

use futures::TryStreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::options::{ClientOptions, FindOptions};
use std::time::Duration;
use tracing::{debug, info};

use crate::connectors::query::{render_document_query, render_document_update, MaskUpdate, ReadQuery};
use crate::connectors::secrets::MongoSecrets;
use crate::connectors::{ConnectorError, ConnectorFailure, InputData};
use crate::core::value::{FieldValue, Row};
use crate::graph::dataset_graph::Node;
use crate::policy::Policy;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MongoConnector {
    key: String,
    secrets: MongoSecrets,
}

impl MongoConnector {
    pub(crate) fn new(key: &str, secrets: MongoSecrets) -> Self {
        Self {
            key: key.to_string(),
            secrets,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn client(&self) -> Result<mongodb::Client, ConnectorError> {
        let mut options = ClientOptions::parse(self.secrets.uri())
            .await
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Client, e))?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        mongodb::Client::with_options(options)
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Client, e))
    }

    pub async fn test_connection(&self) -> Result<(), ConnectorError> {
        let client = self.client().await?;
        client
            .list_database_names(None, None)
            .await
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Liveness, e))?;
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
        let (filter, projection) = render_document_query(&read);
        let filter = self.to_document(ConnectorFailure::Retrieve, &filter)?;
        let projection = self.to_document(ConnectorFailure::Retrieve, &projection)?;

        let client = self.client().await?;
        let collection = client
            .database(&node.address.dataset)
            .collection::<Document>(&node.address.collection);
        let options = FindOptions::builder().projection(projection).build();

        let mut cursor = collection
            .find(filter, options)
            .await
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Retrieve, e))?;
        let mut rows = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Retrieve, e))?
        {
            rows.push(document_to_row(document));
        }
        info!(node = %node.address, count = rows.len(), "mongodb retrieval finished");
        Ok(rows)
    }

    pub async fn mask(
        &self,
        node: &Node,
        policy: &Policy,
        rows: &[Row],
    ) -> Result<u64, ConnectorError> {
        let client = self.client().await?;
        let collection = client
            .database(&node.address.dataset)
            .collection::<Document>(&node.address.collection);

        let mut mutated = 0u64;
        for row in rows {
            let Some(update) = MaskUpdate::build(node, row, policy) else {
                continue;
            };
            let (filter, modification) = render_document_update(&update);
            let filter = self.to_document(ConnectorFailure::Mask, &filter)?;
            let modification = self.to_document(ConnectorFailure::Mask, &modification)?;
            let outcome = collection
                .update_one(filter, modification, None)
                .await
                .map_err(|e| ConnectorError::new(&self.key, ConnectorFailure::Mask, e))?;
            mutated += outcome.modified_count;
        }
        Ok(mutated)
    }

    fn to_document(
        &self,
        failure: ConnectorFailure,
        value: &serde_json::Value,
    ) -> Result<Document, ConnectorError> {
        mongodb::bson::to_document(value).map_err(|e| ConnectorError::new(&self.key, failure, e))
    }
}

fn document_to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(name, value)| (name, bson_to_value(value)))
        .collect()
}

fn bson_to_value(value: Bson) -> FieldValue {
    match value {
        Bson::Null => FieldValue::Null,
        Bson::Boolean(b) => FieldValue::Bool(b),
        Bson::Int32(i) => FieldValue::Int(i as i64),
        Bson::Int64(i) => FieldValue::Int(i),
        Bson::Double(x) => FieldValue::Float(x),
        Bson::String(s) => FieldValue::String(s),
        Bson::Array(items) => {
            FieldValue::Sequence(items.into_iter().map(bson_to_value).collect())
        }
        Bson::Document(document) => FieldValue::Mapping(
            document
                .into_iter()
                .map(|(name, value)| (name, bson_to_value(value)))
                .collect(),
        ),
        Bson::ObjectId(oid) => FieldValue::String(oid.to_hex()),
        other => FieldValue::from(other.into_relaxed_extjson()),
    }
}
