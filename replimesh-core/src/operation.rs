//! Declarative operation descriptors
//!
//! An [`Operation`] describes one call against a collection. It is built per
//! request, executed once on the authoritative instance, and (for writes)
//! serialized verbatim into replication envelopes, so the JSON shape is part of
//! the replication wire format:
//!
//! ```json
//! {"operation":"updateOne","collection":"T_Guardians","filter":{"_id":"7"},"data":{"$set":{"phone":"555"}}}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::MeshError;

/// Kind of database primitive an operation invokes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Find,
    FindOne,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
    ReplaceOne,
    Aggregate,
    CountDocuments,
    EstimatedDocumentCount,
    Distinct,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 16] = [
        OperationKind::Find,
        OperationKind::FindOne,
        OperationKind::InsertOne,
        OperationKind::InsertMany,
        OperationKind::UpdateOne,
        OperationKind::UpdateMany,
        OperationKind::DeleteOne,
        OperationKind::DeleteMany,
        OperationKind::ReplaceOne,
        OperationKind::Aggregate,
        OperationKind::CountDocuments,
        OperationKind::EstimatedDocumentCount,
        OperationKind::Distinct,
        OperationKind::FindOneAndUpdate,
        OperationKind::FindOneAndReplace,
        OperationKind::FindOneAndDelete,
    ];

    /// Read/write classification used for routing and replication.
    ///
    /// The `findOneAnd*` kinds return a document but mutate state, so they
    /// count as writes.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            OperationKind::Find
                | OperationKind::FindOne
                | OperationKind::Aggregate
                | OperationKind::CountDocuments
                | OperationKind::EstimatedDocumentCount
                | OperationKind::Distinct
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    /// Kinds the executor dispatches. The rest are classified but rejected
    /// with `UnsupportedOperation`.
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            OperationKind::Find
                | OperationKind::FindOne
                | OperationKind::InsertOne
                | OperationKind::InsertMany
                | OperationKind::UpdateOne
                | OperationKind::UpdateMany
                | OperationKind::DeleteOne
                | OperationKind::DeleteMany
                | OperationKind::ReplaceOne
                | OperationKind::Aggregate
                | OperationKind::CountDocuments
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Find => "find",
            OperationKind::FindOne => "findOne",
            OperationKind::InsertOne => "insertOne",
            OperationKind::InsertMany => "insertMany",
            OperationKind::UpdateOne => "updateOne",
            OperationKind::UpdateMany => "updateMany",
            OperationKind::DeleteOne => "deleteOne",
            OperationKind::DeleteMany => "deleteMany",
            OperationKind::ReplaceOne => "replaceOne",
            OperationKind::Aggregate => "aggregate",
            OperationKind::CountDocuments => "countDocuments",
            OperationKind::EstimatedDocumentCount => "estimatedDocumentCount",
            OperationKind::Distinct => "distinct",
            OperationKind::FindOneAndUpdate => "findOneAndUpdate",
            OperationKind::FindOneAndReplace => "findOneAndReplace",
            OperationKind::FindOneAndDelete => "findOneAndDelete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MeshError::invalid_operation(format!("unknown operation kind '{}'", s)))
    }
}

/// One operation against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Document>,
    /// Insert payload, update document or replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Document>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Document>,
}

impl Operation {
    pub fn new(kind: OperationKind, collection: impl Into<String>) -> Self {
        Self {
            kind,
            collection: collection.into(),
            filter: None,
            data: None,
            pipeline: None,
            options: None,
        }
    }

    pub fn find(collection: impl Into<String>) -> Self {
        Self::new(OperationKind::Find, collection)
    }

    pub fn find_one(collection: impl Into<String>) -> Self {
        Self::new(OperationKind::FindOne, collection)
    }

    pub fn insert_one(collection: impl Into<String>, document: Value) -> Self {
        Self::new(OperationKind::InsertOne, collection).data(document)
    }

    pub fn insert_many(collection: impl Into<String>, documents: Vec<Value>) -> Self {
        Self::new(OperationKind::InsertMany, collection).data(Value::Array(documents))
    }

    pub fn update_one(collection: impl Into<String>, filter: Value, update: Value) -> Self {
        Self::new(OperationKind::UpdateOne, collection)
            .filter(filter)
            .data(update)
    }

    pub fn update_many(collection: impl Into<String>, filter: Value, update: Value) -> Self {
        Self::new(OperationKind::UpdateMany, collection)
            .filter(filter)
            .data(update)
    }

    pub fn replace_one(collection: impl Into<String>, filter: Value, replacement: Value) -> Self {
        Self::new(OperationKind::ReplaceOne, collection)
            .filter(filter)
            .data(replacement)
    }

    pub fn delete_one(collection: impl Into<String>, filter: Value) -> Self {
        Self::new(OperationKind::DeleteOne, collection).filter(filter)
    }

    pub fn delete_many(collection: impl Into<String>, filter: Value) -> Self {
        Self::new(OperationKind::DeleteMany, collection).filter(filter)
    }

    pub fn aggregate(collection: impl Into<String>, pipeline: Vec<Value>) -> Self {
        Self::new(OperationKind::Aggregate, collection).pipeline(pipeline)
    }

    pub fn count_documents(collection: impl Into<String>) -> Self {
        Self::new(OperationKind::CountDocuments, collection)
    }

    /// Set the filter. Non-object values are ignored (treated as match-all).
    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = match filter {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set aggregation stages. Non-object stages are dropped.
    pub fn pipeline(mut self, stages: Vec<Value>) -> Self {
        self.pipeline = Some(
            stages
                .into_iter()
                .filter_map(|stage| match stage {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        );
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = match options {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn is_read(&self) -> bool {
        self.kind.is_read()
    }

    /// Filter to evaluate, empty (match-all) when absent
    pub fn filter_or_empty(&self) -> Document {
        self.filter.clone().unwrap_or_default()
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.as_ref().and_then(|o| o.get(key))
    }

    pub fn option_bool(&self, key: &str) -> bool {
        self.option(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn option_usize(&self, key: &str) -> Option<usize> {
        self.option(key)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_write_classification() {
        let reads: Vec<_> = OperationKind::ALL.iter().filter(|k| k.is_read()).collect();
        assert_eq!(reads.len(), 6);
        assert!(OperationKind::FindOneAndUpdate.is_write());
        assert!(OperationKind::FindOneAndDelete.is_write());
        assert!(OperationKind::FindOneAndReplace.is_write());
        assert!(OperationKind::Distinct.is_read());
        assert!(!OperationKind::Distinct.is_executable());
        assert!(OperationKind::CountDocuments.is_executable());
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::update_one(
            "T_Guardians",
            json!({"_id": "7"}),
            json!({"$set": {"phone": "555"}}),
        )
        .options(json!({"upsert": false}));

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operation"], "updateOne");
        assert_eq!(value["collection"], "T_Guardians");
        assert_eq!(value["filter"]["_id"], "7");
        assert_eq!(value["data"]["$set"]["phone"], "555");
        assert!(value.get("pipeline").is_none());

        let back: Operation = serde_json::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(
            "countdocuments".parse::<OperationKind>().unwrap(),
            OperationKind::CountDocuments
        );
        assert!("upsert".parse::<OperationKind>().is_err());
    }
}
