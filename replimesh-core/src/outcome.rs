//! Normalized operation results
//!
//! Every driver returns one of these shapes; serialization produces the same
//! JSON a document-database client would hand back (array for `find`, object
//! or null for `findOne`, counts for writes).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::{MeshError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationResult {
    /// `find`, `aggregate`
    Documents(Vec<Document>),
    /// `findOne` and the `findOneAnd*` pre-images
    Document(Option<Document>),
    /// `countDocuments`, `estimatedDocumentCount`
    Count(u64),
    InsertOne(InsertOneResult),
    InsertMany(InsertManyResult),
    /// `updateOne`, `updateMany`, `replaceOne`
    Update(UpdateResult),
    Delete(DeleteResult),
    /// `distinct`
    Values(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOneResult {
    pub acknowledged: bool,
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertManyResult {
    pub acknowledged: bool,
    pub inserted_count: u64,
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

impl OperationResult {
    /// Short description used in diagnostic records
    pub fn cardinality(&self) -> String {
        match self {
            OperationResult::Documents(docs) => format!("{} documents", docs.len()),
            OperationResult::Document(Some(_)) => "single document".to_string(),
            OperationResult::Document(None) => "no document".to_string(),
            OperationResult::Count(n) => n.to_string(),
            OperationResult::InsertOne(_) => "1 inserted".to_string(),
            OperationResult::InsertMany(r) => format!("{} inserted", r.inserted_count),
            OperationResult::Update(r) => {
                format!("{} matched, {} modified", r.matched_count, r.modified_count)
            }
            OperationResult::Delete(r) => format!("{} deleted", r.deleted_count),
            OperationResult::Values(values) => format!("{} values", values.len()),
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn into_documents(self) -> Result<Vec<Document>> {
        match self {
            OperationResult::Documents(docs) => Ok(docs),
            OperationResult::Document(doc) => Ok(doc.into_iter().collect()),
            other => Err(MeshError::invalid_operation(format!(
                "expected documents, got {}",
                other.cardinality()
            ))),
        }
    }

    pub fn as_update(&self) -> Option<&UpdateResult> {
        match self {
            OperationResult::Update(r) => Some(r),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            OperationResult::Count(n) => Some(*n),
            _ => None,
        }
    }

    /// Decode documents into caller types
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        self.into_documents()?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(Value::Object(doc))
                    .map_err(|e| MeshError::invalid_operation(format!("decode failed: {}", e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_shape() {
        let result = OperationResult::Update(UpdateResult {
            acknowledged: true,
            matched_count: 1,
            modified_count: 1,
            ..Default::default()
        });
        let value = result.into_value();
        assert_eq!(value["matchedCount"], 1);
        assert_eq!(value["modifiedCount"], 1);
        assert_eq!(value["upsertedId"], Value::Null);
    }

    #[test]
    fn test_find_one_shapes() {
        assert_eq!(OperationResult::Document(None).into_value(), Value::Null);

        let doc = json!({"_id": "1"}).as_object().cloned().unwrap();
        let value = OperationResult::Document(Some(doc)).into_value();
        assert_eq!(value["_id"], "1");
    }

    #[test]
    fn test_decode_documents() {
        #[derive(Deserialize)]
        struct Guardian {
            name: String,
        }

        let docs = vec![json!({"name": "Ana"}).as_object().cloned().unwrap()];
        let decoded: Vec<Guardian> = OperationResult::Documents(docs).decode().unwrap();
        assert_eq!(decoded[0].name, "Ana");

        assert!(OperationResult::Count(3).decode::<Guardian>().is_err());
    }
}
