//! Collection engine shared by the document drivers
//!
//! Applies one [`Operation`] to the documents of a single collection and
//! reports which documents were written or removed, so storage backends can
//! persist only the delta.

use serde_json::Value;
use uuid::Uuid;

use replimesh_core::document::{
    apply_update, get_path, matches, project, replace_document, sort_documents, upsert_seed,
};
use replimesh_core::outcome::{
    DeleteResult, InsertManyResult, InsertOneResult, OperationResult, UpdateResult,
};
use replimesh_core::pipeline::run_pipeline;
use replimesh_core::{Document, DriverError, Operation, OperationKind};

type EngineResult<T> = Result<T, DriverError>;

/// Outcome of applying one operation
#[derive(Debug)]
pub struct Applied {
    pub result: OperationResult,
    /// Documents inserted or modified, in their final state
    pub written: Vec<Document>,
    /// `_id` values of removed documents
    pub removed: Vec<Value>,
}

impl Applied {
    fn read(result: OperationResult) -> Self {
        Self {
            result,
            written: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_mutation(&self) -> bool {
        !self.written.is_empty() || !self.removed.is_empty()
    }
}

pub fn apply(docs: &mut Vec<Document>, op: &Operation) -> EngineResult<Applied> {
    let filter = op.filter_or_empty();

    match op.kind {
        OperationKind::Find => {
            let found = select(docs, &filter, op, None)?;
            Ok(Applied::read(OperationResult::Documents(found)))
        }
        OperationKind::FindOne => {
            let found = select(docs, &filter, op, Some(1))?;
            Ok(Applied::read(OperationResult::Document(
                found.into_iter().next(),
            )))
        }
        OperationKind::CountDocuments => {
            let mut n = matching_positions(docs, &filter)?.len();
            if let Some(skip) = op.option_usize("skip") {
                n = n.saturating_sub(skip);
            }
            if let Some(limit) = op.option_usize("limit").filter(|l| *l > 0) {
                n = n.min(limit);
            }
            Ok(Applied::read(OperationResult::Count(n as u64)))
        }
        OperationKind::EstimatedDocumentCount => {
            Ok(Applied::read(OperationResult::Count(docs.len() as u64)))
        }
        OperationKind::Distinct => {
            let key = op
                .option("key")
                .or(op.data.as_ref())
                .and_then(Value::as_str)
                .ok_or_else(|| DriverError::query("distinct requires a field name"))?;
            let mut values: Vec<Value> = Vec::new();
            for pos in matching_positions(docs, &filter)? {
                let items = match get_path(&docs[pos], key) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                    None => continue,
                };
                for item in items {
                    if !values.contains(&item) {
                        values.push(item);
                    }
                }
            }
            Ok(Applied::read(OperationResult::Values(values)))
        }
        OperationKind::Aggregate => {
            let pipeline = op.pipeline.as_deref().unwrap_or(&[]);
            let out = run_pipeline(docs.clone(), pipeline)?;
            Ok(Applied::read(OperationResult::Documents(out)))
        }
        OperationKind::InsertOne => {
            let doc = as_document(op.data.as_ref(), "insertOne")?;
            let doc = insert(docs, doc)?;
            let inserted_id = doc.get("_id").cloned().unwrap_or(Value::Null);
            Ok(Applied {
                result: OperationResult::InsertOne(InsertOneResult {
                    acknowledged: true,
                    inserted_id,
                }),
                written: vec![doc],
                removed: Vec::new(),
            })
        }
        OperationKind::InsertMany => {
            let items = match op.data.as_ref() {
                Some(Value::Array(items)) => items,
                _ => return Err(DriverError::query("insertMany requires an array of documents")),
            };
            // Validate everything before touching the collection
            let mut staged = docs.clone();
            let mut written = Vec::with_capacity(items.len());
            for item in items {
                let doc = as_document(Some(item), "insertMany")?;
                written.push(insert(&mut staged, doc)?);
            }
            *docs = staged;
            let inserted_ids = written
                .iter()
                .map(|d| d.get("_id").cloned().unwrap_or(Value::Null))
                .collect::<Vec<_>>();
            Ok(Applied {
                result: OperationResult::InsertMany(InsertManyResult {
                    acknowledged: true,
                    inserted_count: inserted_ids.len() as u64,
                    inserted_ids,
                }),
                written,
                removed: Vec::new(),
            })
        }
        OperationKind::UpdateOne | OperationKind::UpdateMany | OperationKind::ReplaceOne => {
            update(docs, &filter, op)
        }
        OperationKind::DeleteOne | OperationKind::DeleteMany => {
            let mut positions = matching_positions(docs, &filter)?;
            if op.kind == OperationKind::DeleteOne {
                positions.truncate(1);
            }
            let removed = remove_positions(docs, &positions);
            Ok(Applied {
                result: OperationResult::Delete(DeleteResult {
                    acknowledged: true,
                    deleted_count: removed.len() as u64,
                }),
                written: Vec::new(),
                removed,
            })
        }
        OperationKind::FindOneAndUpdate
        | OperationKind::FindOneAndReplace
        | OperationKind::FindOneAndDelete => find_and_modify(docs, &filter, op),
    }
}

fn select(
    docs: &[Document],
    filter: &Document,
    op: &Operation,
    limit: Option<usize>,
) -> EngineResult<Vec<Document>> {
    let mut found: Vec<Document> = Vec::new();
    for doc in docs {
        if matches(doc, filter)? {
            found.push(doc.clone());
        }
    }

    if let Some(Value::Object(sort)) = op.option("sort") {
        sort_documents(&mut found, sort);
    }

    let skip = op.option_usize("skip").unwrap_or(0);
    let limit = limit.or_else(|| op.option_usize("limit").filter(|l| *l > 0));
    let found = found.into_iter().skip(skip);
    let found: Vec<Document> = match limit {
        Some(limit) => found.take(limit).collect(),
        None => found.collect(),
    };

    match op.option("projection") {
        Some(Value::Object(projection)) => found.iter().map(|d| project(d, projection)).collect(),
        _ => Ok(found),
    }
}

fn matching_positions(docs: &[Document], filter: &Document) -> EngineResult<Vec<usize>> {
    let mut positions = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if matches(doc, filter)? {
            positions.push(i);
        }
    }
    Ok(positions)
}

fn as_document(value: Option<&Value>, kind: &str) -> EngineResult<Document> {
    match value {
        Some(Value::Object(doc)) => Ok(doc.clone()),
        _ => Err(DriverError::query(format!("{} requires a document", kind))),
    }
}

fn new_id() -> Value {
    Value::String(Uuid::new_v4().simple().to_string())
}

/// Copy of `op` with a generated `_id` on every document it may create
///
/// Covers `insertOne`, each element of `insertMany` and upserts whose filter
/// does not pin an `_id`. Running the returned operation on any instance
/// produces documents under the same keys, so it is the form to replicate.
pub fn with_assigned_ids(op: &Operation) -> Operation {
    let mut op = op.clone();
    match op.kind {
        OperationKind::InsertOne => {
            if let Some(Value::Object(doc)) = op.data.as_mut() {
                doc.entry("_id").or_insert_with(new_id);
            }
        }
        OperationKind::InsertMany => {
            if let Some(Value::Array(items)) = op.data.as_mut() {
                for item in items {
                    if let Value::Object(doc) = item {
                        doc.entry("_id").or_insert_with(new_id);
                    }
                }
            }
        }
        OperationKind::UpdateOne | OperationKind::UpdateMany if op.option_bool("upsert") => {
            if upsert_seed(&op.filter_or_empty()).contains_key("_id") {
                return op;
            }
            if let Some(Value::Object(update)) = op.data.as_mut() {
                if update.keys().all(|k| k.starts_with('$')) {
                    let on_insert = update
                        .entry("$setOnInsert")
                        .or_insert_with(|| Value::Object(Document::new()));
                    if let Value::Object(fields) = on_insert {
                        fields.entry("_id").or_insert_with(new_id);
                    }
                }
            }
        }
        OperationKind::ReplaceOne if op.option_bool("upsert") => {
            let pinned = upsert_seed(&op.filter_or_empty()).contains_key("_id")
                || matches!(&op.data, Some(Value::Object(doc)) if doc.contains_key("_id"))
                || op.option("upsertId").is_some();
            if !pinned {
                op.options
                    .get_or_insert_with(Document::new)
                    .insert("upsertId".to_string(), new_id());
            }
        }
        _ => {}
    }
    op
}

fn insert(docs: &mut Vec<Document>, mut doc: Document) -> EngineResult<Document> {
    let id = doc.entry("_id").or_insert_with(new_id).clone();
    if docs.iter().any(|d| d.get("_id") == Some(&id)) {
        return Err(DriverError::query(format!("duplicate key: _id {}", id)));
    }
    docs.push(doc.clone());
    Ok(doc)
}

fn remove_positions(docs: &mut Vec<Document>, positions: &[usize]) -> Vec<Value> {
    let mut removed = Vec::with_capacity(positions.len());
    for pos in positions.iter().rev() {
        let doc = docs.remove(*pos);
        removed.push(doc.get("_id").cloned().unwrap_or(Value::Null));
    }
    removed.reverse();
    removed
}

fn update(docs: &mut Vec<Document>, filter: &Document, op: &Operation) -> EngineResult<Applied> {
    let body = op
        .data
        .as_ref()
        .ok_or_else(|| DriverError::query(format!("{} requires update data", op.kind)))?;

    let mut positions = matching_positions(docs, filter)?;
    if op.kind != OperationKind::UpdateMany {
        positions.truncate(1);
    }

    let mut result = UpdateResult {
        acknowledged: true,
        matched_count: positions.len() as u64,
        ..UpdateResult::default()
    };
    let mut written = Vec::new();

    if positions.is_empty() && op.option_bool("upsert") {
        let mut seed = upsert_seed(filter);
        if op.kind == OperationKind::ReplaceOne {
            replace_document(&mut seed, body)?;
            if let Some(id) = upsert_seed(filter).get("_id") {
                seed.insert("_id".to_string(), id.clone());
            }
            if let Some(id) = op.option("upsertId") {
                seed.entry("_id").or_insert_with(|| id.clone());
            }
        } else {
            apply_update(&mut seed, body, true)?;
        }
        let doc = insert(docs, seed)?;
        result.upserted_count = 1;
        result.upserted_id = doc.get("_id").cloned();
        written.push(doc);
    } else {
        // Apply to copies first so a failing update leaves the collection untouched
        let mut staged = Vec::with_capacity(positions.len());
        for pos in &positions {
            let mut doc = docs[*pos].clone();
            let changed = if op.kind == OperationKind::ReplaceOne {
                replace_document(&mut doc, body)?
            } else {
                apply_update(&mut doc, body, false)?
            };
            staged.push((*pos, doc, changed));
        }
        for (pos, doc, changed) in staged {
            if changed {
                result.modified_count += 1;
                written.push(doc.clone());
                docs[pos] = doc;
            }
        }
    }

    Ok(Applied {
        result: OperationResult::Update(result),
        written,
        removed: Vec::new(),
    })
}

/// `findOneAnd*`: returns the pre-image unless `returnDocument: "after"`
fn find_and_modify(
    docs: &mut Vec<Document>,
    filter: &Document,
    op: &Operation,
) -> EngineResult<Applied> {
    let positions = matching_positions(docs, filter)?;
    let target = match op.option("sort") {
        Some(Value::Object(sort)) => {
            let mut ordered: Vec<Document> = positions.iter().map(|p| docs[*p].clone()).collect();
            sort_documents(&mut ordered, sort);
            ordered
                .first()
                .and_then(|first| positions.iter().copied().find(|p| &docs[*p] == first))
        }
        _ => positions.first().copied(),
    };
    let after = op.option("returnDocument").and_then(Value::as_str) == Some("after");

    let Some(pos) = target else {
        return Ok(Applied::read(OperationResult::Document(None)));
    };
    let before = docs[pos].clone();

    if op.kind == OperationKind::FindOneAndDelete {
        let removed = remove_positions(docs, &[pos]);
        return Ok(Applied {
            result: OperationResult::Document(Some(before)),
            written: Vec::new(),
            removed,
        });
    }

    let body = op
        .data
        .as_ref()
        .ok_or_else(|| DriverError::query(format!("{} requires update data", op.kind)))?;
    let mut doc = before.clone();
    let changed = if op.kind == OperationKind::FindOneAndReplace {
        replace_document(&mut doc, body)?
    } else {
        apply_update(&mut doc, body, false)?
    };
    let image = if after { doc.clone() } else { before };
    let mut written = Vec::new();
    if changed {
        docs[pos] = doc.clone();
        written.push(doc);
    }

    Ok(Applied {
        result: OperationResult::Document(Some(image)),
        written,
        removed: Vec::new(),
    })
}
