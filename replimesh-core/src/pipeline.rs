//! Aggregation pipeline evaluation
//!
//! Supported stages: `$match`, `$project`, `$sort`, `$skip`, `$limit`,
//! `$count`, `$unwind`, `$group` (accumulators `$sum`, `$avg`, `$min`, `$max`,
//! `$first`, `$last`, `$push`). Anything else is rejected.

use serde_json::{Map, Value};

use crate::document::{
    compare_values, get_path, matches, project, set_path, sort_documents, Document,
};
use crate::error::DriverError;

pub fn run_pipeline(
    mut docs: Vec<Document>,
    pipeline: &[Document],
) -> Result<Vec<Document>, DriverError> {
    for stage in pipeline {
        let (name, spec) = single_entry(stage)?;
        docs = match name.as_str() {
            "$match" => {
                let filter = as_object(spec, name)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let projection = as_object(spec, name)?;
                docs.iter()
                    .map(|doc| project(doc, projection))
                    .collect::<Result<Vec<_>, _>>()?
            }
            "$sort" => {
                sort_documents(&mut docs, as_object(spec, name)?);
                docs
            }
            "$skip" => docs.into_iter().skip(as_count(spec, name)?).collect(),
            "$limit" => docs.into_iter().take(as_count(spec, name)?).collect(),
            "$count" => {
                let field = spec
                    .as_str()
                    .ok_or_else(|| DriverError::query("$count expects a field name"))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Map::new();
                    out.insert(field.to_string(), Value::from(docs.len() as u64));
                    vec![out]
                }
            }
            "$unwind" => unwind(docs, spec)?,
            "$group" => group(docs, as_object(spec, name)?)?,
            other => {
                return Err(DriverError::query(format!(
                    "unsupported pipeline stage: {}",
                    other
                )))
            }
        };
    }
    Ok(docs)
}

fn single_entry(stage: &Document) -> Result<(&String, &Value), DriverError> {
    if stage.len() != 1 {
        return Err(DriverError::query(
            "pipeline stage must have exactly one key",
        ));
    }
    stage
        .iter()
        .next()
        .ok_or_else(|| DriverError::query("empty pipeline stage"))
}

fn as_object<'a>(spec: &'a Value, stage: &str) -> Result<&'a Document, DriverError> {
    spec.as_object()
        .ok_or_else(|| DriverError::query(format!("{} expects an object", stage)))
}

fn as_count(spec: &Value, stage: &str) -> Result<usize, DriverError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| DriverError::query(format!("{} expects a non-negative integer", stage)))
}

/// `"$field"` references resolve against the document; anything else is a literal
fn eval_expr(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(fields) => {
            let mut out = Map::new();
            for (k, v) in fields {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn unwind(docs: Vec<Document>, spec: &Value) -> Result<Vec<Document>, DriverError> {
    let path = match spec {
        Value::String(s) => s.as_str(),
        Value::Object(o) => o.get("path").and_then(Value::as_str).unwrap_or(""),
        _ => "",
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| DriverError::query("$unwind expects a '$field' path"))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, field).cloned() {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

struct Group {
    key: Value,
    members: Vec<Document>,
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>, DriverError> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| DriverError::query("$group requires an _id expression"))?;

    // Groups keep first-seen order
    let mut groups: Vec<Group> = Vec::new();
    for doc in docs {
        let key = eval_expr(&doc, key_expr);
        match groups.iter_mut().find(|g| g.key == key) {
            Some(existing) => existing.members.push(doc),
            None => groups.push(Group {
                key,
                members: vec![doc],
            }),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for g in groups {
        let mut row = Map::new();
        row.insert("_id".to_string(), g.key.clone());
        for (field, accumulator) in spec {
            if field == "_id" {
                continue;
            }
            let (op, expr) = accumulator
                .as_object()
                .and_then(|o| o.iter().next())
                .ok_or_else(|| DriverError::query(format!("invalid accumulator for {}", field)))?;
            let values: Vec<Value> = g.members.iter().map(|d| eval_expr(d, expr)).collect();
            row.insert(field.clone(), accumulate(op, values)?);
        }
        out.push(row);
    }
    Ok(out)
}

fn accumulate(op: &str, values: Vec<Value>) -> Result<Value, DriverError> {
    let numbers = || values.iter().filter_map(Value::as_f64);
    let as_number = |f: f64| {
        if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
            Value::from(f as i64)
        } else {
            Value::from(f)
        }
    };

    Ok(match op {
        "$sum" => as_number(numbers().sum()),
        "$avg" => {
            let count = numbers().count();
            if count == 0 {
                Value::Null
            } else {
                Value::from(numbers().sum::<f64>() / count as f64)
            }
        }
        "$min" => values
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        "$max" => values
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(Value::Null),
        "$first" => values.first().cloned().unwrap_or(Value::Null),
        "$last" => values.last().cloned().unwrap_or(Value::Null),
        "$push" => Value::Array(values),
        other => {
            return Err(DriverError::query(format!(
                "unsupported accumulator: {}",
                other
            )))
        }
    })
}
