//! Document evaluation shared by the drivers
//!
//! Implements the subset of document-query semantics the drivers need:
//! filter matching, update operators, replacement, projection and sorting.
//! Values are compared without type coercion: `"123"` never equals `123`.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::DriverError;

/// A JSON object document
pub type Document = Map<String, Value>;

/// Resolve a dotted path (`address.city`) inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Remove a dotted path. Returns true when something was removed.
pub fn remove_path(doc: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => doc.remove(path).is_some(),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(inner)) => remove_path(inner, rest),
            _ => false,
        },
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Checks whether a document matches a filter (AND across all keys)
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, DriverError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_clauses(doc, condition)?,
            "$or" => any_clause(doc, condition)?,
            "$nor" => !any_clause(doc, condition)?,
            field if field.starts_with('$') => {
                return Err(DriverError::query(format!(
                    "unknown top-level operator: {}",
                    field
                )))
            }
            field => field_matches(get_path(doc, field), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(condition: &Value) -> Result<Vec<&Document>, DriverError> {
    let items = condition
        .as_array()
        .ok_or_else(|| DriverError::query("logical operator expects an array"))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| DriverError::query("logical clause must be an object"))
        })
        .collect()
}

fn all_clauses(doc: &Document, condition: &Value) -> Result<bool, DriverError> {
    for clause in clauses(condition)? {
        if !matches(doc, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_clause(doc: &Document, condition: &Value) -> Result<bool, DriverError> {
    for clause in clauses(condition)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> Result<bool, DriverError> {
    if !is_operator_object(condition) {
        return Ok(eq_match(actual, condition));
    }

    let Value::Object(ops) = condition else {
        return Ok(false);
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_match(actual, operand),
            "$ne" => !eq_match(actual, operand),
            "$gt" => compare_match(actual, operand, |o| o == Ordering::Greater),
            "$gte" => compare_match(actual, operand, |o| o != Ordering::Less),
            "$lt" => compare_match(actual, operand, |o| o == Ordering::Less),
            "$lte" => compare_match(actual, operand, |o| o != Ordering::Greater),
            "$in" => in_match(actual, operand)?,
            "$nin" => !in_match(actual, operand)?,
            "$exists" => {
                let wanted = operand.as_bool().unwrap_or(true);
                actual.is_some() == wanted
            }
            "$size" => match (actual, operand.as_u64()) {
                (Some(Value::Array(items)), Some(n)) => items.len() as u64 == n,
                _ => false,
            },
            "$not" => !field_matches(actual, operand)?,
            other => {
                return Err(DriverError::query(format!(
                    "unknown filter operator: {}",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality without coercion. An array field matches when any element equals
/// the expected scalar; a missing field matches only `null`.
fn eq_match(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) if value == expected => true,
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|v| v == expected),
        Some(Value::Number(a)) => match expected {
            Value::Number(b) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        _ => false,
    }
}

fn compare_match(actual: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| same_class(item, bound) && accept(compare_values(item, bound))),
        _ => same_class(actual, bound) && accept(compare_values(actual, bound)),
    }
}

// Range operators only compare within a type class
fn same_class(a: &Value, b: &Value) -> bool {
    type_order(a) == type_order(b)
}

fn in_match(actual: Option<&Value>, operand: &Value) -> Result<bool, DriverError> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| DriverError::query("$in/$nin expects an array"))?;
    Ok(candidates.iter().any(|candidate| eq_match(actual, candidate)))
}

// ============================================================================
// Ordering
// ============================================================================

fn type_order(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: null < numbers < strings < objects < arrays < booleans
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (a_type, b_type) = (type_order(a), type_order(b));
    if a_type != b_type {
        return a_type.cmp(&b_type);
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(0.0);
            let yf = y.as_f64().unwrap_or(0.0);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Stable sort by a `{field: 1 | -1, ...}` specification
pub fn sort_documents(docs: &mut [Document], spec: &Document) {
    let keys: Vec<(&String, bool)> = spec
        .iter()
        .map(|(field, dir)| (field, dir.as_i64().unwrap_or(1) >= 0))
        .collect();

    docs.sort_by(|a, b| {
        for (field, ascending) in &keys {
            let ord = match (get_path(a, field), get_path(b, field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare_values(x, y),
            };
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// ============================================================================
// Projection
// ============================================================================

/// Apply an inclusion or exclusion projection. `_id` is kept unless excluded.
pub fn project(doc: &Document, projection: &Document) -> Result<Document, DriverError> {
    let flag = |v: &Value| match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    };

    let includes: Vec<&String> = projection
        .iter()
        .filter(|(k, v)| k.as_str() != "_id" && flag(v))
        .map(|(k, _)| k)
        .collect();
    let excludes: Vec<&String> = projection
        .iter()
        .filter(|(k, v)| k.as_str() != "_id" && !flag(v))
        .map(|(k, _)| k)
        .collect();

    if !includes.is_empty() && !excludes.is_empty() {
        return Err(DriverError::query(
            "projection cannot mix inclusion and exclusion",
        ));
    }

    let keep_id = projection.get("_id").map(flag).unwrap_or(true);

    let mut out = if includes.is_empty() {
        let mut copy = doc.clone();
        for field in excludes {
            remove_path(&mut copy, field);
        }
        copy
    } else {
        let mut picked = Document::new();
        if let Some(id) = doc.get("_id") {
            picked.insert("_id".to_string(), id.clone());
        }
        for field in includes {
            if let Some(value) = get_path(doc, field) {
                set_path(&mut picked, field, value.clone());
            }
        }
        picked
    };

    if !keep_id {
        out.remove("_id");
    }
    Ok(out)
}

// ============================================================================
// Updates
// ============================================================================

/// Apply an operator update (`$set`, `$unset`, `$inc`, `$push`, ...).
///
/// Returns whether the document changed. `is_insert` enables `$setOnInsert`.
pub fn apply_update(doc: &mut Document, update: &Value, is_insert: bool) -> Result<bool, DriverError> {
    let ops = update
        .as_object()
        .ok_or_else(|| DriverError::query("update must be an object"))?;
    if ops.is_empty() || !ops.keys().all(|k| k.starts_with('$')) {
        return Err(DriverError::query(
            "update document requires atomic operators",
        ));
    }

    let before = doc.clone();

    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| DriverError::query(format!("{} expects an object", op)))?;
        for (path, value) in fields {
            if path == "_id" && op != "$setOnInsert" {
                return Err(DriverError::query("the _id field is immutable"));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$setOnInsert" => {
                    if is_insert {
                        set_path(doc, path, value.clone());
                    }
                }
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => {
                    let delta = value
                        .as_f64()
                        .ok_or_else(|| DriverError::query("$inc expects a number"))?;
                    let next = match get_path(doc, path) {
                        None => value.clone(),
                        Some(Value::Number(current)) => {
                            match (current.as_i64(), value.as_i64()) {
                                (Some(a), Some(b)) => Value::from(a + b),
                                _ => Value::from(current.as_f64().unwrap_or(0.0) + delta),
                            }
                        }
                        Some(_) => {
                            return Err(DriverError::query(format!(
                                "cannot $inc non-numeric field {}",
                                path
                            )))
                        }
                    };
                    set_path(doc, path, next);
                }
                "$push" => {
                    let mut items = match get_path(doc, path) {
                        None => Vec::new(),
                        Some(Value::Array(items)) => items.clone(),
                        Some(_) => {
                            return Err(DriverError::query(format!(
                                "cannot $push to non-array field {}",
                                path
                            )))
                        }
                    };
                    match value.as_object().and_then(|o| o.get("$each")) {
                        Some(Value::Array(each)) => items.extend(each.iter().cloned()),
                        _ => items.push(value.clone()),
                    }
                    set_path(doc, path, Value::Array(items));
                }
                "$pull" => {
                    if let Some(Value::Array(items)) = get_path(doc, path) {
                        let kept: Vec<Value> =
                            items.iter().filter(|v| *v != value).cloned().collect();
                        set_path(doc, path, Value::Array(kept));
                    }
                }
                other => {
                    return Err(DriverError::query(format!(
                        "unknown update operator: {}",
                        other
                    )))
                }
            }
        }
    }

    Ok(*doc != before)
}

/// Replace a document's body, keeping its `_id`
pub fn replace_document(doc: &mut Document, replacement: &Value) -> Result<bool, DriverError> {
    let body = replacement
        .as_object()
        .ok_or_else(|| DriverError::query("replacement must be an object"))?;
    if body.keys().any(|k| k.starts_with('$')) {
        return Err(DriverError::query(
            "replacement document must not contain update operators",
        ));
    }

    let id = doc.get("_id").cloned();
    if let (Some(id), Some(new_id)) = (&id, body.get("_id")) {
        if id != new_id {
            return Err(DriverError::query("the _id field is immutable"));
        }
    }

    let mut next = body.clone();
    if let Some(id) = id {
        next.insert("_id".to_string(), id);
    }
    let changed = next != *doc;
    *doc = next;
    Ok(changed)
}

/// Seed document for an upsert: the plain equality fields of the filter
pub fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Value::Object(ops) if is_operator_object(condition) => {
                if let Some(value) = ops.get("$eq") {
                    set_path(&mut seed, key, value.clone());
                }
            }
            value => set_path(&mut seed, key, value.clone()),
        }
    }
    seed
}
