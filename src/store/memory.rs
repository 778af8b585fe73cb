//! In-memory document store with a Mongo-dialect aggregation interpreter.
//!
//! Backs the test suite and single-node deployments. Collections are plain
//! vectors behind one `RwLock`; every operation completes synchronously, so
//! the lock is never held across an await point.

use super::{DocumentStore, FindOptions, cmp_values, lookup_path, matches_filter};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Value>>> {
        self.collections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Value>>> {
        self.collections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        self.write().entry(collection.to_string()).or_default().push(doc);
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>> {
        Ok(self
            .read()
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches_filter(d, filter)).cloned()))
    }

    async fn find_many(&self, collection: &str, options: FindOptions) -> Result<Vec<Value>> {
        let mut docs: Vec<Value> = self
            .read()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches_filter(d, &options.filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !options.sort.is_empty() {
            sort_docs(&mut docs, &options.sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let docs = docs.into_iter().skip(skip);
        Ok(match options.limit {
            Some(limit) => docs.take(limit as usize).collect(),
            None => docs.collect(),
        })
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64> {
        Ok(self
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches_filter(d, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn update_one(&self, collection: &str, filter: &Value, update: &Value) -> Result<bool> {
        let mut collections = self.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let Some(doc) = docs.iter_mut().find(|d| matches_filter(d, filter)) else {
            return Ok(false);
        };
        apply_update(doc, update)?;
        Ok(true)
    }

    async fn upsert(&self, collection: &str, filter: &Value, doc: Value) -> Result<()> {
        let mut collections = self.write();
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| matches_filter(d, filter)) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64> {
        let mut collections = self.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !matches_filter(d, filter));
        Ok((before - docs.len()) as u64)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>> {
        let collections = self.read();
        let docs = collections.get(collection).cloned().unwrap_or_default();
        run_pipeline(docs, pipeline, &collections)
    }
}

fn sort_docs(docs: &mut [Value], keys: &[(String, i32)]) {
    docs.sort_by(|a, b| {
        for (path, direction) in keys {
            let av = lookup_path(a, path).unwrap_or(&Value::Null);
            let bv = lookup_path(b, path).unwrap_or(&Value::Null);
            let ordering = cmp_values(av, bv);
            if ordering != std::cmp::Ordering::Equal {
                return if *direction < 0 { ordering.reverse() } else { ordering };
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Apply a `$set`/`$inc` update document. Dotted paths create intermediate
/// objects as needed.
fn apply_update(doc: &mut Value, update: &Value) -> Result<()> {
    let Some(operations) = update.as_object() else {
        bail!("update must be an object");
    };
    for (op, fields) in operations {
        let fields = fields
            .as_object()
            .ok_or_else(|| anyhow!("{op} operand must be an object"))?;
        for (path, operand) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone()),
                "$inc" => {
                    let current = lookup_path(doc, path)
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let delta = operand.as_f64().unwrap_or(0.0);
                    let next = current + delta;
                    // Keep integers integral so counters round-trip.
                    let next = if next.fract() == 0.0 {
                        json!(next as i64)
                    } else {
                        json!(next)
                    };
                    set_path(doc, path, next);
                }
                other => bail!("unsupported update operator {other}"),
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = json!({});
        }
        let map = current.as_object_mut().expect("just coerced to object");
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| json!({}));
    }
}

// ---------------------------------------------------------------------------
// Aggregation interpreter
// ---------------------------------------------------------------------------

fn run_pipeline(
    mut docs: Vec<Value>,
    pipeline: &[Value],
    collections: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    for stage in pipeline {
        let stage = stage
            .as_object()
            .ok_or_else(|| anyhow!("pipeline stage must be an object"))?;
        let (op, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| anyhow!("empty pipeline stage"))?;
        docs = match op.as_str() {
            "$match" => docs
                .into_iter()
                .filter(|d| matches_filter(d, spec))
                .collect(),
            "$group" => group_stage(&docs, spec)?,
            "$sort" => {
                let keys: Vec<(String, i32)> = spec
                    .as_object()
                    .ok_or_else(|| anyhow!("$sort spec must be an object"))?
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(1) as i32))
                    .collect();
                sort_docs(&mut docs, &keys);
                docs
            }
            "$skip" => {
                let n = spec.as_u64().unwrap_or(0) as usize;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = spec.as_u64().unwrap_or(0) as usize;
                docs.into_iter().take(n).collect()
            }
            "$project" => docs.iter().map(|d| project_doc(d, spec)).collect(),
            "$count" => {
                let name = spec.as_str().unwrap_or("count");
                let mut counted = Map::new();
                counted.insert(name.to_string(), json!(docs.len()));
                vec![Value::Object(counted)]
            }
            "$unwind" => unwind_stage(docs, spec)?,
            "$lookup" => lookup_stage(docs, spec, collections)?,
            other => bail!("unsupported pipeline stage {other}"),
        };
    }
    Ok(docs)
}

/// Evaluate a group/projection expression against a document.
fn eval_expr(doc: &Value, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            lookup_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(map) => {
            if let Some(spec) = map.get("$dateTrunc") {
                return date_trunc(doc, spec);
            }
            // Compound expression: evaluate each field.
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), eval_expr(doc, v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Truncate a date expression to the start of its period. Weeks start on
/// Monday; months truncate to day 1; years to January 1.
fn date_trunc(doc: &Value, spec: &Value) -> Value {
    let Some(spec) = spec.as_object() else {
        return Value::Null;
    };
    let date = spec.get("date").map(|e| eval_expr(doc, e));
    let Some(raw) = date.as_ref().and_then(Value::as_str) else {
        return Value::Null;
    };
    // Accept plain dates and RFC 3339 timestamps (date prefix).
    let Ok(date) = NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d") else {
        return Value::Null;
    };
    let unit = spec.get("unit").and_then(Value::as_str).unwrap_or("day");
    let truncated = match unit {
        "week" => date - chrono::Days::new(u64::from(date.weekday().num_days_from_monday())),
        "month" => date.with_day(1).unwrap_or(date),
        "year" => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        _ => date,
    };
    Value::String(truncated.format("%Y-%m-%d").to_string())
}

enum Accumulator {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    AddToSet(Vec<Value>),
    First(Option<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Self::Sum(0.0),
            "$avg" => Self::Avg { sum: 0.0, count: 0 },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$addToSet" => Self::AddToSet(Vec::new()),
            "$first" => Self::First(None),
            other => bail!("unsupported accumulator {other}"),
        })
    }

    fn push(&mut self, value: Value) {
        match self {
            Self::Sum(total) => *total += value.as_f64().unwrap_or(0.0),
            Self::Avg { sum, count } => {
                // Mongo's $avg skips non-numeric inputs entirely.
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            Self::Min(current) => {
                if value != Value::Null
                    && current
                        .as_ref()
                        .is_none_or(|c| cmp_values(&value, c) == std::cmp::Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Self::Max(current) => {
                if value != Value::Null
                    && current
                        .as_ref()
                        .is_none_or(|c| cmp_values(&value, c) == std::cmp::Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Self::AddToSet(values) => {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            Self::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum(total) => {
                if total.fract() == 0.0 && total.abs() < 9e15 {
                    json!(total as i64)
                } else {
                    json!(total)
                }
            }
            Self::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    json!(sum / count as f64)
                }
            }
            Self::Min(v) | Self::Max(v) | Self::First(v) => v.unwrap_or(Value::Null),
            Self::AddToSet(values) => Value::Array(values),
        }
    }
}

fn group_stage(docs: &[Value], spec: &Value) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| anyhow!("$group spec must be an object"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| anyhow!("$group requires _id"))?;

    // Keep first-seen group order so downstream stages see deterministic
    // input; callers that need a specific order sort explicitly.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Value, Vec<(String, Accumulator)>)> = HashMap::new();

    for doc in docs {
        let key = eval_expr(doc, id_expr);
        let key_repr = key.to_string();
        if !groups.contains_key(&key_repr) {
            let mut accumulators = Vec::new();
            for (field, acc_spec) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
                let acc_spec = acc_spec
                    .as_object()
                    .ok_or_else(|| anyhow!("accumulator for {field} must be an object"))?;
                let (op, _) = acc_spec
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow!("empty accumulator for {field}"))?;
                accumulators.push((field.clone(), Accumulator::new(op)?));
            }
            order.push(key_repr.clone());
            groups.insert(key_repr.clone(), (key, accumulators));
        }

        let (_, accumulators) = groups.get_mut(&key_repr).expect("group just inserted");
        for (field, accumulator) in accumulators.iter_mut() {
            let acc_spec = spec[field].as_object().expect("validated above");
            let (_, operand) = acc_spec.iter().next().expect("validated above");
            accumulator.push(eval_expr(doc, operand));
        }
    }

    Ok(order
        .into_iter()
        .map(|key_repr| {
            let (key, accumulators) = groups.remove(&key_repr).expect("ordered key present");
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for (field, accumulator) in accumulators {
                out.insert(field, accumulator.finish());
            }
            Value::Object(out)
        })
        .collect())
}

fn project_doc(doc: &Value, spec: &Value) -> Value {
    let Some(spec) = spec.as_object() else {
        return doc.clone();
    };
    let inclusion = spec
        .iter()
        .any(|(k, v)| k != "_id" && (v == &json!(1) || v == &json!(true) || v.is_string()));

    if inclusion {
        let mut out = Map::new();
        // _id is carried unless explicitly excluded.
        if spec.get("_id").is_none_or(|v| v != &json!(0)) {
            if let Some(id) = lookup_path(doc, "_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (field, selector) in spec {
            if field == "_id" {
                continue;
            }
            match selector {
                Value::Number(n) if n.as_i64() == Some(0) => {}
                Value::Bool(false) => {}
                Value::Number(_) | Value::Bool(true) => {
                    if let Some(v) = lookup_path(doc, field) {
                        out.insert(field.clone(), v.clone());
                    }
                }
                expr => {
                    out.insert(field.clone(), eval_expr(doc, expr));
                }
            }
        }
        Value::Object(out)
    } else {
        let mut out = doc.as_object().cloned().unwrap_or_default();
        for field in spec.keys() {
            out.remove(field);
        }
        Value::Object(out)
    }
}

fn unwind_stage(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let path = match spec {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("$unwind object form requires path"))?,
        _ => bail!("$unwind spec must be a string or object"),
    };
    let path = path.strip_prefix('$').unwrap_or(path);

    let mut out = Vec::new();
    for doc in docs {
        match lookup_path(&doc, path).cloned() {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut clone = doc.clone();
                    set_path(&mut clone, path, item);
                    out.push(clone);
                }
            }
            // Missing and non-array fields are dropped, matching Mongo.
            _ => {}
        }
    }
    Ok(out)
}

fn lookup_stage(
    docs: Vec<Value>,
    spec: &Value,
    collections: &HashMap<String, Vec<Value>>,
) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| anyhow!("$lookup spec must be an object"))?;
    let from = spec
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("$lookup requires from"))?;
    let local = spec
        .get("localField")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("$lookup requires localField"))?;
    let foreign = spec
        .get("foreignField")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("$lookup requires foreignField"))?;
    let target = spec
        .get("as")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("$lookup requires as"))?;

    let foreign_docs = collections.get(from).cloned().unwrap_or_default();
    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let local_value = lookup_path(&doc, local).cloned().unwrap_or(Value::Null);
            let matched: Vec<Value> = foreign_docs
                .iter()
                .filter(|f| {
                    lookup_path(f, foreign)
                        .map(|fv| cmp_values(fv, &local_value) == std::cmp::Ordering::Equal)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            set_path(&mut doc, target, Value::Array(matched));
            doc
        })
        .collect())
}
