//! In-process document store and the aggregation-pipeline interpreter shared by every
//! store implementation.
//!
//! [`MemoryStore`] keeps collections as ordered `Vec`s of JSON documents behind a mutex,
//! which makes sequence allocation and conditional updates atomic within one process. It
//! holds nothing across runs; the CLI persists through [`crate::sqlite::SqliteStore`],
//! which evaluates pipelines with the same interpreter.
//!
//! Supported query dialect:
//! - match: field equality (array fields match any element), `$eq $ne $gt $gte $lt $lte
//!   $in $nin $exists`, top-level `$and` / `$or`
//! - expressions: `"$field.path"` references, `$year $month $dayOfMonth $dateToString
//!   $literal $add`, nested objects of expressions
//! - project: inclusion (`1`/`true`, expressions) or exclusion (`0`/`false`) mode
//! - group accumulators: `$sum $avg $min $max $first $last $push`
//! - sort: multi-key, stable, missing fields first when ascending
//!
//! Dates are stored as RFC 3339 strings; date operators also accept epoch milliseconds.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agg::{Accumulator, Direction, GroupSpec, SortSpec, Stage};
use crate::contract::{DocumentStream, DocumentStore, Record};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct StoreData {
    collections: BTreeMap<String, Vec<Value>>,
    sequences: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every document in a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Record> {
        self.lock()
            .map(|data| data.collections.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .map(|data| data.collections.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| Error::Storage("store mutex poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(&self, collection: &str, docs: Vec<Record>) -> Result<()> {
        if docs.iter().any(|d| !d.is_object()) {
            return Err(Error::Storage(format!(
                "only objects can be stored in {collection}"
            )));
        }
        let mut data = self.lock()?;
        let count = docs.len();
        data.collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        debug!(collection, count, "[STORE] Inserted documents");
        Ok(())
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<DocumentStream> {
        let docs = self.documents(collection);
        let results = run_pipeline(docs, pipeline)?;
        debug!(
            collection,
            results = results.len(),
            "[STORE] Pipeline evaluated"
        );
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn next_sequence(&self, name: &str) -> Result<i64> {
        let mut data = self.lock()?;
        let counter = data.sequences.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn update_one(&self, collection: &str, filter: &Value, set: Value) -> Result<u64> {
        let filter = filter
            .as_object()
            .ok_or_else(|| Error::Storage("update filter must be an object".into()))?;
        let Value::Object(set) = set else {
            return Err(Error::Storage("update document must be an object".into()));
        };

        let mut data = self.lock()?;
        let Some(docs) = data.collections.get_mut(collection) else {
            return Ok(0);
        };
        for doc in docs.iter_mut() {
            if matches(doc, filter)? {
                if let Value::Object(target) = doc {
                    for (k, v) in set {
                        target.insert(k, v);
                    }
                }
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Stage]) -> Result<Vec<Value>> {
    for stage in pipeline {
        docs = match stage {
            Stage::Match(predicate) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, predicate)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            Stage::Project(fields) => docs
                .iter()
                .map(|doc| project(doc, fields))
                .collect::<Result<_>>()?,
            Stage::Group(group) => group_docs(&docs, group)?,
            Stage::Sort(sort) => {
                sort_docs(&mut docs, sort);
                docs
            }
        };
    }
    Ok(docs)
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn remove_path(target: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            target.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = target.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

pub(crate) fn matches(doc: &Value, predicate: &Map<String, Value>) -> Result<bool> {
    for (key, cond) in predicate {
        let ok = match key.as_str() {
            "$and" => each_predicate(cond)?
                .into_iter()
                .map(|p| matches(doc, p))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .all(|b| b),
            "$or" => each_predicate(cond)?
                .into_iter()
                .map(|p| matches(doc, p))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .any(|b| b),
            op if op.starts_with('$') => {
                return Err(Error::Storage(format!("unsupported match operator {op}")))
            }
            path => field_matches(get_path(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn each_predicate(cond: &Value) -> Result<Vec<&Map<String, Value>>> {
    cond.as_array()
        .ok_or_else(|| Error::Storage("$and/$or expect an array".into()))?
        .iter()
        .map(|p| {
            p.as_object()
                .ok_or_else(|| Error::Storage("$and/$or entries must be objects".into()))
        })
        .collect()
}

fn is_operator_object(cond: &Value) -> Option<&Map<String, Value>> {
    cond.as_object()
        .filter(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn field_matches(value: Option<&Value>, cond: &Value) -> Result<bool> {
    let Some(ops) = is_operator_object(cond) else {
        return Ok(equals(value, cond));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$gt" => compare_same_type(value, arg) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare_same_type(value, arg),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => compare_same_type(value, arg) == Some(Ordering::Less),
            "$lte" => matches!(
                compare_same_type(value, arg),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$in" => in_list(value, arg)?,
            "$nin" => !in_list(value, arg)?,
            "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
            other => return Err(Error::Storage(format!("unsupported operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(value: Option<&Value>, list: &Value) -> Result<bool> {
    let list = list
        .as_array()
        .ok_or_else(|| Error::Storage("$in/$nin expect an array".into()))?;
    Ok(list.iter().any(|candidate| equals(value, candidate)))
}

// Missing fields equal null; array fields match when any element does.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(v) if compare_values(v, expected) == Ordering::Equal => true,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, expected) == Ordering::Equal),
        Some(_) => false,
    }
}

fn compare_same_type(value: Option<&Value>, arg: &Value) -> Option<Ordering> {
    let value = value?;
    (type_rank(value) == type_rank(arg)).then(|| compare_values(value, arg))
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: null < numbers < strings < objects < arrays < bools.
/// Two strings that both parse as RFC 3339 timestamps compare as instants.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(dx), Ok(dy)) => dx.cmp(&dy),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y) {
                let ord = compare_values(i, j);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn to_datetime(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(m) => m.get("$date").and_then(to_datetime),
        _ => None,
    }
}

/// Evaluate an aggregation expression against one document.
fn eval(expr: &Value, doc: &Value) -> Result<Value> {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            Ok(get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            match map.iter().next() {
                Some((op, arg)) => eval_operator(op, arg, doc),
                None => Ok(Value::Null),
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), eval(v, doc)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|i| eval(i, doc)).collect::<Result<_>>()?,
        )),
        literal => Ok(literal.clone()),
    }
}

fn eval_operator(op: &str, arg: &Value, doc: &Value) -> Result<Value> {
    let date_part = |f: fn(&DateTime<Utc>) -> i64| -> Result<Value> {
        Ok(to_datetime(&eval(arg, doc)?).map_or(Value::Null, |d| json!(f(&d))))
    };
    match op {
        "$literal" => Ok(arg.clone()),
        "$year" => date_part(|d| i64::from(d.year())),
        "$month" => date_part(|d| i64::from(d.month())),
        "$dayOfMonth" => date_part(|d| i64::from(d.day())),
        "$dateToString" => {
            let format = arg
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
            let date = arg.get("date").map(|d| eval(d, doc)).transpose()?;
            Ok(date
                .as_ref()
                .and_then(to_datetime)
                .map_or(Value::Null, |d| json!(d.format(format).to_string())))
        }
        "$add" => {
            let items = arg
                .as_array()
                .ok_or_else(|| Error::Storage("$add expects an array".into()))?;
            let mut sum = NumericSum::default();
            for item in items {
                sum.add(&eval(item, doc)?);
            }
            Ok(sum.value())
        }
        other => Err(Error::Storage(format!("unsupported expression {other}"))),
    }
}

fn is_flag(v: &Value, on: bool) -> bool {
    match v {
        Value::Bool(b) => *b == on,
        Value::Number(n) => (n.as_f64() != Some(0.0)) == on,
        _ => false,
    }
}

fn project(doc: &Value, fields: &Map<String, Value>) -> Result<Value> {
    let exclusion = fields.values().all(|v| is_flag(v, false));
    let Value::Object(source) = doc else {
        return Ok(doc.clone());
    };

    if exclusion {
        let mut out = source.clone();
        for path in fields.keys() {
            remove_path(&mut out, path);
        }
        return Ok(Value::Object(out));
    }

    let mut out = Map::new();
    if !fields.contains_key("_id") {
        if let Some(id) = source.get("_id") {
            out.insert("_id".into(), id.clone());
        }
    }
    for (path, spec) in fields {
        if is_flag(spec, false) {
            continue;
        }
        if is_flag(spec, true) {
            if let Some(v) = get_path(doc, path) {
                set_path(&mut out, path, v.clone());
            }
            continue;
        }
        if let Value::String(s) = spec {
            if s.starts_with('$') && get_path(doc, &s[1..]).is_none() {
                continue;
            }
        }
        set_path(&mut out, path, eval(spec, doc)?);
    }
    Ok(Value::Object(out))
}

#[derive(Debug, Default)]
struct NumericSum {
    int: i64,
    float: f64,
    is_float: bool,
    count: usize,
}

impl NumericSum {
    fn add(&mut self, v: &Value) {
        let Value::Number(n) = v else { return };
        self.count += 1;
        match n.as_i64() {
            Some(i) if !self.is_float => match self.int.checked_add(i) {
                Some(total) => self.int = total,
                None => {
                    self.float = self.int as f64 + i as f64;
                    self.is_float = true;
                }
            },
            _ => {
                if !self.is_float {
                    self.float = self.int as f64;
                    self.is_float = true;
                }
                self.float += n.as_f64().unwrap_or(0.0);
            }
        }
    }

    fn value(&self) -> Value {
        if self.is_float {
            json!(self.float)
        } else {
            json!(self.int)
        }
    }

    fn total(&self) -> f64 {
        if self.is_float {
            self.float
        } else {
            self.int as f64
        }
    }
}

enum AccState {
    Sum(NumericSum),
    Avg(NumericSum),
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Sum(_) => AccState::Sum(NumericSum::default()),
            Accumulator::Avg(_) => AccState::Avg(NumericSum::default()),
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
            Accumulator::First(_) => AccState::First(None),
            Accumulator::Last(_) => AccState::Last(Value::Null),
            Accumulator::Push(_) => AccState::Push(Vec::new()),
        }
    }

    fn update(&mut self, v: Value) {
        match self {
            AccState::Sum(sum) | AccState::Avg(sum) => sum.add(&v),
            AccState::Min(current) => {
                if !v.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(&v, c) == Ordering::Less)
                {
                    *current = Some(v);
                }
            }
            AccState::Max(current) => {
                if !v.is_null()
                    && current
                        .as_ref()
                        .map_or(true, |c| compare_values(&v, c) == Ordering::Greater)
                {
                    *current = Some(v);
                }
            }
            AccState::First(first) => {
                first.get_or_insert(v);
            }
            AccState::Last(last) => *last = v,
            AccState::Push(items) => items.push(v),
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Sum(sum) => sum.value(),
            AccState::Avg(sum) if sum.count == 0 => Value::Null,
            AccState::Avg(sum) => json!(sum.total() / sum.count as f64),
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) => {
                v.unwrap_or(Value::Null)
            }
            AccState::Last(v) => v,
            AccState::Push(items) => Value::Array(items),
        }
    }
}

// Groups come out in order of first appearance.
fn group_docs(docs: &[Value], group: &GroupSpec) -> Result<Vec<Value>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<AccState>)> = Vec::new();

    for doc in docs {
        let key = eval(group.key(), doc)?;
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            let states = group
                .accumulators()
                .iter()
                .map(|(_, acc)| AccState::new(acc))
                .collect();
            groups.push((key.clone(), states));
            groups.len() - 1
        });
        for ((_, acc), state) in group.accumulators().iter().zip(groups[slot].1.iter_mut()) {
            state.update(eval(acc.expression(), doc)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = Map::new();
            out.insert("_id".into(), key);
            for ((name, _), state) in group.accumulators().iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

fn sort_docs(docs: &mut [Value], sort: &SortSpec) {
    docs.sort_by(|a, b| {
        for (field, direction) in sort.keys() {
            let va = get_path(a, field).unwrap_or(&Value::Null);
            let vb = get_path(b, field).unwrap_or(&Value::Null);
            let ord = compare_values(va, vb);
            let ord = match direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
