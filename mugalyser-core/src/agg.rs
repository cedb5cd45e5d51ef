//! Typed aggregation-pipeline builder.
//!
//! [`Agg`] accumulates [`Stage`]s in call order and hands them, unchanged and in order, to
//! the store's pipeline executor. The builder never filters or sorts locally.
//!
//! Stage arguments use the document-store query dialect (`{"batchID": 3}`,
//! `{"$in": [...]}`, `"$event.time"` field references, ...). Structural mistakes are
//! rejected when the stage is added, not when the store runs it:
//! - a match or project argument that is not a non-empty object
//! - a sort key repeated within one [`SortSpec`]
//! - a group accumulator named `_id` or repeated
//! - executing a pipeline with no stages

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::contract::{DocumentStream, DocumentStore};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i64(self) -> i64 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

/// Ordered sort keys; the first key is the primary one.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    keys: Vec<(String, Direction)>,
}

impl SortSpec {
    /// Start a spec with one ascending key.
    pub fn new(field: impl Into<String>) -> Self {
        Self::with_direction(field, Direction::Ascending)
    }

    pub fn with_direction(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            keys: vec![(field.into(), direction)],
        }
    }

    /// Append an ascending key.
    pub fn add(self, field: impl Into<String>) -> Result<Self> {
        self.add_with(field, Direction::Ascending)
    }

    pub fn add_with(mut self, field: impl Into<String>, direction: Direction) -> Result<Self> {
        let field = field.into();
        if self.keys.iter().any(|(existing, _)| *existing == field) {
            return Err(Error::BuilderMisuse(format!(
                "sort field {field:?} specified twice"
            )));
        }
        self.keys.push((field, direction));
        Ok(self)
    }

    pub fn keys(&self) -> &[(String, Direction)] {
        &self.keys
    }

    fn to_document(&self) -> Value {
        let map: Map<String, Value> = self
            .keys
            .iter()
            .map(|(field, dir)| (field.clone(), json!(dir.as_i64())))
            .collect();
        Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Value),
    Avg(Value),
    Min(Value),
    Max(Value),
    First(Value),
    Last(Value),
    Push(Value),
}

impl Accumulator {
    pub fn operator(&self) -> &'static str {
        match self {
            Accumulator::Sum(_) => "$sum",
            Accumulator::Avg(_) => "$avg",
            Accumulator::Min(_) => "$min",
            Accumulator::Max(_) => "$max",
            Accumulator::First(_) => "$first",
            Accumulator::Last(_) => "$last",
            Accumulator::Push(_) => "$push",
        }
    }

    pub fn expression(&self) -> &Value {
        match self {
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e)
            | Accumulator::Push(e) => e,
        }
    }
}

/// A `$group` stage: the grouping key expression plus named accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    key: Value,
    accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    /// `key` is any expression: a field reference (`"$event.group.urlname"`), an object of
    /// expressions, or `null` to group everything together.
    pub fn new(key: Value) -> Self {
        Self {
            key,
            accumulators: Vec::new(),
        }
    }

    pub fn accumulate(mut self, name: impl Into<String>, acc: Accumulator) -> Self {
        self.accumulators.push((name.into(), acc));
        self
    }

    pub fn sum(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Sum(expr))
    }

    /// Number of documents in each group.
    pub fn count(self, name: impl Into<String>) -> Self {
        self.accumulate(name, Accumulator::Sum(json!(1)))
    }

    pub fn avg(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Avg(expr))
    }

    pub fn min(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Min(expr))
    }

    pub fn max(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Max(expr))
    }

    pub fn first(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::First(expr))
    }

    pub fn last(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Last(expr))
    }

    pub fn push(self, name: impl Into<String>, expr: Value) -> Self {
        self.accumulate(name, Accumulator::Push(expr))
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn accumulators(&self) -> &[(String, Accumulator)] {
        &self.accumulators
    }

    fn validate(&self) -> Result<()> {
        for (i, (name, _)) in self.accumulators.iter().enumerate() {
            if name == "_id" {
                return Err(Error::BuilderMisuse(
                    "group accumulator may not be named _id".into(),
                ));
            }
            if self.accumulators[..i].iter().any(|(n, _)| n == name) {
                return Err(Error::BuilderMisuse(format!(
                    "group accumulator {name:?} specified twice"
                )));
            }
        }
        Ok(())
    }

    fn to_document(&self) -> Value {
        let mut map = Map::new();
        map.insert("_id".into(), self.key.clone());
        for (name, acc) in &self.accumulators {
            let mut op = Map::new();
            op.insert(acc.operator().to_string(), acc.expression().clone());
            map.insert(name.clone(), Value::Object(op));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Map<String, Value>),
    Project(Map<String, Value>),
    Group(GroupSpec),
    Sort(SortSpec),
}

impl Stage {
    /// Native pipeline encoding, e.g. `{"$match": {...}}`.
    pub fn to_document(&self) -> Value {
        match self {
            Stage::Match(predicate) => json!({ "$match": predicate }),
            Stage::Project(fields) => json!({ "$project": fields }),
            Stage::Group(group) => json!({ "$group": group.to_document() }),
            Stage::Sort(sort) => json!({ "$sort": sort.to_document() }),
        }
    }
}

fn non_empty_object(stage: &str, value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) if !map.is_empty() => Ok(map),
        other => Err(Error::BuilderMisuse(format!(
            "{stage} stage expects a non-empty object, got {other}"
        ))),
    }
}

/// Pipeline accumulator bound to one collection of a store.
///
/// Build and execute from a single owner; the `&mut self` builders enforce that.
pub struct Agg {
    store: Arc<dyn DocumentStore>,
    collection: String,
    stages: Vec<Stage>,
}

impl Agg {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            stages: Vec::new(),
        }
    }

    pub fn add_match(&mut self, predicate: Value) -> Result<&mut Self> {
        let predicate = non_empty_object("match", predicate)?;
        self.stages.push(Stage::Match(predicate));
        Ok(self)
    }

    pub fn add_project(&mut self, fields: Value) -> Result<&mut Self> {
        let fields = non_empty_object("project", fields)?;
        self.stages.push(Stage::Project(fields));
        Ok(self)
    }

    pub fn add_group(&mut self, group: GroupSpec) -> Result<&mut Self> {
        group.validate()?;
        self.stages.push(Stage::Group(group));
        Ok(self)
    }

    pub fn add_sort(&mut self, sort: SortSpec) -> &mut Self {
        self.stages.push(Stage::Sort(sort));
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn to_pipeline(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_document).collect())
    }

    /// Submit the stages, in order, to the store and return its result stream.
    pub async fn execute(&self) -> Result<DocumentStream> {
        if self.stages.is_empty() {
            return Err(Error::BuilderMisuse(format!(
                "empty pipeline executed against {}",
                self.collection
            )));
        }
        debug!(
            collection = %self.collection,
            stages = self.stages.len(),
            pipeline = %self,
            "[AGG] Executing pipeline"
        );
        self.store.aggregate(&self.collection, &self.stages).await
    }
}

impl fmt::Display for Agg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_pipeline())
    }
}
