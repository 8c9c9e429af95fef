//! In-memory record store loaded from a JSON fixture
//!
//! Rows live in one table per base model (single-table inheritance), keyed by
//! the schema's primary key. The store honors the transaction contract of
//! [`RecordStore`]: records built while a transaction is open (`Model.new`)
//! are removed again on rollback. Batches running on clones of one store
//! take turns: `begin_transaction` blocks until the open batch rolls back.
//!
//! Fixture format:
//!
//! ```json
//! {
//!   "schema": { "models": { "Todo": { "columns": { "title": "string" } } } },
//!   "records": { "Todo": [ { "id": 1, "title": "write docs" } ] }
//! }
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::{Collection, Datum, Model, Navigable, Record, RecordStore};
use crate::error::{Result, SyncError};
use crate::scalar::Scalar;
use crate::schema::{AggregateReflection, AssociationKind, Schema, ScopeSchema};

type Row = IndexMap<String, Scalar>;

/// Schema plus seed rows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    pub schema: Schema,
    #[serde(default)]
    pub records: IndexMap<String, Vec<Row>>,
}

impl Fixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Default)]
struct TxLog {
    /// (table, primary key) of every row created inside the transaction
    created: Vec<(String, Scalar)>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    next_id: i64,
    transaction: Option<TxLog>,
}

#[derive(Debug)]
struct Inner {
    schema: Schema,
    state: RwLock<State>,
    /// Set while a batch holds the store
    batch_open: Mutex<bool>,
    batch_done: Condvar,
}

/// Ephemeral store backing the CLI and the tests
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("models", &self.inner.schema.models.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Build a store from a fixture. Every seed row needs a primary key.
    pub fn from_fixture(fixture: Fixture) -> Result<Self> {
        let Fixture { schema, records } = fixture;
        schema.validate()?;

        let mut state = State::default();
        let mut max_id = 0;

        for (model, rows) in records {
            if !schema.contains(&model) {
                return Err(SyncError::Config(format!("records given for unknown model {}", model)));
            }
            let table = schema.base_model(&model).to_string();
            let pk = schema.primary_key(&model).to_string();
            let type_column = schema.inheritance_column(&model).to_string();

            for mut row in rows {
                let id = row.get(&pk).cloned().unwrap_or_default();
                if id.is_nil() {
                    return Err(SyncError::Config(format!("{} row without {}", model, pk)));
                }
                if let Some(i) = id.as_i64() {
                    max_id = max_id.max(i);
                }
                if model != table && !row.contains_key(&type_column) {
                    row.insert(type_column.clone(), Scalar::Str(model.clone()));
                }
                state.tables.entry(table.clone()).or_default().push(row);
            }
        }
        state.next_id = max_id + 1;

        Ok(MemoryStore {
            inner: Arc::new(Inner {
                schema,
                state: RwLock::new(state),
                batch_open: Mutex::new(false),
                batch_done: Condvar::new(),
            }),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_fixture(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_fixture(Fixture::from_file(path)?)
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Number of rows of `model` (including subclasses)
    pub fn record_count(&self, model: &str) -> usize {
        self.inner.rows_of(model).len()
    }

    /// Look up a record by primary key
    pub fn find(&self, model: &str, id: &Scalar) -> Option<Arc<dyn Record>> {
        let row = self.inner.find_row(model, id)?;
        Some(self.inner.record(model, row))
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.read().transaction.is_some()
    }
}

impl RecordStore for MemoryStore {
    fn model(&self, name: &str) -> Option<Arc<dyn Model>> {
        if !self.inner.schema.contains(name) {
            return None;
        }
        Some(Arc::new(MemoryModel {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }))
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut open = self.inner.batch_open.lock().unwrap_or_else(|e| e.into_inner());
        while *open {
            open = self.inner.batch_done.wait(open).unwrap_or_else(|e| e.into_inner());
        }
        *open = true;
        self.inner.write().transaction = Some(TxLog::default());
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        {
            let mut state = self.inner.write();
            let log = state
                .transaction
                .take()
                .ok_or_else(|| SyncError::Store("no open transaction".to_string()))?;
            let pk_of = |table: &str| self.inner.schema.primary_key(table).to_string();
            for (table, id) in log.created {
                let pk = pk_of(&table);
                if let Some(rows) = state.tables.get_mut(&table) {
                    rows.retain(|row| !same_id(row.get(&pk), &id));
                }
            }
        }
        *self.inner.batch_open.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.inner.batch_done.notify_one();
        Ok(())
    }
}

fn same_id(value: Option<&Scalar>, id: &Scalar) -> bool {
    value.is_some_and(|v| v.key_string() == id.key_string())
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Concrete model of a row: its type discriminator when that names a
    /// subclass of the table, the table model otherwise.
    fn row_model(&self, table: &str, row: &Row) -> String {
        let column = self.schema.inheritance_column(table);
        match row.get(column) {
            Some(Scalar::Str(t)) if self.schema.is_a(t, table) => t.clone(),
            _ => table.to_string(),
        }
    }

    fn rows_of(&self, model: &str) -> Vec<Row> {
        let table = self.schema.base_model(model);
        let state = self.read();
        state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| self.schema.is_a(&self.row_model(table, row), model))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn find_row(&self, model: &str, id: &Scalar) -> Option<Row> {
        let pk = self.schema.primary_key(model);
        self.rows_of(model).into_iter().find(|row| same_id(row.get(pk), id))
    }

    fn record(self: &Arc<Self>, model: &str, row: Row) -> Arc<dyn Record> {
        let table = self.schema.base_model(model).to_string();
        let model = self.row_model(&table, &row);
        Arc::new(MemoryRecord {
            inner: Arc::clone(self),
            model,
            row,
        })
    }

    fn collection(self: &Arc<Self>, model: &str, rows: Vec<Row>) -> Datum {
        Datum::Collection(Arc::new(MemoryCollection {
            inner: Arc::clone(self),
            model: model.to_string(),
            rows,
        }))
    }

    /// Build an unsaved record. It receives a provisional key so rollback
    /// can find it again.
    fn build(self: &Arc<Self>, model: &str) -> Arc<dyn Record> {
        let table = self.schema.base_model(model).to_string();
        let pk = self.schema.primary_key(model).to_string();
        let mut row = Row::new();
        {
            let mut state = self.write();
            let id = Scalar::Int(state.next_id);
            state.next_id += 1;
            row.insert(pk, id.clone());
            if model != table {
                row.insert(
                    self.schema.inheritance_column(model).to_string(),
                    Scalar::Str(model.to_string()),
                );
            }
            if let Some(log) = state.transaction.as_mut() {
                log.created.push((table.clone(), id));
            }
            state.tables.entry(table).or_default().push(row.clone());
        }
        self.record(model, row)
    }

    fn apply_scope(&self, model: &str, scope: &ScopeSchema, args: &[Json], rows: Vec<Row>) -> anyhow::Result<Vec<Row>> {
        if args.len() != scope.params.len() {
            bail!(
                "wrong number of arguments for scope on {} (given {}, expected {})",
                model,
                args.len(),
                scope.params.len()
            );
        }
        let mut conditions: Vec<(&str, Scalar)> = scope
            .conditions
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        for (param, arg) in scope.params.iter().zip(args) {
            conditions.push((param.as_str(), Scalar::from_json(arg)));
        }

        let mut rows: Vec<Row> = rows
            .into_iter()
            .filter(|row| {
                conditions
                    .iter()
                    .all(|(column, expected)| row.get(*column).cloned().unwrap_or_default() == *expected)
            })
            .collect();

        if let Some(order) = &scope.order {
            rows.sort_by(|a, b| compare_scalars(a.get(order), b.get(order)));
        }
        Ok(rows)
    }
}

fn compare_scalars(a: Option<&Scalar>, b: Option<&Scalar>) -> Ordering {
    match (a, b) {
        (Some(Scalar::Int(x)), Some(Scalar::Int(y))) => x.cmp(y),
        (Some(Scalar::Float(x)), Some(Scalar::Float(y))) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Some(Scalar::Date(x)), Some(Scalar::Date(y))) => x.cmp(y),
        (Some(Scalar::Time(x)), Some(Scalar::Time(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn first_arg(method: &str, args: &[Json]) -> anyhow::Result<Scalar> {
    args.first()
        .map(Scalar::from_json)
        .ok_or_else(|| anyhow!("{} expects an argument", method))
}

struct MemoryModel {
    inner: Arc<Inner>,
    name: String,
}

impl fmt::Debug for MemoryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Model for MemoryModel {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Navigable for MemoryModel {
    fn invoke(&self, method: &str, args: &[Json]) -> anyhow::Result<Datum> {
        let inner = &self.inner;
        match method {
            "find" => {
                let id = first_arg(method, args)?;
                match inner.find_row(&self.name, &id) {
                    Some(row) => Ok(Datum::Record(inner.record(&self.name, row))),
                    None => bail!("Couldn't find {} with id={}", self.name, id),
                }
            }
            "new" => Ok(Datum::Record(inner.build(&self.name))),
            "all" | "unscoped" => Ok(inner.collection(&self.name, inner.rows_of(&self.name))),
            "find_by" => {
                let conditions = args
                    .first()
                    .and_then(Json::as_object)
                    .ok_or_else(|| anyhow!("find_by expects a hash of conditions"))?;
                let found = inner.rows_of(&self.name).into_iter().find(|row| {
                    conditions.iter().all(|(column, value)| {
                        row.get(column).cloned().unwrap_or_default() == Scalar::from_json(value)
                    })
                });
                Ok(found.map(|row| Datum::Record(inner.record(&self.name, row))).unwrap_or_default())
            }
            _ => {
                if let Some(column) = method.strip_prefix("find_by_") {
                    let value = first_arg(method, args)?;
                    let found = inner
                        .rows_of(&self.name)
                        .into_iter()
                        .find(|row| row.get(column).cloned().unwrap_or_default() == value);
                    return Ok(found.map(|row| Datum::Record(inner.record(&self.name, row))).unwrap_or_default());
                }
                if let Some(scope) = inner.schema.scope(&self.name, method) {
                    let rows = inner.apply_scope(&self.name, scope, args, inner.rows_of(&self.name))?;
                    return Ok(inner.collection(&self.name, rows));
                }
                bail!("undefined method `{}' for {}", method, self.name)
            }
        }
    }
}

struct MemoryRecord {
    inner: Arc<Inner>,
    model: String,
    row: Row,
}

impl fmt::Debug for MemoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}#{}", self.model, id),
            None => write!(f, "{}#new", self.model),
        }
    }
}

impl Record for MemoryRecord {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn id(&self) -> Option<Scalar> {
        let pk = self.inner.schema.primary_key(&self.model);
        self.row.get(pk).filter(|v| !v.is_nil()).cloned()
    }

    fn has_attribute(&self, name: &str) -> bool {
        let schema = &self.inner.schema;
        if schema.association(&self.model, name).is_some() {
            return false;
        }
        name == schema.primary_key(&self.model)
            || name == schema.inheritance_column(&self.model)
            || schema.column_type(&self.model, name).is_some()
            || self.row.contains_key(name)
    }

    fn read_attribute(&self, name: &str) -> Scalar {
        self.row.get(name).cloned().unwrap_or_default()
    }

    fn aggregate(&self, name: &str) -> Option<AggregateReflection> {
        self.inner.schema.aggregate(&self.model, name).cloned()
    }

    fn inheritance_column(&self) -> &str {
        self.inner.schema.inheritance_column(&self.model)
    }
}

impl Navigable for MemoryRecord {
    fn invoke(&self, method: &str, args: &[Json]) -> anyhow::Result<Datum> {
        let inner = &self.inner;
        let schema = &inner.schema;

        if let Some(assoc) = schema.association(&self.model, method) {
            let fk = schema
                .foreign_key(&self.model, method)
                .ok_or_else(|| anyhow!("no foreign key for {}.{}", self.model, method))?;
            return Ok(match assoc.kind {
                AssociationKind::BelongsTo => {
                    let key = self.read_attribute(&fk);
                    if key.is_nil() {
                        Datum::Nil
                    } else {
                        inner
                            .find_row(&assoc.model, &key)
                            .map(|row| Datum::Record(inner.record(&assoc.model, row)))
                            .unwrap_or_default()
                    }
                }
                AssociationKind::HasOne | AssociationKind::HasMany => {
                    let Some(id) = self.id() else {
                        return Ok(match assoc.kind {
                            AssociationKind::HasMany => inner.collection(&assoc.model, Vec::new()),
                            _ => Datum::Nil,
                        });
                    };
                    let rows: Vec<Row> = inner
                        .rows_of(&assoc.model)
                        .into_iter()
                        .filter(|row| same_id(row.get(&fk), &id))
                        .collect();
                    if assoc.kind == AssociationKind::HasMany {
                        inner.collection(&assoc.model, rows)
                    } else {
                        rows.into_iter()
                            .next()
                            .map(|row| Datum::Record(inner.record(&assoc.model, row)))
                            .unwrap_or_default()
                    }
                }
            });
        }

        if let Some(aggregate) = schema.aggregate(&self.model, method) {
            let parts = aggregate
                .mapping
                .iter()
                .map(|(column, _)| self.read_attribute(column))
                .collect();
            return Ok(Datum::Scalar(Scalar::List(parts)));
        }

        if args.is_empty() && self.has_attribute(method) {
            return Ok(self.read_attribute(method).into());
        }

        bail!("undefined method `{}' for {:?}", method, self)
    }
}

struct MemoryCollection {
    inner: Arc<Inner>,
    model: String,
    rows: Vec<Row>,
}

impl fmt::Debug for MemoryCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.model, self.rows.len())
    }
}

impl Collection for MemoryCollection {
    fn element_model(&self) -> &str {
        &self.model
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn get(&self, index: usize) -> Option<Datum> {
        let row = self.rows.get(index)?.clone();
        Some(Datum::Record(self.inner.record(&self.model, row)))
    }
}

impl Navigable for MemoryCollection {
    fn invoke(&self, method: &str, args: &[Json]) -> anyhow::Result<Datum> {
        let inner = &self.inner;
        match method {
            "all" => Ok(inner.collection(&self.model, self.rows.clone())),
            "find" => {
                let id = first_arg(method, args)?;
                let pk = inner.schema.primary_key(&self.model);
                match self.rows.iter().find(|row| same_id(row.get(pk), &id)) {
                    Some(row) => Ok(Datum::Record(inner.record(&self.model, row.clone()))),
                    None => bail!("Couldn't find {} with id={}", self.model, id),
                }
            }
            _ => match inner.schema.scope(&self.model, method) {
                Some(scope) => {
                    let rows = inner.apply_scope(&self.model, scope, args, self.rows.clone())?;
                    Ok(inner.collection(&self.model, rows))
                }
                None => bail!("undefined method `{}' for {:?}", method, self),
            },
        }
    }
}
