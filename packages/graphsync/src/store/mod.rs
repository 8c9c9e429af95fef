//! Record store collaborator
//!
//! The evaluator never talks to a database directly. It navigates through
//! three capabilities:
//!
//! - `read_attribute` on a [`Record`]
//! - `invoke` (named accessor with literal arguments) on anything [`Navigable`]
//! - collection operations (`len`, `get`) on a [`Collection`]
//!
//! [`memory::MemoryStore`] is the in-process implementation used by the CLI
//! and the tests.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::Result;
use crate::scalar::Scalar;
use crate::schema::AggregateReflection;

pub use memory::MemoryStore;

/// Anything a step can be applied to
pub trait Navigable: fmt::Debug + Send + Sync {
    /// Invoke a named accessor (attribute, association, scope, finder or
    /// method) with literal arguments.
    fn invoke(&self, method: &str, args: &[Json]) -> anyhow::Result<Datum>;
}

/// A model (record type); the value of every root cache item
pub trait Model: Navigable {
    fn name(&self) -> &str;
}

/// A stored entity
pub trait Record: Navigable {
    fn model_name(&self) -> &str;

    /// Primary key; `None` for records that were never saved
    fn id(&self) -> Option<Scalar>;

    /// Whether `name` is a stored column (view-checked instead of send-checked)
    fn has_attribute(&self, name: &str) -> bool;

    fn read_attribute(&self, name: &str) -> Scalar;

    /// Composed attribute registered under `name`
    fn aggregate(&self, name: &str) -> Option<AggregateReflection>;

    /// Column holding the type discriminator
    fn inheritance_column(&self) -> &str {
        "type"
    }
}

/// An ordered set of records (association or scope)
pub trait Collection: Navigable {
    fn element_model(&self) -> &str;

    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Option<Datum>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Access to models plus the transaction every encode batch runs in
pub trait RecordStore: Send + Sync {
    fn model(&self, name: &str) -> Option<Arc<dyn Model>>;

    /// Open the transaction for one batch. Batches on the same store never
    /// share a transaction; a store may block here until the previous batch
    /// has rolled back.
    fn begin_transaction(&self) -> Result<()>;

    /// Discard everything written since `begin_transaction`
    fn rollback_transaction(&self) -> Result<()>;
}

/// Result of applying a step
#[derive(Clone, Debug, Default)]
pub enum Datum {
    #[default]
    Nil,
    Scalar(Scalar),
    Model(Arc<dyn Model>),
    Record(Arc<dyn Record>),
    Collection(Arc<dyn Collection>),
}

impl Datum {
    /// Nothing further can be navigated from this value: nil, or a scalar
    /// (including the bare sequences produced by wildcards and aggregates).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Datum::Nil | Datum::Scalar(_))
    }

    pub fn as_record(&self) -> Option<&Arc<dyn Record>> {
        match self {
            Datum::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Arc<dyn Collection>> {
        match self {
            Datum::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Model name of the subject, used by access policies
    pub fn model_name(&self) -> Option<&str> {
        match self {
            Datum::Model(m) => Some(m.name()),
            Datum::Record(r) => Some(r.model_name()),
            Datum::Collection(c) => Some(c.element_model()),
            Datum::Nil | Datum::Scalar(_) => None,
        }
    }

    /// Dispatch a named accessor; `None` when the value is not navigable
    pub fn invoke(&self, method: &str, args: &[Json]) -> Option<anyhow::Result<Datum>> {
        match self {
            Datum::Model(m) => Some(m.invoke(method, args)),
            Datum::Record(r) => Some(r.invoke(method, args)),
            Datum::Collection(c) => Some(c.invoke(method, args)),
            Datum::Nil | Datum::Scalar(_) => None,
        }
    }

    /// Short human-readable form for diagnostics
    pub fn describe(&self) -> String {
        match self {
            Datum::Nil => "nil".to_string(),
            Datum::Scalar(s) => s.to_string(),
            Datum::Model(m) => m.name().to_string(),
            Datum::Record(r) => match r.id() {
                Some(id) => format!("{}#{}", r.model_name(), id),
                None => format!("{}#new", r.model_name()),
            },
            Datum::Collection(c) => format!("{}[{}]", c.element_model(), c.len()),
        }
    }
}

impl From<Scalar> for Datum {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Nil => Datum::Nil,
            other => Datum::Scalar(other),
        }
    }
}

/// Keeps a store transaction open for one batch and always rolls it back
///
/// Dropping the guard without calling [`Transaction::rollback`] (e.g. on an
/// early `?` return) still rolls back; the error is then only logged.
pub struct Transaction<'a> {
    store: &'a dyn RecordStore,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a dyn RecordStore) -> Result<Self> {
        store.begin_transaction()?;
        Ok(Transaction { store, finished: false })
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.store.rollback_transaction()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.store.rollback_transaction() {
                tracing::warn!("rollback after failed batch: {}", e);
            }
        }
    }
}
