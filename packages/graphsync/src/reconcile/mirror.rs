//! Client-side mirror of the record graph
//!
//! Records and collections live in arenas and refer to each other by key.
//! Records are indexed by `(base model, id)` and, for records created on the
//! client before the server assigned an id, by `(base model, local id)`.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};

use crate::scalar::Scalar;
use crate::schema::{AssociationKind, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey(usize);

/// Something a tree level can be applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Model(String),
    Record(RecordKey),
    Collection(CollectionKey),
}

/// Contents of one record attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Scalar),
    Record(Option<RecordKey>),
    Collection(CollectionKey),
}

#[derive(Debug, Clone)]
pub struct MirrorRecord {
    pub model: String,
    pub id: Option<Scalar>,
    pub local_id: Option<String>,
    pub attributes: IndexMap<String, Slot>,
    /// Results of server method calls, keyed by call wire key
    pub calls: IndexMap<String, Scalar>,
    pub destroyed: bool,
}

impl MirrorRecord {
    fn new(model: &str) -> Self {
        MirrorRecord {
            model: model.to_string(),
            id: None,
            local_id: None,
            attributes: IndexMap::new(),
            calls: IndexMap::new(),
            destroyed: false,
        }
    }

    pub fn value(&self, name: &str) -> Option<&Scalar> {
        match self.attributes.get(name)? {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorCollection {
    pub model: String,
    /// Owning record and association name for has-many collections
    pub owner: Option<(RecordKey, String)>,
    pub elements: Vec<RecordKey>,
    /// Cardinality, known even when the element list is not loaded
    pub count: Option<usize>,
    pub scopes: IndexMap<String, CollectionKey>,
}

impl MirrorCollection {
    fn new(model: &str, owner: Option<(RecordKey, String)>) -> Self {
        MirrorCollection {
            model: model.to_string(),
            owner,
            elements: Vec::new(),
            count: None,
            scopes: IndexMap::new(),
        }
    }
}

/// Notification hooks for the reactivity layer
pub trait MirrorObserver {
    /// A read hit an attribute that has not been loaded yet
    fn loading(&self, _target: &Target, _key: &str) {}

    fn changed(&self, _target: &Target, _key: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl MirrorObserver for NoopObserver {}

pub struct MirrorGraph {
    schema: Schema,
    records: Vec<MirrorRecord>,
    collections: Vec<MirrorCollection>,
    by_id: HashMap<(String, String), RecordKey>,
    by_local: HashMap<(String, String), RecordKey>,
    class_scopes: HashMap<String, IndexMap<String, CollectionKey>>,
    observer: Box<dyn MirrorObserver>,
}

impl MirrorGraph {
    pub fn new(schema: Schema) -> Self {
        Self::with_observer(schema, Box::new(NoopObserver))
    }

    pub fn with_observer(schema: Schema, observer: Box<dyn MirrorObserver>) -> Self {
        MirrorGraph {
            schema,
            records: Vec::new(),
            collections: Vec::new(),
            by_id: HashMap::new(),
            by_local: HashMap::new(),
            class_scopes: HashMap::new(),
            observer,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn record(&self, key: RecordKey) -> &MirrorRecord {
        &self.records[key.0]
    }

    pub fn collection(&self, key: CollectionKey) -> &MirrorCollection {
        &self.collections[key.0]
    }

    fn index_key(&self, model: &str, id: &Scalar) -> (String, String) {
        (self.schema.base_model(model).to_string(), id.key_string())
    }

    fn changed(&self, target: Target, key: &str) {
        self.observer.changed(&target, key);
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    pub fn find_record(&self, model: &str, id: &Scalar) -> Option<RecordKey> {
        self.by_id.get(&self.index_key(model, id)).copied()
    }

    /// Record with `id`, created when missing. A more specific `model`
    /// (subclass) refines the record's model.
    pub fn find_or_create(&mut self, model: &str, id: &Scalar) -> RecordKey {
        if let Some(key) = self.find_record(model, id) {
            let current = &self.records[key.0].model;
            if model != current.as_str() && self.schema.is_a(model, current) {
                self.records[key.0].model = model.to_string();
            }
            return key;
        }
        let mut record = MirrorRecord::new(model);
        record.id = Some(id.clone());
        let key = RecordKey(self.records.len());
        self.records.push(record);
        let index = self.index_key(model, id);
        self.by_id.insert(index, key);
        self.changed(Target::Record(key), "id");
        key
    }

    pub fn find_by_local(&self, model: &str, local_id: &str) -> Option<RecordKey> {
        let base = self.schema.base_model(model).to_string();
        self.by_local.get(&(base, local_id.to_string())).copied()
    }

    /// Client-local scratch record; the flag tells whether it was created now
    pub fn find_or_create_local(&mut self, model: &str, local_id: &str) -> (RecordKey, bool) {
        if let Some(key) = self.find_by_local(model, local_id) {
            return (key, false);
        }
        let mut record = MirrorRecord::new(model);
        record.local_id = Some(local_id.to_string());
        let key = RecordKey(self.records.len());
        self.records.push(record);
        let base = self.schema.base_model(model).to_string();
        self.by_local.insert((base, local_id.to_string()), key);
        (key, true)
    }

    /// Drop a record from every index and collection
    pub fn destroy(&mut self, key: RecordKey) {
        let record = &mut self.records[key.0];
        record.destroyed = true;
        let model = record.model.clone();
        let id = record.id.clone();
        let local = record.local_id.clone();

        if let Some(id) = id {
            let index = self.index_key(&model, &id);
            self.by_id.remove(&index);
        }
        if let Some(local) = local {
            let base = self.schema.base_model(&model).to_string();
            self.by_local.remove(&(base, local));
        }
        for collection in &mut self.collections {
            collection.elements.retain(|k| *k != key);
        }
    }

    pub fn set_id(&mut self, key: RecordKey, id: Scalar) {
        let model = self.records[key.0].model.clone();
        if let Some(old) = self.records[key.0].id.take() {
            let index = self.index_key(&model, &old);
            self.by_id.remove(&index);
        }
        if !id.is_nil() {
            let index = self.index_key(&model, &id);
            self.by_id.insert(index, key);
            self.records[key.0].id = Some(id);
        }
        self.changed(Target::Record(key), "id");
    }

    /// Assign a scalar attribute, coerced to the declared column type.
    /// Assigning the type discriminator refines the record's model.
    pub fn set_attribute(&mut self, key: RecordKey, name: &str, value: Scalar) {
        let model = self.records[key.0].model.clone();
        let value = match self.schema.column_type(&model, name) {
            Some(column) => value.coerce(column),
            None => value,
        };
        if name == self.schema.inheritance_column(&model) {
            if let Scalar::Str(t) = &value {
                if t != &model && self.schema.is_a(t, &model) {
                    self.records[key.0].model = t.clone();
                }
            }
        }
        self.records[key.0].attributes.insert(name.to_string(), Slot::Value(value));
        self.changed(Target::Record(key), name);
    }

    /// Assign a composed attribute from its decomposition; the constituent
    /// columns are written as well. A nil value clears every column.
    pub fn set_aggregate(&mut self, key: RecordKey, name: &str, value: Scalar) {
        let model = self.records[key.0].model.clone();
        if let Some(aggregate) = self.schema.aggregate(&model, name).cloned() {
            match &value {
                Scalar::List(parts) => {
                    for ((column, _), part) in aggregate.mapping.iter().zip(parts) {
                        self.set_attribute(key, column, part.clone());
                    }
                }
                Scalar::Nil => {
                    for (column, _) in &aggregate.mapping {
                        self.set_attribute(key, column, Scalar::Nil);
                    }
                }
                _ => {}
            }
        }
        self.records[key.0].attributes.insert(name.to_string(), Slot::Value(value));
        self.changed(Target::Record(key), name);
    }

    /// Point a singular association at `target`, keeping the foreign key of
    /// a belongs-to in step. A has-one also points the target's inverse
    /// belongs-to back at this record.
    pub fn set_association(&mut self, key: RecordKey, name: &str, target: Option<RecordKey>) {
        let model = self.records[key.0].model.clone();
        let assoc = self.schema.association(&model, name).map(|a| (a.kind, a.inverse_of.clone()));
        if let Some((AssociationKind::BelongsTo, _)) = assoc {
            if let Some(fk) = self.schema.foreign_key(&model, name) {
                let id = target.and_then(|t| self.records[t.0].id.clone()).unwrap_or_default();
                self.records[key.0].attributes.insert(fk, Slot::Value(id));
            }
        }
        self.records[key.0].attributes.insert(name.to_string(), Slot::Record(target));
        self.changed(Target::Record(key), name);

        if let (Some((AssociationKind::HasOne, Some(inverse))), Some(target)) = (assoc, target) {
            if self.records[target.0].attributes.get(&inverse) != Some(&Slot::Record(Some(key))) {
                self.set_association(target, &inverse, Some(key));
            }
        }
    }

    /// Has-many collection of a record, created on first use
    pub fn association_collection(&mut self, key: RecordKey, name: &str) -> CollectionKey {
        if let Some(Slot::Collection(c)) = self.records[key.0].attributes.get(name) {
            return *c;
        }
        let model = self.records[key.0].model.clone();
        let element = self
            .schema
            .association(&model, name)
            .map(|a| a.model.clone())
            .unwrap_or_default();
        let collection = self.push_collection(MirrorCollection::new(&element, Some((key, name.to_string()))));
        self.records[key.0].attributes.insert(name.to_string(), Slot::Collection(collection));
        collection
    }

    /// Read an attribute; unloaded attributes trigger the loading hook
    pub fn attribute(&self, key: RecordKey, name: &str) -> Option<&Slot> {
        let slot = self.records[key.0].attributes.get(name);
        if slot.is_none() {
            self.observer.loading(&Target::Record(key), name);
        }
        slot
    }

    pub fn call_result(&self, key: RecordKey, call: &str) -> Option<&Scalar> {
        self.records[key.0].calls.get(call)
    }

    pub fn set_call_result(&mut self, key: RecordKey, call: &str, value: Scalar) {
        self.records[key.0].calls.insert(call.to_string(), value);
        self.changed(Target::Record(key), call);
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    fn push_collection(&mut self, collection: MirrorCollection) -> CollectionKey {
        let key = CollectionKey(self.collections.len());
        self.collections.push(collection);
        key
    }

    /// Model-level scope such as `all` or `["active"]`
    pub fn class_scope(&mut self, model: &str, wire_key: &str) -> CollectionKey {
        if let Some(key) = self.class_scopes.get(model).and_then(|s| s.get(wire_key)) {
            return *key;
        }
        let key = self.push_collection(MirrorCollection::new(model, None));
        self.class_scopes
            .entry(model.to_string())
            .or_default()
            .insert(wire_key.to_string(), key);
        key
    }

    /// Scope applied to a collection, e.g. `user.todos.open`
    pub fn collection_scope(&mut self, parent: CollectionKey, wire_key: &str) -> CollectionKey {
        if let Some(key) = self.collections[parent.0].scopes.get(wire_key) {
            return *key;
        }
        let model = self.collections[parent.0].model.clone();
        let key = self.push_collection(MirrorCollection::new(&model, None));
        self.collections[parent.0].scopes.insert(wire_key.to_string(), key);
        key
    }

    /// Replace the element list; the count follows the new list
    pub fn replace_elements(&mut self, key: CollectionKey, elements: Vec<RecordKey>) {
        for element in &elements {
            self.update_inverse(key, *element);
        }
        let collection = &mut self.collections[key.0];
        collection.count = Some(elements.len());
        collection.elements = elements;
        self.changed(Target::Collection(key), "*all");
    }

    /// Add a record unless present and point its inverse belongs-to at the
    /// collection owner
    pub fn push_and_update_belongs_to(&mut self, key: CollectionKey, record: RecordKey) {
        self.update_inverse(key, record);
        let collection = &mut self.collections[key.0];
        if !collection.elements.contains(&record) {
            collection.elements.push(record);
            if let Some(count) = collection.count.as_mut() {
                *count = (*count).max(collection.elements.len());
            }
            self.changed(Target::Collection(key), "*");
        }
    }

    fn update_inverse(&mut self, key: CollectionKey, record: RecordKey) {
        let Some((owner, name)) = self.collections[key.0].owner.clone() else {
            return;
        };
        let owner_model = self.records[owner.0].model.clone();
        let inverse = self
            .schema
            .association(&owner_model, &name)
            .and_then(|a| a.inverse_of.clone());
        if let Some(inverse) = inverse {
            let current = self.records[record.0].attributes.get(&inverse);
            if current != Some(&Slot::Record(Some(owner))) {
                self.set_association(record, &inverse, Some(owner));
            }
        }
    }

    pub fn set_count(&mut self, key: CollectionKey, count: usize) {
        self.collections[key.0].count = Some(count);
        self.changed(Target::Collection(key), "*count");
    }

    /// Re-assign without changing anything, so observers see the key again
    pub fn touch(&self, target: &Target, key: &str) {
        self.observer.changed(target, key);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn live_records(&self) -> impl Iterator<Item = (RecordKey, &MirrorRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.destroyed)
            .map(|(i, r)| (RecordKey(i), r))
    }

    fn slot_json(&self, slot: &Slot) -> Json {
        match slot {
            Slot::Value(v) => v.to_json(),
            Slot::Record(Some(k)) => self.records[k.0].id.as_ref().map(Scalar::to_json).unwrap_or(Json::Null),
            Slot::Record(None) => Json::Null,
            Slot::Collection(c) => Json::Array(
                self.collections[c.0]
                    .elements
                    .iter()
                    .map(|k| self.records[k.0].id.as_ref().map(Scalar::to_json).unwrap_or(Json::Null))
                    .collect(),
            ),
        }
    }

    /// Snapshot of all live records, grouped by model and keyed by id
    /// (or `local:<id>` for scratch records). Attributes are sorted.
    pub fn dump(&self) -> Json {
        let mut models: BTreeMap<String, BTreeMap<String, Json>> = BTreeMap::new();
        for (_, record) in self.live_records() {
            let key = match (&record.id, &record.local_id) {
                (Some(id), _) => id.key_string(),
                (None, Some(local)) => format!("local:{}", local),
                (None, None) => continue,
            };
            let mut fields: Map<String, Json> = Map::new();
            let mut names: Vec<&String> = record.attributes.keys().collect();
            names.sort();
            for name in names {
                fields.insert(name.clone(), self.slot_json(&record.attributes[name]));
            }
            let mut calls: Vec<(&String, &Scalar)> = record.calls.iter().collect();
            calls.sort_by(|a, b| a.0.cmp(b.0));
            for (call, value) in calls {
                fields.insert(call.clone(), value.to_json());
            }
            models
                .entry(record.model.clone())
                .or_default()
                .insert(key, Json::Object(fields));
        }
        json!(models)
    }
}

#[cfg(test)]
mod mirror_tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn schema() -> Schema {
        serde_json::from_value(serde_json::json!({
            "models": {
                "User": {
                    "columns": {"email": "string", "born": "date"},
                    "associations": {
                        "todos": {"kind": "has_many", "model": "Todo", "inverse_of": "owner"},
                        "profile": {"kind": "has_one", "model": "Profile", "inverse_of": "user"}
                    }
                },
                "Profile": {
                    "associations": {"user": {"kind": "belongs_to", "model": "User"}}
                },
                "Todo": {
                    "columns": {"title": "string"},
                    "associations": {"owner": {"kind": "belongs_to", "model": "User"}}
                },
                "Chore": {"base": "Todo"}
            }
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl MirrorObserver for Recorder {
        fn loading(&self, _: &Target, key: &str) {
            self.events.borrow_mut().push(format!("loading {}", key));
        }

        fn changed(&self, _: &Target, key: &str) {
            self.events.borrow_mut().push(format!("changed {}", key));
        }
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let mut graph = MirrorGraph::new(schema());
        let a = graph.find_or_create("Todo", &Scalar::Int(1));
        let b = graph.find_or_create("Todo", &Scalar::Int(1));
        assert_eq!(a, b);
        // subclass lookups share the base index and refine the model
        let c = graph.find_or_create("Chore", &Scalar::Int(1));
        assert_eq!(a, c);
        assert_eq!(graph.record(a).model, "Chore");
    }

    #[test]
    fn test_set_attribute_coerces() {
        let mut graph = MirrorGraph::new(schema());
        let user = graph.find_or_create("User", &Scalar::Int(1));
        graph.set_attribute(user, "born", Scalar::from("1990-01-02"));
        assert!(matches!(graph.record(user).value("born"), Some(Scalar::Date(_))));
    }

    #[test]
    fn test_push_updates_inverse() {
        let mut graph = MirrorGraph::new(schema());
        let user = graph.find_or_create("User", &Scalar::Int(1));
        let todo = graph.find_or_create("Todo", &Scalar::Int(5));
        let todos = graph.association_collection(user, "todos");
        graph.push_and_update_belongs_to(todos, todo);
        graph.push_and_update_belongs_to(todos, todo);

        assert_eq!(graph.collection(todos).elements, vec![todo]);
        assert_eq!(graph.attribute(todo, "owner"), Some(&Slot::Record(Some(user))));
        assert_eq!(graph.record(todo).value("owner_id"), Some(&Scalar::Int(1)));
    }

    #[test]
    fn test_has_one_updates_inverse() {
        let mut graph = MirrorGraph::new(schema());
        let user = graph.find_or_create("User", &Scalar::Int(1));
        let profile = graph.find_or_create("Profile", &Scalar::Int(9));
        graph.set_association(user, "profile", Some(profile));

        assert_eq!(graph.attribute(user, "profile"), Some(&Slot::Record(Some(profile))));
        assert_eq!(graph.attribute(profile, "user"), Some(&Slot::Record(Some(user))));
        assert_eq!(graph.record(profile).value("user_id"), Some(&Scalar::Int(1)));

        // clearing the has-one leaves the old target alone
        graph.set_association(user, "profile", None);
        assert_eq!(graph.attribute(user, "profile"), Some(&Slot::Record(None)));
        assert_eq!(graph.attribute(profile, "user"), Some(&Slot::Record(Some(user))));
    }

    #[test]
    fn test_destroy_removes_from_indexes() {
        let mut graph = MirrorGraph::new(schema());
        let (scratch, created) = graph.find_or_create_local("Todo", "7");
        assert!(created);
        assert_eq!(graph.find_or_create_local("Todo", "7"), (scratch, false));
        graph.destroy(scratch);
        assert_eq!(graph.find_by_local("Todo", "7"), None);
        assert_eq!(graph.live_records().count(), 0);
    }

    #[test]
    fn test_observer_notified() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let observer = Recorder { events: Rc::clone(&events) };
        let mut graph = MirrorGraph::with_observer(schema(), Box::new(observer));
        let todo = graph.find_or_create("Todo", &Scalar::Int(1));
        assert_eq!(graph.attribute(todo, "title"), None);
        graph.set_attribute(todo, "title", Scalar::from("x"));

        assert_eq!(*events.borrow(), vec!["changed id", "loading title", "changed title"]);
    }

    #[test]
    fn test_dump_groups_by_model() {
        let mut graph = MirrorGraph::new(schema());
        let todo = graph.find_or_create("Todo", &Scalar::Int(3));
        graph.set_attribute(todo, "title", Scalar::from("x"));
        assert_eq!(graph.dump(), serde_json::json!({"Todo": {"3": {"title": "x"}}}));
    }
}
