//! Decoder: applies a merged tree to the client mirror graph
//!
//! Within one level `*all` is applied first and `id` second; every other key
//! is dispatched on its shape and on the kind of the current target. Keys
//! that match no rule fall back to a touch of `target.<key>`.

pub mod mirror;

use serde_json::Value as Json;

use crate::cache::tree::{MergedTree, TreeNode, ALL_IDS_KEY};
use crate::error::SyncError;
use crate::scalar::Scalar;
use crate::schema::AssociationKind;
use crate::vector::{Step, Wildcard};

pub use mirror::{CollectionKey, MirrorGraph, MirrorObserver, RecordKey, Slot, Target};

pub struct TreeReconciler<'g> {
    graph: &'g mut MirrorGraph,
    mismatches: usize,
}

impl<'g> TreeReconciler<'g> {
    pub fn new(graph: &'g mut MirrorGraph) -> Self {
        TreeReconciler { graph, mismatches: 0 }
    }

    /// Shape mismatches seen so far; each one was logged and skipped
    pub fn mismatches(&self) -> usize {
        self.mismatches
    }

    /// Apply a whole result tree. Top-level keys name models.
    pub fn apply(&mut self, tree: &MergedTree) {
        for (model, node) in tree.iter() {
            match node {
                TreeNode::Node(subtree) if self.graph.schema().contains(model) => {
                    self.apply_to(subtree, &Target::Model(model.clone()));
                }
                _ => self.mismatch(model, "top-level key is not a known model"),
            }
        }
    }

    /// Apply one tree level to `target`
    pub fn apply_to(&mut self, tree: &MergedTree, target: &Target) {
        if let Some(ids) = tree.get(ALL_IDS_KEY) {
            self.apply_all_ids(target, ids);
        }
        if let Some(id) = tree.get("id") {
            self.apply_id(target, id);
        }
        for (key, node) in tree.iter() {
            if key == ALL_IDS_KEY || key == "id" {
                continue;
            }
            self.dispatch(target, key, node);
        }
    }

    fn mismatch(&mut self, key: &str, reason: &str) {
        self.mismatches += 1;
        let err = SyncError::DecodeShapeMismatch {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        tracing::warn!("{}", err);
    }

    fn apply_all_ids(&mut self, target: &Target, node: &TreeNode) {
        let (Target::Collection(collection), TreeNode::Ids(ids)) = (target, node) else {
            self.mismatch(ALL_IDS_KEY, "expected an id list on a collection");
            return;
        };
        let model = self.graph.collection(*collection).model.clone();
        let elements = ids
            .iter()
            .filter(|id| !id.is_nil())
            .map(|id| self.graph.find_or_create(&model, id))
            .collect();
        self.graph.replace_elements(*collection, elements);
    }

    fn apply_id(&mut self, target: &Target, node: &TreeNode) {
        match (target, node) {
            (Target::Record(record), TreeNode::Leaf(id)) => {
                if !id.is_nil() && self.graph.record(*record).id.as_ref() != Some(id) {
                    self.graph.set_id(*record, id.clone());
                }
            }
            _ => self.mismatch("id", "expected a leaf on a record"),
        }
    }

    fn dispatch(&mut self, target: &Target, key: &str, node: &TreeNode) {
        let step = Step::from_wire_key(key);
        match (&step, target) {
            (Step::Wildcard(Wildcard::Count), Target::Collection(collection)) => {
                match node.as_leaf().and_then(Scalar::as_i64) {
                    Some(n) if n >= 0 => self.graph.set_count(*collection, n as usize),
                    _ => self.mismatch(key, "count must be a non-negative integer leaf"),
                }
            }
            (Step::Call(method, args), _) if method == "new" => self.apply_new(target, key, args, node),
            (Step::Call(..), Target::Record(record)) => match node {
                TreeNode::Leaf(value) => self.graph.set_call_result(*record, key, value.clone()),
                _ => self.fallback(target, key, node),
            },
            (Step::Call(method, args), Target::Model(_) | Target::Collection(_)) => {
                self.apply_lookup(target, key, method, args, node)
            }
            (Step::Name(name), Target::Collection(collection)) if self.is_element_key(name, node) => {
                self.apply_element(*collection, name, node)
            }
            (Step::Name(name), Target::Record(record)) => self.apply_name(*record, name, node),
            (Step::Name(name), Target::Model(model)) => {
                let scope = self.graph.class_scope(model, name);
                self.descend(&Target::Collection(scope), node);
            }
            (Step::Name(name), Target::Collection(collection)) => {
                let scope = self.graph.collection_scope(*collection, name);
                self.descend(&Target::Collection(scope), node);
            }
            _ => self.fallback(target, key, node),
        }
    }

    /// Recurse into a subtree; leaves end the walk
    fn descend(&mut self, target: &Target, node: &TreeNode) {
        if let TreeNode::Node(subtree) = node {
            self.apply_to(subtree, target);
        }
    }

    fn target_model(&self, target: &Target) -> Option<String> {
        match target {
            Target::Model(model) => Some(model.clone()),
            Target::Collection(c) => Some(self.graph.collection(*c).model.clone()),
            Target::Record(_) => None,
        }
    }

    /// Model named by the level's type discriminator, if it refines `model`
    fn resolve_model(&self, model: &str, node: &TreeNode) -> String {
        let schema = self.graph.schema();
        let column = schema.inheritance_column(model);
        match node.as_node().and_then(|n| n.get(column)).and_then(TreeNode::as_leaf) {
            Some(Scalar::Str(t)) if schema.is_a(t, model) => t.clone(),
            _ => model.to_string(),
        }
    }

    fn node_id(node: &TreeNode) -> Option<&Scalar> {
        node.as_node()?.get("id")?.as_leaf().filter(|id| !id.is_nil())
    }

    fn is_element_key(&self, name: &str, node: &TreeNode) -> bool {
        let integer_like = !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit());
        integer_like || Self::node_id(node).is_some_and(|id| id.key_string() == name)
    }

    fn apply_element(&mut self, collection: CollectionKey, key: &str, node: &TreeNode) {
        let model = self.graph.collection(collection).model.clone();
        let model = self.resolve_model(&model, node);
        let id = match Self::node_id(node) {
            Some(id) => id.clone(),
            None => key.parse::<i64>().map(Scalar::Int).unwrap_or_else(|_| Scalar::from(key)),
        };
        let record = self.graph.find_or_create(&model, &id);
        self.graph.push_and_update_belongs_to(collection, record);
        self.descend(&Target::Record(record), node);
    }

    fn apply_new(&mut self, target: &Target, key: &str, args: &[Json], node: &TreeNode) {
        let Some(model) = self.target_model(target) else {
            self.fallback(target, key, node);
            return;
        };
        let local_id = match args.first() {
            Some(Json::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let model = self.resolve_model(&model, node);
        let (record, created) = self.graph.find_or_create_local(&model, &local_id);
        match node {
            TreeNode::Node(subtree) => {
                if let Target::Collection(collection) = target {
                    self.graph.push_and_update_belongs_to(*collection, record);
                }
                self.apply_to(subtree, &Target::Record(record));
            }
            _ => {
                if created {
                    self.graph.destroy(record);
                }
            }
        }
    }

    /// Finder or parameterized scope on a model or collection
    fn apply_lookup(&mut self, target: &Target, key: &str, method: &str, args: &[Json], node: &TreeNode) {
        let Some(model) = self.target_model(target) else {
            return;
        };

        let is_finder = method == "find" || method == "find_by" || method.starts_with("find_by_");
        if !is_finder {
            let scope = match target {
                Target::Collection(c) => self.graph.collection_scope(*c, key),
                _ => self.graph.class_scope(&model, key),
            };
            self.descend(&Target::Collection(scope), node);
            return;
        }

        // a leaf means the lookup found nothing; nothing gets created
        let Some(id) = Self::node_id(node).cloned() else {
            return;
        };
        let model = self.resolve_model(&model, node);
        let record = self.graph.find_or_create(&model, &id);
        if let Some(column) = method.strip_prefix("find_by_") {
            if let Some(value) = args.first() {
                self.graph.set_attribute(record, column, Scalar::from_json(value));
            }
        }
        self.descend(&Target::Record(record), node);
    }

    fn apply_name(&mut self, record: RecordKey, name: &str, node: &TreeNode) {
        let model = self.graph.record(record).model.clone();
        let schema = self.graph.schema();
        let aggregate = schema.aggregate(&model, name).is_some();
        let association = schema.association(&model, name).map(|a| (a.kind, a.model.clone()));

        match (node, association) {
            (TreeNode::Leaf(value), _) if aggregate => self.graph.set_aggregate(record, name, value.clone()),
            (TreeNode::Leaf(Scalar::Nil), Some((kind, _))) if kind != AssociationKind::HasMany => {
                self.graph.set_association(record, name, None)
            }
            (TreeNode::Leaf(value), None) => self.graph.set_attribute(record, name, value.clone()),
            (TreeNode::Node(subtree), Some((AssociationKind::HasMany, _))) => {
                let collection = self.graph.association_collection(record, name);
                self.apply_to(subtree, &Target::Collection(collection));
            }
            (TreeNode::Node(_), Some((_, target_model))) => match Self::node_id(node).cloned() {
                Some(id) => {
                    let target_model = self.resolve_model(&target_model, node);
                    let associated = self.graph.find_or_create(&target_model, &id);
                    self.graph.set_association(record, name, Some(associated));
                    self.descend(&Target::Record(associated), node);
                }
                None => self.fallback(&Target::Record(record), name, node),
            },
            _ => self.fallback(&Target::Record(record), name, node),
        }
    }

    /// Touch `target.<key>` and keep walking through whatever it holds
    fn fallback(&mut self, target: &Target, key: &str, node: &TreeNode) {
        self.graph.touch(target, key);

        let known = match target {
            Target::Record(record) => {
                let model = &self.graph.record(*record).model;
                let schema = self.graph.schema();
                schema.column_type(model, key).is_some()
                    || schema.association(model, key).is_some()
                    || schema.aggregate(model, key).is_some()
            }
            Target::Model(model) => self.graph.schema().scope(model, key).is_some(),
            Target::Collection(_) => false,
        };
        if !known {
            self.mismatch(key, "no rule matches this key");
        }

        let next = match target {
            Target::Record(record) => match self.graph.attribute(*record, key) {
                Some(Slot::Record(Some(r))) => Some(Target::Record(*r)),
                Some(Slot::Collection(c)) => Some(Target::Collection(*c)),
                _ => None,
            },
            _ => None,
        };
        if let Some(next) = next {
            self.descend(&next, node);
        }
    }
}
