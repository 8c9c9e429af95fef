//! Batch encoder: evaluates vectors against the store and folds the
//! requested values into one [`MergedTree`]
//!
//! Every `(root, logical path)` prefix is evaluated at most once per batch.
//! The memo entry for a prefix holds one item per element when a `*` occurs
//! earlier in the path, so vectors sharing a prefix share both the store
//! access and the permission check.

pub mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::policy::{check_permission, AccessPolicy, ActingPrincipal, Permission};
use crate::scalar::Scalar;
use crate::store::{Collection, Datum, RecordStore, Transaction};
use crate::vector::{Step, Vector, VectorPath, Wildcard};

pub use tree::{MergedTree, TreeNode};

/// Index of an item in the batch arena
pub type ItemId = usize;

/// Result of evaluating one path prefix against one root
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub root: String,
    pub logical_path: VectorPath,
    /// Same as `logical_path` except that `*` is resolved to `*0`, `*1`, ...
    pub absolute_path: VectorPath,
    pub value: Datum,
    pub parent: Option<ItemId>,
}

impl CacheItem {
    fn root(root: &str, value: Datum) -> Self {
        CacheItem {
            root: root.to_string(),
            logical_path: VectorPath::new(),
            absolute_path: VectorPath::new(),
            value,
            parent: None,
        }
    }

    /// Item one step below this one
    pub fn child(&self, parent: ItemId, logical: Step, absolute: Step, value: Datum) -> CacheItem {
        CacheItem {
            root: self.root.clone(),
            logical_path: self.logical_path.child(logical),
            absolute_path: self.absolute_path.child(absolute),
            value,
            parent: Some(parent),
        }
    }

    pub fn absolute_step(&self) -> Option<&Step> {
        self.absolute_path.last()
    }

    /// Reached through `["new", ...]`; such records have no server id yet
    fn is_speculative(&self) -> bool {
        matches!(self.absolute_step(), Some(Step::Call(name, _)) if name == "new")
    }
}

/// Values already known to the caller, keyed by `(root, absolute path)`
#[derive(Debug, Clone, Default)]
pub struct Overrides(HashMap<(String, VectorPath), Datum>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, root: impl Into<String>, path: VectorPath, value: Datum) {
        self.0.insert((root.into(), path), value);
    }

    pub fn get(&self, root: &str, path: &VectorPath) -> Option<&Datum> {
        self.0.get(&(root.to_string(), path.clone()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Counters for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub vectors: usize,
    pub items_created: usize,
    pub memo_hits: usize,
    pub permission_checks: usize,
    pub store_invocations: usize,
    pub overrides_used: usize,
    pub requested: usize,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub tree: MergedTree,
    pub stats: BatchStats,
}

type MemoKey = (String, VectorPath);

/// State of one batch. Created per `evaluate` call and dropped with it.
struct EvalContext<'b> {
    principal: &'b ActingPrincipal,
    overrides: &'b Overrides,
    items: Vec<CacheItem>,
    memo: HashMap<MemoKey, Vec<ItemId>>,
    requested: IndexSet<ItemId>,
    stats: BatchStats,
}

impl<'b> EvalContext<'b> {
    fn new(principal: &'b ActingPrincipal, overrides: &'b Overrides) -> Self {
        EvalContext {
            principal,
            overrides,
            items: Vec::new(),
            memo: HashMap::new(),
            requested: IndexSet::new(),
            stats: BatchStats::default(),
        }
    }

    fn push(&mut self, item: CacheItem) -> ItemId {
        self.items.push(item);
        self.stats.items_created += 1;
        self.items.len() - 1
    }

    fn push_child(&mut self, parent: ItemId, logical: Step, absolute: Step, value: Datum) -> ItemId {
        let item = self.items[parent].child(parent, logical, absolute, value);
        self.push(item)
    }
}

/// Encode engine bound to one store, policy and configuration
pub struct ServerDataCache<'a> {
    store: &'a dyn RecordStore,
    policy: &'a dyn AccessPolicy,
    config: &'a SyncConfig,
}

impl<'a> ServerDataCache<'a> {
    pub fn new(store: &'a dyn RecordStore, policy: &'a dyn AccessPolicy, config: &'a SyncConfig) -> Self {
        ServerDataCache { store, policy, config }
    }

    /// Evaluate a batch of vectors and return the merged tree.
    ///
    /// Runs inside a store transaction that is rolled back whatever the
    /// outcome. Any failed check or accessor aborts the whole batch.
    pub fn evaluate(&self, principal: &ActingPrincipal, overrides: &Overrides, vectors: &[Vector]) -> Result<MergedTree> {
        self.evaluate_with_stats(principal, overrides, vectors).map(|e| e.tree)
    }

    pub fn evaluate_with_stats(
        &self,
        principal: &ActingPrincipal,
        overrides: &Overrides,
        vectors: &[Vector],
    ) -> Result<Evaluation> {
        let transaction = Transaction::begin(self.store)?;
        let outcome = self.run(principal, overrides, vectors);
        let rolled_back = transaction.rollback();
        let evaluation = outcome?;
        rolled_back?;

        let stats = &evaluation.stats;
        tracing::debug!(
            "encoded {} vectors: {} items, {} memo hits, {} checks, {} invocations, {} requested",
            stats.vectors,
            stats.items_created,
            stats.memo_hits,
            stats.permission_checks,
            stats.store_invocations,
            stats.requested
        );
        Ok(evaluation)
    }

    fn run(&self, principal: &ActingPrincipal, overrides: &Overrides, vectors: &[Vector]) -> Result<Evaluation> {
        let mut ctx = EvalContext::new(principal, overrides);

        for vector in vectors {
            if self.config.log_vectors {
                tracing::debug!("vector {}", vector);
            }
            ctx.stats.vectors += 1;

            let root = self.root_item(&mut ctx, &vector.root)?;
            let mut frontier = vec![root];
            let mut logical = VectorPath::new();
            for step in vector.path.steps() {
                frontier = self.advance(&mut ctx, &vector.root, &logical, &frontier, step)?;
                logical = logical.child(step.logical());
            }
            ctx.requested.extend(frontier);
        }

        ctx.stats.requested = ctx.requested.len();
        let tree = fold(&ctx.items, &ctx.requested);
        Ok(Evaluation { tree, stats: ctx.stats })
    }

    fn root_item(&self, ctx: &mut EvalContext<'_>, root: &str) -> Result<ItemId> {
        let key = (root.to_string(), VectorPath::new());
        if let Some(group) = ctx.memo.get(&key) {
            ctx.stats.memo_hits += 1;
            return Ok(group[0]);
        }
        if !self.config.is_regulated(root) {
            return Err(SyncError::AccessViolation(format!("{} is not a regulated model", root)));
        }
        let model = self
            .store
            .model(root)
            .ok_or_else(|| SyncError::AccessViolation(format!("{} is not a known model", root)))?;
        let id = ctx.push(CacheItem::root(root, Datum::Model(model)));
        ctx.memo.insert(key, vec![id]);
        Ok(id)
    }

    /// Apply `step` to every item of the group at `logical`.
    ///
    /// Items holding nil or a plain value end their vector here and become
    /// requested themselves.
    fn advance(
        &self,
        ctx: &mut EvalContext<'_>,
        root: &str,
        logical: &VectorPath,
        frontier: &[ItemId],
        step: &Step,
    ) -> Result<Vec<ItemId>> {
        let key = (root.to_string(), logical.child(step.logical()));
        if let Some(group) = ctx.memo.get(&key) {
            ctx.stats.memo_hits += 1;
            return Ok(group.clone());
        }

        let mut group = Vec::new();
        for &id in frontier {
            if ctx.items[id].value.is_terminal() {
                ctx.requested.insert(id);
                continue;
            }
            group.extend(self.apply_step(ctx, id, step)?);
        }
        ctx.memo.insert(key, group.clone());
        Ok(group)
    }

    fn apply_step(&self, ctx: &mut EvalContext<'_>, id: ItemId, step: &Step) -> Result<Vec<ItemId>> {
        match step.logical() {
            Step::Wildcard(Wildcard::AllIds) => {
                self.check(ctx, id, Permission::View, "id")?;
                let collection = self.collection_at(ctx, id, step)?;
                let ids = (0..collection.len())
                    .map(|i| {
                        collection
                            .get(i)
                            .and_then(|d| d.as_record().and_then(|r| r.id()))
                            .unwrap_or_default()
                    })
                    .collect();
                Ok(vec![ctx.push_child(id, step.clone(), step.clone(), Datum::Scalar(Scalar::List(ids)))])
            }
            Step::Wildcard(Wildcard::Count) => {
                self.check(ctx, id, Permission::View, "id")?;
                let count = self.collection_at(ctx, id, step)?.len() as i64;
                Ok(vec![ctx.push_child(id, step.clone(), step.clone(), Datum::Scalar(Scalar::Int(count)))])
            }
            Step::Wildcard(_) => self.apply_star(ctx, id),
            _ => self.apply_method(ctx, id, step).map(|child| vec![child]),
        }
    }

    fn apply_star(&self, ctx: &mut EvalContext<'_>, id: ItemId) -> Result<Vec<ItemId>> {
        let all = Step::Wildcard(Wildcard::All);
        self.check(ctx, id, Permission::View, "id")?;
        let collection = self.collection_at(ctx, id, &all)?;

        if collection.is_empty() {
            let empty = Datum::Scalar(Scalar::List(Vec::new()));
            return Ok(vec![ctx.push_child(id, all.clone(), all, empty)]);
        }

        let mut children = Vec::with_capacity(collection.len());
        for i in 0..collection.len() {
            let each = Step::Wildcard(Wildcard::Each(i));
            let absolute = ctx.items[id].absolute_path.child(each.clone());
            let value = match ctx.overrides.get(&ctx.items[id].root, &absolute).cloned() {
                Some(value) => {
                    ctx.stats.overrides_used += 1;
                    value
                }
                None => collection.get(i).unwrap_or_default(),
            };
            children.push(ctx.push_child(id, all.clone(), each, value));
        }
        Ok(children)
    }

    fn apply_method(&self, ctx: &mut EvalContext<'_>, id: ItemId, step: &Step) -> Result<ItemId> {
        let absolute = ctx.items[id].absolute_path.child(step.clone());
        if let Some(value) = ctx.overrides.get(&ctx.items[id].root, &absolute).cloned() {
            ctx.stats.overrides_used += 1;
            return Ok(ctx.push_child(id, step.clone(), step.clone(), value));
        }

        let Some(method) = step.method() else {
            return Err(SyncError::InvalidVector(format!("{} is not a method step", step)));
        };
        let subject = ctx.items[id].value.clone();

        // composed attributes travel as their constituent columns
        if let (Step::Name(name), Some(record)) = (step, subject.as_record()) {
            if let Some(aggregate) = record.aggregate(name).filter(|a| !a.entity) {
                self.check(ctx, id, Permission::View, name)?;
                let parts: Vec<Scalar> = aggregate
                    .mapping
                    .iter()
                    .map(|(column, _)| record.read_attribute(column))
                    .collect();
                let value = if parts.iter().all(Scalar::is_nil) {
                    Datum::Nil
                } else {
                    Datum::Scalar(Scalar::List(parts))
                };
                return Ok(ctx.push_child(id, step.clone(), step.clone(), value));
            }
        }

        let permission = match (step, subject.as_record()) {
            (Step::Name(name), Some(record)) if record.has_attribute(name) => Permission::View,
            _ => Permission::Send,
        };
        self.check(ctx, id, permission, method)?;

        ctx.stats.store_invocations += 1;
        let value = match subject.invoke(method, step.args()) {
            Some(Ok(value)) => value,
            Some(Err(source)) => {
                let err = SyncError::EvaluationFailure {
                    step: step.to_string(),
                    value: subject.describe(),
                    source,
                };
                tracing::debug!("{}", err);
                return Err(err);
            }
            None => Datum::Nil,
        };
        Ok(ctx.push_child(id, step.clone(), step.clone(), value))
    }

    fn check(&self, ctx: &mut EvalContext<'_>, id: ItemId, permission: Permission, name: &str) -> Result<()> {
        ctx.stats.permission_checks += 1;
        check_permission(self.policy, ctx.principal, &ctx.items[id].value, permission, name)
    }

    fn collection_at(
        &self,
        ctx: &EvalContext<'_>,
        id: ItemId,
        step: &Step,
    ) -> Result<Arc<dyn Collection>> {
        let value = &ctx.items[id].value;
        value.as_collection().cloned().ok_or_else(|| SyncError::EvaluationFailure {
            step: step.to_string(),
            value: value.describe(),
            source: anyhow::anyhow!("value is not a collection"),
        })
    }
}

// ============================================================================
// Folding requested items into the result tree
// ============================================================================

fn fold(items: &[CacheItem], requested: &IndexSet<ItemId>) -> MergedTree {
    let mut tree = MergedTree::new();
    for &id in requested {
        let chain = ancestry(items, id);
        let root = &items[chain[0]];
        if let Some(node) = fold_chain(items, &chain) {
            let mut fragment = MergedTree::new();
            fragment.insert(root.root.clone(), node);
            tree.merge(fragment);
        }
    }
    tree
}

/// Item ids from the root down to `id`
fn ancestry(items: &[CacheItem], id: ItemId) -> Vec<ItemId> {
    let mut chain = vec![id];
    let mut current = id;
    while let Some(parent) = items[current].parent {
        chain.push(parent);
        current = parent;
    }
    chain.reverse();
    chain
}

fn fold_chain(items: &[CacheItem], chain: &[ItemId]) -> Option<TreeNode> {
    let item = &items[chain[0]];
    let Some(&next) = chain.get(1) else {
        return fold_terminal(item);
    };
    let child = &items[next];

    let mut level = MergedTree::new();
    match child.absolute_step() {
        // empty collection: the level exists but has no elements
        Some(Step::Wildcard(Wildcard::All)) | None => {}
        Some(Step::Wildcard(Wildcard::Each(i))) => {
            let key = match &child.value {
                Datum::Nil => None,
                Datum::Record(record) => Some(record.id().map(|id| id.key_string()).unwrap_or_else(|| format!("*{}", i))),
                _ => Some(format!("*{}", i)),
            };
            if let (Some(key), Some(node)) = (key, fold_chain(items, &chain[1..])) {
                level.insert(key, node);
            }
        }
        Some(step) => {
            if let Some(node) = fold_chain(items, &chain[1..]) {
                level.insert(step.wire_key(), node);
            }
        }
    }
    decorate(item, &mut level);
    Some(TreeNode::Node(level))
}

fn fold_terminal(item: &CacheItem) -> Option<TreeNode> {
    match &item.value {
        Datum::Nil => Some(TreeNode::Leaf(Scalar::Nil)),
        Datum::Scalar(Scalar::List(ids)) if item.absolute_step() == Some(&Step::Wildcard(Wildcard::AllIds)) => {
            Some(TreeNode::Ids(ids.clone()))
        }
        Datum::Scalar(value) => Some(TreeNode::Leaf(value.clone())),
        Datum::Record(_) => {
            let mut level = MergedTree::new();
            decorate(item, &mut level);
            Some(TreeNode::Node(level))
        }
        Datum::Collection(_) => Some(TreeNode::Node(MergedTree::new())),
        Datum::Model(_) if item.parent.is_none() => None,
        Datum::Model(_) => Some(TreeNode::Node(MergedTree::new())),
    }
}

/// Entity levels carry the record's id and type discriminator
fn decorate(item: &CacheItem, level: &mut MergedTree) {
    let Datum::Record(record) = &item.value else {
        return;
    };
    let id = if item.is_speculative() {
        Scalar::Nil
    } else {
        record.id().unwrap_or_default()
    };
    level.or_insert("id", TreeNode::Leaf(id));
    let column = record.inheritance_column();
    level.or_insert(column, TreeNode::Leaf(record.read_attribute(column)));
}
