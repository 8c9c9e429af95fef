//! Merged result tree
//!
//! Internally every position is one of three shapes; they only collapse into
//! plain JSON (or MessagePack) at the serialization boundary:
//!
//! | shape | wire |
//! |---|---|
//! | `Leaf(x)` | `[x]` |
//! | `Ids(xs)` | `[x, y, ...]` (only under `*all`) |
//! | `Node(tree)` | `{ ... }` |

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as Json};

use crate::error::{Result, SyncError};
use crate::scalar::Scalar;

/// Key carrying an ordered id list
pub const ALL_IDS_KEY: &str = "*all";

#[derive(Clone, Debug, PartialEq)]
pub enum TreeNode {
    Leaf(Scalar),
    Ids(Vec<Scalar>),
    Node(MergedTree),
}

impl TreeNode {
    pub fn as_leaf(&self) -> Option<&Scalar> {
        match self {
            TreeNode::Leaf(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&MergedTree> {
        match self {
            TreeNode::Node(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            TreeNode::Leaf(s) => Json::Array(vec![s.to_json()]),
            TreeNode::Ids(ids) => Json::Array(ids.iter().map(Scalar::to_json).collect()),
            TreeNode::Node(tree) => tree.to_json(),
        }
    }

    fn from_json(key: &str, value: &Json) -> Result<TreeNode> {
        Ok(match value {
            Json::Array(items) if key == ALL_IDS_KEY => TreeNode::Ids(items.iter().map(Scalar::from_json).collect()),
            Json::Array(items) => TreeNode::Leaf(items.first().map(Scalar::from_json).unwrap_or_default()),
            Json::Object(map) => TreeNode::Node(MergedTree::from_map(map)?),
            // a bare scalar where a leaf was expected
            other => TreeNode::Leaf(Scalar::from_json(other)),
        })
    }
}

/// Ordered key -> node mapping, one per tree level
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedTree(IndexMap<String, TreeNode>);

impl MergedTree {
    pub fn new() -> Self {
        MergedTree(IndexMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&TreeNode> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert unless the key is already present; existing entries win
    pub fn or_insert(&mut self, key: impl Into<String>, node: TreeNode) {
        self.0.entry(key.into()).or_insert(node);
    }

    pub fn insert(&mut self, key: impl Into<String>, node: TreeNode) -> Option<TreeNode> {
        self.0.insert(key.into(), node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeNode)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold `other` into `self` key-wise. Nested nodes merge recursively;
    /// on any other collision the existing entry is kept.
    pub fn merge(&mut self, other: MergedTree) {
        for (key, incoming) in other.0 {
            match self.0.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                }
                Entry::Occupied(mut slot) => {
                    if let (TreeNode::Node(existing), TreeNode::Node(incoming)) = (slot.get_mut(), incoming) {
                        existing.merge(incoming);
                    }
                }
            }
        }
    }

    /// Walk a key path; `None` when any level is missing or not a node
    pub fn lookup(&self, path: &[&str]) -> Option<&TreeNode> {
        let (first, rest) = path.split_first()?;
        let node = self.get(first)?;
        if rest.is_empty() {
            Some(node)
        } else {
            node.as_node()?.lookup(rest)
        }
    }

    pub fn to_json(&self) -> Json {
        Json::Object(self.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }

    pub fn from_json(value: &Json) -> Result<MergedTree> {
        match value {
            Json::Object(map) => Self::from_map(map),
            other => Err(SyncError::DecodeShapeMismatch {
                key: String::new(),
                reason: format!("tree must be an object, got {}", other),
            }),
        }
    }

    fn from_map(map: &Map<String, Json>) -> Result<MergedTree> {
        let mut tree = MergedTree::new();
        for (key, value) in map {
            tree.insert(key.clone(), TreeNode::from_json(key, value)?);
        }
        Ok(tree)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&self.to_json())?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<MergedTree> {
        let value: Json = rmp_serde::from_slice(bytes)?;
        Self::from_json(&value)
    }
}

impl Serialize for MergedTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MergedTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        MergedTree::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tree_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn leaf(s: &str) -> TreeNode {
        TreeNode::Leaf(Scalar::from(s))
    }

    fn node(entries: Vec<(&str, TreeNode)>) -> TreeNode {
        let mut tree = MergedTree::new();
        for (k, v) in entries {
            tree.insert(k, v);
        }
        TreeNode::Node(tree)
    }

    #[test]
    fn test_merge_combines_shared_prefix() {
        let mut a = MergedTree::new();
        a.insert(r#"["find",12]"#, node(vec![("title", leaf("x"))]));
        let mut b = MergedTree::new();
        b.insert(r#"["find",12]"#, node(vec![("body", leaf("y"))]));

        a.merge(b);
        assert_eq!(
            a.to_json(),
            json!({r#"["find",12]"#: {"title": ["x"], "body": ["y"]}})
        );
    }

    #[test]
    fn test_merge_never_overwrites() {
        let mut a = MergedTree::new();
        a.insert("id", leaf("first"));
        let mut b = MergedTree::new();
        b.insert("id", leaf("second"));
        a.merge(b);
        assert_eq!(a.get("id"), Some(&leaf("first")));
    }

    #[test]
    fn test_wire_shapes() {
        let value = json!({
            "Todo": {
                "*all": [1, 2],
                "*count": [2],
                "title": ["x"],
                "gone": [],
                "1": {"id": [1]}
            }
        });
        let tree = MergedTree::from_json(&value).unwrap();
        assert_eq!(
            tree.lookup(&["Todo", "*all"]),
            Some(&TreeNode::Ids(vec![Scalar::Int(1), Scalar::Int(2)]))
        );
        assert_eq!(tree.lookup(&["Todo", "*count"]), Some(&TreeNode::Leaf(Scalar::Int(2))));
        assert_eq!(tree.lookup(&["Todo", "gone"]), Some(&TreeNode::Leaf(Scalar::Nil)));
        assert_eq!(
            tree.to_json(),
            json!({"Todo": {"*all": [1, 2], "*count": [2], "title": ["x"], "gone": [null], "1": {"id": [1]}}})
        );
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            MergedTree::from_json(&json!([1])),
            Err(SyncError::DecodeShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_msgpack_matches_json() {
        let tree = MergedTree::from_json(&json!({"Todo": {"*all": [3], "3": {"title": ["x"], "done": [false]}}})).unwrap();
        let bytes = tree.to_msgpack().unwrap();
        assert_eq!(MergedTree::from_msgpack(&bytes).unwrap(), tree);
    }

    // ---------------------------------------------------------------------
    // Merge order
    // ---------------------------------------------------------------------

    /// Three-level path whose leaf value is derived from the path itself, so
    /// no two fragments disagree on a shared key.
    fn fragment(path: &[String]) -> MergedTree {
        let mut current = TreeNode::Leaf(Scalar::Str(path.join("/")));
        for key in path.iter().rev() {
            let mut level = MergedTree::new();
            level.insert(key.clone(), current);
            current = TreeNode::Node(level);
        }
        match current {
            TreeNode::Node(tree) => tree,
            _ => MergedTree::new(),
        }
    }

    fn paths() -> impl Strategy<Value = Vec<Vec<String>>> {
        let key = prop::sample::select(vec!["a", "b", "c", "*all", r#"["find",1]"#]).prop_map(String::from);
        prop::collection::vec(prop::collection::vec(key, 3), 1..12)
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(paths in paths(), seed in any::<u64>()) {
            let mut forward = MergedTree::new();
            for p in &paths {
                forward.merge(fragment(p));
            }

            let mut shuffled = paths.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((seed >> (i % 64)) as usize).wrapping_add(i * 7) % len;
                shuffled.swap(i, j);
            }
            let mut backward = MergedTree::new();
            for p in shuffled.iter().rev() {
                backward.merge(fragment(p));
            }

            prop_assert_eq!(forward, backward);
        }
    }
}
