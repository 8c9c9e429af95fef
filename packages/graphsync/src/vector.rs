//! Vectors: navigation paths from a root model to a requested value
//!
//! A vector on the wire is a JSON array. The first element names the root
//! model, every following element is one step:
//!
//! ```text
//! ["User", ["find", 12], "todos", "active", "*", "title"]
//! ```
//!
//! - a string is a zero-argument access (`"title"`) or a wildcard token
//!   (`"*"`, `"*3"`, `"*all"`, `"*count"`)
//! - an array is a call with literal arguments (`["find", 12]`)

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value as Json;

use crate::error::{Result, SyncError};

/// Wildcard operators over a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wildcard {
    /// `*` - every element
    All,
    /// `*N` - element N; only appears in absolute paths
    Each(usize),
    /// `*all` - ordered element ids
    AllIds,
    /// `*count` - element count
    Count,
}

impl Wildcard {
    fn parse(token: &str) -> Option<Wildcard> {
        match token {
            "*" => Some(Wildcard::All),
            "*all" => Some(Wildcard::AllIds),
            "*count" => Some(Wildcard::Count),
            _ => {
                let digits = token.strip_prefix('*')?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok().map(Wildcard::Each)
            }
        }
    }

    pub fn token(&self) -> String {
        match self {
            Wildcard::All => "*".to_string(),
            Wildcard::Each(i) => format!("*{}", i),
            Wildcard::AllIds => "*all".to_string(),
            Wildcard::Count => "*count".to_string(),
        }
    }
}

/// One navigation step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Zero-argument access: attribute, association, scope or method
    Name(String),
    /// Method call with literal arguments
    Call(String, Vec<Json>),
    Wildcard(Wildcard),
}

impl Hash for Step {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Step::Name(name) => {
                0u8.hash(state);
                name.hash(state);
            }
            Step::Call(name, args) => {
                1u8.hash(state);
                name.hash(state);
                args.len().hash(state);
                for arg in args {
                    hash_json(arg, state);
                }
            }
            Step::Wildcard(w) => {
                2u8.hash(state);
                w.hash(state);
            }
        }
    }
}

/// Hash a JSON value consistently with its `PartialEq`, which ignores the
/// key order of objects
fn hash_json<H: Hasher>(value: &Json, state: &mut H) {
    match value {
        Json::Null => 0u8.hash(state),
        Json::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Json::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Json::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Json::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        Json::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, item) in entries {
                key.hash(state);
                hash_json(item, state);
            }
        }
    }
}

impl Step {
    pub fn name(name: impl Into<String>) -> Self {
        Step::Name(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Json>) -> Self {
        Step::Call(name.into(), args)
    }

    /// Parse one wire step.
    ///
    /// `["find_by_id", x]` is normalized to `["find", x]`.
    pub fn parse(value: &Json) -> Result<Step> {
        match value {
            Json::String(s) => Ok(Self::from_token(s)),
            Json::Array(items) => {
                let (head, args) = items
                    .split_first()
                    .ok_or_else(|| SyncError::InvalidVector("empty call step".to_string()))?;
                let method = head.as_str().ok_or_else(|| {
                    SyncError::InvalidVector(format!("call name must be a string, got {}", head))
                })?;
                let method = if method == "find_by_id" { "find" } else { method };
                Ok(Step::Call(method.to_string(), args.to_vec()))
            }
            other => Err(SyncError::InvalidVector(format!("unsupported step {}", other))),
        }
    }

    fn from_token(token: &str) -> Step {
        match Wildcard::parse(token) {
            Some(w) => Step::Wildcard(w),
            None => Step::Name(token.to_string()),
        }
    }

    /// Parse a tree key back into a step. Call tuples arrive JSON-encoded.
    pub fn from_wire_key(key: &str) -> Step {
        if key.starts_with('[') {
            if let Ok(value @ Json::Array(_)) = serde_json::from_str::<Json>(key) {
                if let Ok(step) = Step::parse(&value) {
                    return step;
                }
            }
        }
        Self::from_token(key)
    }

    /// Map key used for this step in a merged tree
    pub fn wire_key(&self) -> String {
        match self {
            Step::Name(name) => name.clone(),
            Step::Call(..) => self.to_json().to_string(),
            Step::Wildcard(w) => w.token(),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Step::Name(name) => Json::String(name.clone()),
            Step::Call(name, args) => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Json::String(name.clone()));
                items.extend(args.iter().cloned());
                Json::Array(items)
            }
            Step::Wildcard(w) => Json::String(w.token()),
        }
    }

    /// Logical form of the step: a concrete `*N` collapses to `*`
    pub fn logical(&self) -> Step {
        match self {
            Step::Wildcard(Wildcard::Each(_)) => Step::Wildcard(Wildcard::All),
            other => other.clone(),
        }
    }

    /// Method name for name and call steps
    pub fn method(&self) -> Option<&str> {
        match self {
            Step::Name(name) | Step::Call(name, _) => Some(name),
            Step::Wildcard(_) => None,
        }
    }

    pub fn args(&self) -> &[Json] {
        match self {
            Step::Call(_, args) => args,
            _ => &[],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_key())
    }
}

/// Ordered sequence of steps below a root
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VectorPath(Vec<Step>);

impl VectorPath {
    pub fn new() -> Self {
        VectorPath(Vec::new())
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        VectorPath(steps)
    }

    /// New path extended by one step; the receiver is left untouched.
    pub fn child(&self, step: Step) -> VectorPath {
        let mut steps = Vec::with_capacity(self.0.len() + 1);
        steps.extend(self.0.iter().cloned());
        steps.push(step);
        VectorPath(steps)
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn last(&self) -> Option<&Step> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VectorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

/// A requested vector: root model plus steps
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vector {
    pub root: String,
    pub path: VectorPath,
}

impl Vector {
    pub fn new(root: impl Into<String>, steps: Vec<Step>) -> Self {
        Vector {
            root: root.into(),
            path: VectorPath::from_steps(steps),
        }
    }

    /// Parse `["Model", step, step, ...]`
    pub fn parse(value: &Json) -> Result<Vector> {
        let items = value
            .as_array()
            .ok_or_else(|| SyncError::InvalidVector(format!("vector must be an array, got {}", value)))?;
        let (root, steps) = items
            .split_first()
            .ok_or_else(|| SyncError::InvalidVector("empty vector".to_string()))?;
        let root = root.as_str().ok_or_else(|| {
            SyncError::InvalidVector(format!("vector root must be a model name, got {}", root))
        })?;
        let steps = steps.iter().map(Step::parse).collect::<Result<Vec<_>>>()?;
        Ok(Vector::new(root, steps))
    }

    /// Parse an array of vectors
    pub fn parse_all(value: &Json) -> Result<Vec<Vector>> {
        value
            .as_array()
            .ok_or_else(|| SyncError::InvalidVector("expected an array of vectors".to_string()))?
            .iter()
            .map(Vector::parse)
            .collect()
    }

    pub fn to_json(&self) -> Json {
        let mut items = vec![Json::String(self.root.clone())];
        items.extend(self.path.steps().iter().map(Step::to_json));
        Json::Array(items)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.root)
        } else {
            write!(f, "{}.{}", self.root, self.path)
        }
    }
}

#[cfg(test)]
mod vector_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_vector() {
        let v = Vector::parse(&json!(["User", ["find", 12], "todos", "*", "title"])).unwrap();
        assert_eq!(v.root, "User");
        assert_eq!(
            v.path.steps(),
            &[
                Step::call("find", vec![json!(12)]),
                Step::name("todos"),
                Step::Wildcard(Wildcard::All),
                Step::name("title"),
            ]
        );
    }

    #[test]
    fn test_wildcard_tokens() {
        assert_eq!(Step::parse(&json!("*all")).unwrap(), Step::Wildcard(Wildcard::AllIds));
        assert_eq!(Step::parse(&json!("*count")).unwrap(), Step::Wildcard(Wildcard::Count));
        assert_eq!(Step::parse(&json!("*7")).unwrap(), Step::Wildcard(Wildcard::Each(7)));
        // not a wildcard: no digits after the star
        assert_eq!(Step::parse(&json!("*x")).unwrap(), Step::name("*x"));
    }

    #[test]
    fn test_find_by_id_normalized() {
        let step = Step::parse(&json!(["find_by_id", 5])).unwrap();
        assert_eq!(step, Step::call("find", vec![json!(5)]));
    }

    #[test]
    fn test_each_is_logically_all() {
        let each = Step::Wildcard(Wildcard::Each(3));
        assert_eq!(each.logical(), Step::Wildcard(Wildcard::All));
        assert_eq!(each.wire_key(), "*3");
    }

    #[test]
    fn test_call_wire_key_roundtrip() {
        let step = Step::call("find_by_email", vec![json!("a@b.c")]);
        let key = step.wire_key();
        assert_eq!(key, r#"["find_by_email","a@b.c"]"#);
        assert_eq!(Step::from_wire_key(&key), step);
    }

    #[test]
    fn test_invalid_vectors() {
        assert!(matches!(Vector::parse(&json!([])), Err(SyncError::InvalidVector(_))));
        assert!(matches!(Vector::parse(&json!("User")), Err(SyncError::InvalidVector(_))));
        assert!(matches!(Vector::parse(&json!(["User", []])), Err(SyncError::InvalidVector(_))));
        assert!(matches!(Vector::parse(&json!(["User", 3])), Err(SyncError::InvalidVector(_))));
    }

    #[test]
    fn test_path_child_is_immutable() {
        let base = VectorPath::from_steps(vec![Step::name("todos")]);
        let child = base.child(Step::Wildcard(Wildcard::All));
        assert_eq!(base.len(), 1);
        assert_eq!(child.len(), 2);
        assert_eq!(child.to_string(), "todos.*");
    }

    #[test]
    fn test_equal_paths_hash_equal() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(VectorPath::from_steps(vec![Step::call("find", vec![json!(1)])]));
        assert!(set.contains(&VectorPath::from_steps(vec![Step::call("find", vec![json!(1)])])));
        assert!(!set.contains(&VectorPath::from_steps(vec![Step::call("find", vec![json!(2)])])));
    }

    #[test]
    fn test_condition_key_order_does_not_split_paths() {
        use std::collections::HashSet;
        let forward = Step::parse(&json!(["find_by", {"title": "a", "done": false}])).unwrap();
        let reverse = Step::parse(&json!(["find_by", {"done": false, "title": "a"}])).unwrap();
        assert_eq!(forward, reverse);

        let mut set = HashSet::new();
        set.insert(VectorPath::from_steps(vec![forward]));
        assert!(set.contains(&VectorPath::from_steps(vec![reverse])));
        assert!(!set.contains(&VectorPath::from_steps(vec![
            Step::parse(&json!(["find_by", {"done": true, "title": "a"}])).unwrap()
        ])));
    }
}
