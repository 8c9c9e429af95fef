//! Integration test: encode against the todos fixture, decode onto a fresh
//! mirror graph.
//!
//! Validates that:
//! - Scalars of every column type survive the trip
//! - `*all` / `*count` encode and decode consistently
//! - Absent lookups create nothing on the client
//! - A forbidden attribute fails the whole batch
//! - Scratch records never outlive a batch

use std::path::PathBuf;

use graphsync::policy::{ModelRules, RulePolicy};
use graphsync::reconcile::Slot;
use graphsync::store::Record;
use graphsync::{
    ActingPrincipal, MemoryStore, MergedTree, MirrorGraph, Overrides, PermitAll, Scalar, ServerDataCache, SyncConfig,
    SyncError, TreeReconciler, Vector,
};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fixture() -> MemoryStore {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/todos.json");
    MemoryStore::from_file(&path).unwrap()
}

fn config(store: &MemoryStore) -> SyncConfig {
    SyncConfig::with_models(store.schema().models.keys().cloned())
}

fn encode(store: &MemoryStore, vectors: serde_json::Value) -> graphsync::Result<MergedTree> {
    let config = config(store);
    let cache = ServerDataCache::new(store, &PermitAll, &config);
    cache.evaluate(&ActingPrincipal::user("12"), &Overrides::new(), &Vector::parse_all(&vectors)?)
}

/// Encode, push through JSON text like a transport would, decode
fn roundtrip(store: &MemoryStore, vectors: serde_json::Value) -> MirrorGraph {
    let tree = encode(store, vectors).unwrap();
    let wire = serde_json::to_string(&tree).unwrap();
    let received: MergedTree = serde_json::from_str(&wire).unwrap();

    let mut graph = MirrorGraph::new(store.schema().clone());
    let mut reconciler = TreeReconciler::new(&mut graph);
    reconciler.apply(&received);
    assert_eq!(reconciler.mismatches(), 0);
    graph
}

fn user_value(graph: &MirrorGraph, attribute: &str) -> Scalar {
    let user = graph.find_record("User", &Scalar::Int(12)).expect("user 12 mirrored");
    graph.record(user).value(attribute).cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

#[test]
fn test_scalar_roundtrip() {
    let store = fixture();
    let graph = roundtrip(
        &store,
        json!([
            ["User", ["find", 12], "name"],
            ["User", ["find", 12], "karma"],
            ["User", ["find", 12], "rating"],
            ["User", ["find", 12], "admin"],
            ["User", ["find", 12], "born_on"],
            ["User", ["find", 12], "last_seen_at"]
        ]),
    );

    let source = store.find("User", &Scalar::Int(12)).unwrap();
    assert_eq!(user_value(&graph, "name"), source.read_attribute("name"));
    assert_eq!(user_value(&graph, "karma"), Scalar::Int(42));
    assert_eq!(user_value(&graph, "rating"), Scalar::Float(4.5));
    assert_eq!(user_value(&graph, "admin"), Scalar::Bool(true));

    let born = user_value(&graph, "born_on");
    assert!(matches!(born, Scalar::Date(_)), "got {:?}", born);
    assert_eq!(born.to_json(), json!("1815-12-10"));

    let seen = user_value(&graph, "last_seen_at");
    assert!(matches!(seen, Scalar::Time(_)), "got {:?}", seen);
}

#[test]
fn test_shared_prefix_merges_into_one_subtree() {
    let store = fixture();
    let tree = encode(
        &store,
        json!([["User", ["find", 12], "name"], ["User", ["find", 12], "email"]]),
    )
    .unwrap();
    let user = tree.lookup(&["User", r#"["find",12]"#]).unwrap().as_node().unwrap();
    assert!(user.contains_key("name"));
    assert!(user.contains_key("email"));
    assert!(user.contains_key("id"));
    assert!(user.contains_key("type"));
}

#[test]
fn test_aggregate_roundtrip() {
    let store = fixture();
    let graph = roundtrip(&store, json!([["User", ["find", 12], "address"]]));
    assert_eq!(user_value(&graph, "address_city"), Scalar::from("London"));
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[test]
fn test_all_ids_and_elements() {
    let store = fixture();
    let graph = roundtrip(
        &store,
        json!([
            ["User", ["find", 12], "todos", "active", "*all"],
            ["User", ["find", 12], "todos", "active", "*", "title"]
        ]),
    );

    let user = graph.find_record("User", &Scalar::Int(12)).unwrap();
    let Some(Slot::Collection(todos)) = graph.attribute(user, "todos").cloned() else {
        panic!("todos missing");
    };
    let active = graph.collection(todos).scopes["active"];
    let ids: Vec<Scalar> = graph
        .collection(active)
        .elements
        .iter()
        .map(|k| graph.record(*k).id.clone().unwrap())
        .collect();
    // ordered by position
    assert_eq!(ids, vec![Scalar::Int(1), Scalar::Int(3)]);

    let chore = graph.find_record("Todo", &Scalar::Int(3)).unwrap();
    assert_eq!(graph.record(chore).model, "Chore");
    assert_eq!(graph.record(chore).value("title"), Some(&Scalar::from("Oil gears")));
}

#[test]
fn test_count_roundtrip() {
    let store = fixture();
    let tree = encode(&store, json!([["User", ["find", 12], "todos", "*count"]])).unwrap();
    assert_eq!(
        tree.lookup(&["User", r#"["find",12]"#, "todos", "*count"]).unwrap().to_json(),
        json!([3])
    );

    let graph = roundtrip(&store, json!([["User", ["find", 12], "todos", "*count"]]));
    let user = graph.find_record("User", &Scalar::Int(12)).unwrap();
    let Some(Slot::Collection(todos)) = graph.attribute(user, "todos").cloned() else {
        panic!("todos missing");
    };
    assert_eq!(graph.collection(todos).count, Some(3));
    assert!(graph.collection(todos).elements.is_empty());
}

#[test]
fn test_has_one_roundtrip() {
    let store = fixture();
    let graph = roundtrip(&store, json!([["User", ["find", 12], "profile", "bio"]]));
    let user = graph.find_record("User", &Scalar::Int(12)).unwrap();
    let profile = graph.find_record("Profile", &Scalar::Int(1)).unwrap();
    assert_eq!(graph.attribute(user, "profile"), Some(&Slot::Record(Some(profile))));
    assert_eq!(graph.record(profile).value("bio"), Some(&Scalar::from("Counts things")));
    // the inverse belongs_to follows the has_one
    assert_eq!(graph.attribute(profile, "user"), Some(&Slot::Record(Some(user))));
    assert_eq!(graph.record(profile).value("user_id"), Some(&Scalar::Int(12)));
}

// ---------------------------------------------------------------------------
// Absent paths, security, isolation
// ---------------------------------------------------------------------------

#[test]
fn test_absent_path() {
    let store = fixture();
    let tree = encode(&store, json!([["User", ["find_by_email", "nobody@example.com"], "name"]])).unwrap();
    assert_eq!(
        tree.to_json(),
        json!({"User": {r#"["find_by_email","nobody@example.com"]"#: [null]}})
    );

    let graph = roundtrip(&store, json!([["User", ["find_by_email", "nobody@example.com"], "name"]]));
    assert_eq!(graph.live_records().count(), 0);
}

#[test]
fn test_forbidden_attribute_fails_batch() {
    let store = fixture();
    let config = config(&store);
    let policy = RulePolicy::default().allow(
        "User",
        ModelRules {
            view: vec!["id".into(), "type".into(), "name".into(), "email".into()],
            send: vec!["find".into()],
            ..ModelRules::default()
        },
    );
    let cache = ServerDataCache::new(&store, &policy, &config);
    let vectors = Vector::parse_all(&json!([
        ["User", ["find", 12], "name"],
        ["User", ["find", 12], "password_digest"]
    ]))
    .unwrap();

    let result = cache.evaluate(&ActingPrincipal::user("12"), &Overrides::new(), &vectors);
    match result {
        Err(SyncError::AccessViolation(msg)) => assert!(msg.contains("password_digest")),
        other => panic!("expected access violation, got {:?}", other.map(|t| t.to_json())),
    }

    // the permitted vector alone still works
    let tree = cache
        .evaluate(&ActingPrincipal::user("12"), &Overrides::new(), &vectors[..1])
        .unwrap();
    assert!(tree.lookup(&["User", r#"["find",12]"#, "name"]).is_some());
}

#[test]
fn test_scratch_records_do_not_survive() {
    let store = fixture();
    let before = store.record_count("Todo");

    let tree = encode(&store, json!([["Todo", ["new", "tmp-1"], "title"]])).unwrap();
    assert_eq!(tree.lookup(&["Todo", r#"["new","tmp-1"]"#, "id"]).unwrap().to_json(), json!([null]));
    assert_eq!(store.record_count("Todo"), before);

    let failed = encode(&store, json!([["Todo", ["new", "tmp-2"], "title"], ["Todo", ["find", 404]]]));
    assert!(matches!(failed, Err(SyncError::EvaluationFailure { .. })));
    assert_eq!(store.record_count("Todo"), before);
}

#[test]
fn test_msgpack_roundtrip() {
    let store = fixture();
    let tree = encode(&store, json!([["Todo", "completed", "*all"], ["Todo", "completed", "*", "title"]])).unwrap();
    let bytes = tree.to_msgpack().unwrap();
    assert_eq!(MergedTree::from_msgpack(&bytes).unwrap(), tree);
}
