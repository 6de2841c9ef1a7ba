//! ProjectionStore interface tests.
//!
//! These tests verify the contract of the ProjectionStore trait.
//! Each storage implementation should run these tests.

use replica::storage::{NaturalKey, ProjectionStore, UpsertOutcome};
use serde_json::{json, Map, Value};

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

// =============================================================================
// ProjectionStore::get tests
// =============================================================================

pub async fn test_get_nonexistent<S: ProjectionStore>(store: &S) {
    let result = store
        .get("test_course", &NaturalKey::from("missing"))
        .await
        .expect("get should succeed");
    assert!(result.is_none(), "nonexistent row should be None");
}

// =============================================================================
// ProjectionStore::upsert tests
// =============================================================================

pub async fn test_upsert_inserts<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("7");

    let outcome = store
        .upsert("test_course", &key, &fields(json!({"id": 7, "code": "CS101"})))
        .await
        .expect("upsert should succeed");
    assert_eq!(outcome, UpsertOutcome::Inserted);

    let row = store
        .get("test_course", &key)
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(row.entity, "test_course");
    assert_eq!(row.key, key);
    assert!(!row.stub);
    assert_eq!(Value::Object(row.fields), json!({"id": 7, "code": "CS101"}));
}

pub async fn test_upsert_replay_unchanged<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("8");
    let payload = fields(json!({"id": 8, "code": "CS102"}));

    store.upsert("test_course", &key, &payload).await.unwrap();
    let first = store.get("test_course", &key).await.unwrap().unwrap();

    let outcome = store.upsert("test_course", &key, &payload).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Unchanged);

    let second = store.get("test_course", &key).await.unwrap().unwrap();
    assert_eq!(first, second, "replay must not touch the row");
}

pub async fn test_upsert_partial_merge<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("9");

    store
        .upsert("test_course", &key, &fields(json!({"id": 9, "code": "CS103"})))
        .await
        .unwrap();
    let outcome = store
        .upsert("test_course", &key, &fields(json!({"id": 9, "department": "CS"})))
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Updated);

    let row = store.get("test_course", &key).await.unwrap().unwrap();
    assert_eq!(
        Value::Object(row.fields),
        json!({"id": 9, "code": "CS103", "department": "CS"})
    );
}

// =============================================================================
// ProjectionStore::insert_stub tests
// =============================================================================

pub async fn test_stub_only_when_absent<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("99");

    assert!(store
        .insert_stub("test_course", &key, &fields(json!({"id": 99})))
        .await
        .unwrap());
    assert!(!store
        .insert_stub("test_course", &key, &fields(json!({"id": 99, "code": "X"})))
        .await
        .unwrap());

    let row = store.get("test_course", &key).await.unwrap().unwrap();
    assert!(row.stub);
    assert_eq!(Value::Object(row.fields), json!({"id": 99}));
}

pub async fn test_upsert_clears_stub<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("98");

    store
        .insert_stub("test_course", &key, &fields(json!({"id": 98})))
        .await
        .unwrap();
    store
        .upsert("test_course", &key, &fields(json!({"id": 98, "code": "MA200"})))
        .await
        .unwrap();

    let row = store.get("test_course", &key).await.unwrap().unwrap();
    assert!(!row.stub);
    assert_eq!(row.fields["code"], json!("MA200"));
}

pub async fn test_stub_does_not_overwrite_row<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("97");

    store
        .upsert("test_course", &key, &fields(json!({"id": 97, "code": "PH100"})))
        .await
        .unwrap();
    assert!(!store
        .insert_stub("test_course", &key, &fields(json!({"id": 97})))
        .await
        .unwrap());

    let row = store.get("test_course", &key).await.unwrap().unwrap();
    assert!(!row.stub);
    assert_eq!(row.fields["code"], json!("PH100"));
}

// =============================================================================
// ProjectionStore::delete tests
// =============================================================================

pub async fn test_delete_idempotent<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("del-1");

    store
        .upsert("test_user", &key, &fields(json!({"id": "del-1"})))
        .await
        .unwrap();

    assert!(store.delete("test_user", &key).await.unwrap());
    assert!(!store.delete("test_user", &key).await.unwrap());
    assert!(store.get("test_user", &key).await.unwrap().is_none());
}

// =============================================================================
// Isolation and listing tests
// =============================================================================

pub async fn test_entity_isolation<S: ProjectionStore>(store: &S) {
    let key = NaturalKey::from("shared");

    store
        .upsert("test_iso_a", &key, &fields(json!({"id": "shared", "side": "a"})))
        .await
        .unwrap();
    store
        .upsert("test_iso_b", &key, &fields(json!({"id": "shared", "side": "b"})))
        .await
        .unwrap();

    let a = store.get("test_iso_a", &key).await.unwrap().unwrap();
    let b = store.get("test_iso_b", &key).await.unwrap().unwrap();
    assert_eq!(a.fields["side"], json!("a"));
    assert_eq!(b.fields["side"], json!("b"));
}

pub async fn test_list_and_count<S: ProjectionStore>(store: &S) {
    for key in ["c", "a", "b"] {
        store
            .upsert("test_list", &NaturalKey::from(key), &fields(json!({"id": key})))
            .await
            .unwrap();
    }

    let rows = store.list("test_list").await.unwrap();
    let keys: Vec<&str> = rows.iter().map(|row| row.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert_eq!(store.count("test_list").await.unwrap(), 3);
    assert_eq!(store.count("test_list_empty").await.unwrap(), 0);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all ProjectionStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_projection_store_tests {
    ($store:expr) => {
        use $crate::storage::projection_store_tests::*;

        test_get_nonexistent($store).await;
        println!("  test_get_nonexistent: PASSED");

        test_upsert_inserts($store).await;
        println!("  test_upsert_inserts: PASSED");

        test_upsert_replay_unchanged($store).await;
        println!("  test_upsert_replay_unchanged: PASSED");

        test_upsert_partial_merge($store).await;
        println!("  test_upsert_partial_merge: PASSED");

        test_stub_only_when_absent($store).await;
        println!("  test_stub_only_when_absent: PASSED");

        test_upsert_clears_stub($store).await;
        println!("  test_upsert_clears_stub: PASSED");

        test_stub_does_not_overwrite_row($store).await;
        println!("  test_stub_does_not_overwrite_row: PASSED");

        test_delete_idempotent($store).await;
        println!("  test_delete_idempotent: PASSED");

        test_entity_isolation($store).await;
        println!("  test_entity_isolation: PASSED");

        test_list_and_count($store).await;
        println!("  test_list_and_count: PASSED");
    };
}
