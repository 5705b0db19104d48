//! Integration tests for put ordering and duplicate suppression.

use docmirror_core::{Item, MirrorError};
use docmirror_store::{AllDocsOptions, DocumentStore};
use docmirror_testkit::TestDatabase;
use serde_json::json;

#[tokio::test]
async fn concurrent_puts_of_a_new_key_create_one_document() {
    let db = TestDatabase::memory();
    let todos = db.todos();
    todos.subscribe().await.unwrap();

    let first = todos.create(json!({ "id": "dup", "title": "one" })).unwrap();
    let second = todos.create(json!({ "id": "dup", "title": "two" })).unwrap();

    let (a, b) = tokio::join!(first.save(), second.save());
    assert_eq!(
        [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
        1,
        "exactly one save wins: {a:?} / {b:?}"
    );

    let docs = db
        .store
        .all_docs(&AllDocsOptions::prefix("todo::"))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(todos.len(), 1);

    let cached = todos.get_item("dup").unwrap();
    assert!(Item::ptr_eq(&cached, &first) || Item::ptr_eq(&cached, &second));
}

#[tokio::test]
async fn losing_put_keeps_its_state() {
    let db = TestDatabase::memory();
    let todos = db.todos();
    todos.subscribe().await.unwrap();

    let first = todos.create(json!({ "id": "dup", "title": "one" })).unwrap();
    first.save().await.unwrap();

    let second = todos.create(json!({ "id": "dup", "title": "two" })).unwrap();
    second.set("counter", 1);
    let err = second.save().await.unwrap_err();
    assert!(matches!(err, MirrorError::Store(ref e) if e.is_conflict()));
    assert!(second.is_dirty());
    assert!(second.is_new());
    assert!(Item::ptr_eq(&todos.get_item("dup").unwrap(), &first));
}

#[tokio::test]
async fn failed_put_leaves_entry_for_retry() {
    let db = TestDatabase::memory();
    let todos = db.todos();
    todos.subscribe().await.unwrap();

    let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
    item.attach("bad", vec![1u8], "text/plain").unwrap();
    // a stub nobody stored makes the write fail
    item.set_doc(json!({
        "_attachments": {
            "bad": { "content_type": "text/plain", "digest": "sha256-00", "length": 1, "stub": true }
        }
    }));
    assert!(item.save().await.is_err());
    assert!(item.is_dirty());
    assert!(Item::ptr_eq(&todos.get_item("1").unwrap(), &item));
    assert!(db.store.is_empty());

    item.set_doc(json!({ "_attachments": {} }));
    item.save().await.unwrap();
    assert_eq!(todos.len(), 1);
    assert_eq!(db.store.len(), 1);
}

#[tokio::test]
async fn save_after_remove_fails() {
    let db = TestDatabase::memory();
    let todos = db.todos();
    todos.subscribe().await.unwrap();

    let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
    item.save().await.unwrap();
    item.remove().await.unwrap();

    assert!(item.is_removed());
    assert!(matches!(item.save().await, Err(MirrorError::Removed)));
}

#[tokio::test]
async fn items_of_another_collection_are_rejected() {
    let db = TestDatabase::memory();
    let todos = db.todos();
    let other = TestDatabase::over(db.store.clone());
    let foreign = other.todos();

    let item = foreign.create(json!({ "id": "1", "title": "milk" })).unwrap();
    assert!(matches!(todos.put(&item).await, Err(MirrorError::ForeignItem)));

    item.save().await.unwrap();
    todos.subscribe().await.unwrap();
    assert!(matches!(todos.remove(&item).await, Err(MirrorError::ForeignItem)));
    assert!(todos.get_item("1").is_some());
}
