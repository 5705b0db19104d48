//! Property tests for item creation and identity.

use docmirror_core::{Item, Schema};
use docmirror_testkit::{
    attachment_strategy, primary_key_strategy, todo_data_strategy, todo_schema, TestDatabase,
};
use proptest::prelude::*;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn created_items_are_keyed_and_clean(data in todo_data_strategy()) {
        let db = TestDatabase::memory();
        let todos = db.todos();
        let item = todos.create(data.clone()).unwrap();

        let key = item.key().unwrap();
        prop_assert_eq!(item.id(), format!("todo::{key}"));
        if let Some(id) = data["id"].as_str() {
            prop_assert_eq!(key.as_str(), id);
        }
        prop_assert!(item.is_new());
        prop_assert!(!item.is_dirty());
        prop_assert_eq!(item.get("desc"), Some(json!("")));
    }

    #[test]
    fn saved_items_are_the_cached_items(keys in prop::collection::btree_set(primary_key_strategy(), 1..8)) {
        runtime().block_on(async {
            let db = TestDatabase::memory();
            let todos = db.todos();
            todos.subscribe().await.unwrap();

            let mut items = Vec::new();
            for key in &keys {
                let item = todos.create(json!({ "id": key, "title": "t" })).unwrap();
                item.save().await.unwrap();
                items.push(item);
            }

            assert_eq!(todos.len(), keys.len());
            for item in &items {
                let key = item.key().unwrap();
                assert!(Item::ptr_eq(&todos.get_item(&key).unwrap(), item));
                assert!(Item::ptr_eq(&todos.get_item(&item.id()).unwrap(), item));
            }
        });
    }

    #[test]
    fn attachments_survive_save_and_reload((name, body, content_type) in attachment_strategy()) {
        runtime().block_on(async {
            let db = TestDatabase::memory();
            let todos = db.todos();
            todos.subscribe().await.unwrap();

            let item = todos.create(json!({ "id": "a", "title": "t" })).unwrap();
            item.attach(name.as_str(), body.clone(), content_type.as_str()).unwrap();
            item.save().await.unwrap();
            let digest = item.attachment_digest(&name).unwrap();

            let other = TestDatabase::over(db.store.clone());
            let reader = other.todos();
            reader.subscribe().await.unwrap();
            let copy = reader.get_item("a").unwrap();
            assert_eq!(copy.attachment_digest(&name).as_deref(), Some(digest.as_str()));

            let loaded = copy.load_attachment(&name).await.unwrap();
            assert_eq!(loaded.content_type, content_type);
            assert_eq!(loaded.length, body.len() as u64);
            assert_eq!(loaded.data.as_deref(), Some(body.as_slice()));
        });
    }

    #[test]
    fn counter_bounds_follow_the_schema(counter in -50i64..150) {
        let schema = Schema::new(todo_schema()).unwrap();
        let result = schema.validate_property("counter", &json!(counter));
        prop_assert_eq!(result.is_ok(), (0..=99).contains(&counter));
    }
}
