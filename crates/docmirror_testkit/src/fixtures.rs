//! Test fixtures and database helpers.

use docmirror_core::{Collection, CollectionOptions, Database};
use docmirror_store::{DocumentStore, InMemoryStore};
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Schema of the `todo` type used throughout the tests.
///
/// Defaults: `type`, `desc` and `counter` (0..=99).
pub fn todo_schema() -> Value {
    json!({
        "title": "todo",
        "type": "object",
        "properties": {
            "type": { "type": "string", "const": "todo" },
            "id": { "type": "string", "primary": true },
            "title": { "type": "string", "index": true },
            "desc": { "type": "string", "default": "" },
            "counter": { "type": "integer", "minimum": 0, "maximum": 99, "default": 0 },
            "params": {
                "type": "object",
                "properties": {
                    "param1": { "type": "string", "index": true },
                    "param2": { "type": "string" }
                }
            }
        },
        "required": ["id", "title"]
    })
}

/// Schema of the `user` type, keyed by a numeric id.
pub fn user_schema() -> Value {
    json!({
        "title": "user",
        "type": "object",
        "properties": {
            "type": { "type": "string", "default": "user" },
            "id": { "type": "integer", "primary": true },
            "name": { "type": "string", "index": true },
            "email": { "type": "string" }
        },
        "required": ["id", "name"]
    })
}

/// A database over an in-memory store, with the store kept at hand.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The store behind it.
    pub store: Arc<InMemoryStore>,
}

impl TestDatabase {
    /// Creates a database over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::over(Arc::new(InMemoryStore::new()))
    }

    /// Creates a second database over an existing store.
    pub fn over(store: Arc<InMemoryStore>) -> Self {
        let shared: Arc<dyn DocumentStore> = store.clone();
        Self {
            db: Database::new(shared),
            store,
        }
    }

    /// Registers (or returns) the `todos` collection.
    pub fn todos(&self) -> Collection {
        self.todos_with(CollectionOptions::new(todo_schema()))
    }

    /// Registers the `todos` collection with custom options.
    pub fn todos_with(&self, options: CollectionOptions) -> Collection {
        self.db.collection("todos").unwrap_or_else(|| {
            self.db
                .create_collection("todos", options)
                .expect("todo schema is valid")
        })
    }

    /// Registers (or returns) the `users` collection.
    pub fn users(&self) -> Collection {
        self.db.collection("users").unwrap_or_else(|| {
            self.db
                .create_collection("users", CollectionOptions::new(user_schema()))
                .expect("user schema is valid")
        })
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Installs a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met. Change-feed listeners run as
/// separate tasks, so assertions on feed effects go through here.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// [`wait_until`] with a one second timeout.
pub async fn eventually<F>(condition: F) -> bool
where
    F: FnMut() -> bool,
{
    wait_until(Duration::from_secs(1), condition).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_are_registered_once() {
        let db = TestDatabase::memory();
        let a = db.todos();
        let b = db.todos();
        assert_eq!(a.name(), b.name());
        assert_eq!(db.collection_names(), ["todos"]);
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false).await);
        assert!(eventually(|| true).await);
    }
}
