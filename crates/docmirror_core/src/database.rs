//! Database facade and collection registry.

use crate::collection::Collection;
use crate::config::CollectionOptions;
use crate::error::{MirrorError, MirrorResult};
use docmirror_store::{DocumentStore, InMemoryStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The main database handle.
///
/// `Database` owns the store handle and a registry of named collections.
/// Every collection it creates shares the same store.
///
/// ```rust
/// use docmirror_core::{CollectionOptions, Database};
/// use serde_json::json;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let db = Database::in_memory();
/// let todos = db
///     .create_collection(
///         "todos",
///         CollectionOptions::new(json!({
///             "type": "object",
///             "properties": {
///                 "type": { "const": "todo" },
///                 "id": { "type": "string", "primary": true },
///                 "title": { "type": "string" }
///             }
///         })),
///     )
///     .unwrap();
///
/// todos.subscribe().await.unwrap();
/// let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
/// item.save().await.unwrap();
/// assert!(todos.get_item("1").is_some());
/// # });
/// ```
pub struct Database {
    store: Arc<dyn DocumentStore>,
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl Database {
    /// Creates a database over an existing store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a database over a fresh [`InMemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// The shared store handle.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Creates and registers a collection.
    ///
    /// # Errors
    ///
    /// Fails with `EmptyName` or `DuplicateCollection` for a bad name and
    /// with `Schema` when the schema definition is unusable.
    pub fn create_collection(&self, name: &str, options: CollectionOptions) -> MirrorResult<Collection> {
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "collection name" });
        }
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(MirrorError::DuplicateCollection {
                name: name.to_string(),
            });
        }
        let collection = Collection::new(name, Arc::clone(&self.store), options)?;
        collections.insert(name.to_string(), collection.clone());
        debug!(collection = %name, type_name = %collection.type_name(), "collection created");
        Ok(collection)
    }

    /// Looks up a registered collection.
    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.collections.read().get(name).cloned()
    }

    /// Names of every registered collection, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Subscribes every collection in name order, stopping at the first
    /// failure.
    pub async fn subscribe_collections(&self) -> MirrorResult<()> {
        let collections: Vec<Collection> = self.collections.read().values().cloned().collect();
        for collection in collections {
            collection.subscribe().await?;
        }
        Ok(())
    }

    /// Unsubscribes every collection.
    pub async fn unsubscribe_collections(&self) {
        let collections: Vec<Collection> = self.collections.read().values().cloned().collect();
        for collection in collections {
            collection.unsubscribe().await;
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.collection_names())
            .finish_non_exhaustive()
    }
}
