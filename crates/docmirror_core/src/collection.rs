//! Collections: a live cache of one document type.
//!
//! A subscribed collection mirrors every store document whose id starts with
//! `"{type}::"`. The mirror is filled by a range read and then kept current by
//! a change-feed listener task. Each primary key maps to exactly one [`Item`].

use crate::config::CollectionOptions;
use crate::error::{MirrorError, MirrorResult, ValidationError};
use crate::hook::RemoveDecision;
use crate::item::{key_value, Item};
use crate::schema::{Schema, TYPE_FIELD};
use bytes::Bytes;
use docmirror_store::{
    field, AllDocsOptions, ChangeEvent, ChangeStream, ChangesOptions, Document, DocumentStore, Selector,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Separator between type and primary key in composite ids.
pub const KEY_SEPARATOR: &str = "::";

/// A handle to a collection. Clones share the same cache.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

pub(crate) struct CollectionInner {
    name: String,
    schema: Arc<Schema>,
    prefix: String,
    store: Arc<dyn DocumentStore>,
    options: CollectionOptions,
    items: RwLock<BTreeMap<String, Item>>,
    subscribed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Something `remove` can resolve to an item.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    /// An item handle.
    Item(&'a Item),
    /// A primary key or composite id.
    Key(&'a str),
}

impl<'a> From<&'a Item> for ItemRef<'a> {
    fn from(item: &'a Item) -> Self {
        ItemRef::Item(item)
    }
}

impl<'a> From<&'a str> for ItemRef<'a> {
    fn from(key: &'a str) -> Self {
        ItemRef::Key(key)
    }
}

impl<'a> From<&'a String> for ItemRef<'a> {
    fn from(key: &'a String) -> Self {
        ItemRef::Key(key.as_str())
    }
}

impl Collection {
    pub(crate) fn new(
        name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        options: CollectionOptions,
    ) -> MirrorResult<Self> {
        let schema = Arc::new(Schema::new(options.schema.clone())?);
        let prefix = format!("{}{KEY_SEPARATOR}", schema.type_name());
        Ok(Self {
            inner: Arc::new(CollectionInner {
                name: name.into(),
                schema,
                prefix,
                store,
                options,
                items: RwLock::new(BTreeMap::new()),
                subscribed: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<CollectionInner>) -> Self {
        Self { inner }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The compiled schema.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Type discriminant of every document in the collection.
    pub fn type_name(&self) -> &str {
        self.inner.schema.type_name()
    }

    /// Name of the primary field.
    pub fn primary_field(&self) -> &str {
        self.inner.schema.primary_field()
    }

    /// Whether reads carry attachment bodies.
    pub fn loads_attachments(&self) -> bool {
        self.inner.options.load_attachments
    }

    /// Returns true while the change-feed listener is attached.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    /// Store id for a primary key, `"{type}::{key}"`.
    pub fn composite_key(&self, key: &str) -> String {
        format!("{}{key}", self.inner.prefix)
    }

    /// Loads every document of this type and starts following the change feed.
    ///
    /// Clears the cache first, so calling it again after a failure retries
    /// from scratch.
    pub async fn subscribe(&self) -> MirrorResult<()> {
        let inner = &self.inner;
        inner.stop_listener();
        inner.subscribed.store(false, Ordering::SeqCst);
        inner.items.write().clear();

        // Open the feed before reading so nothing committed in between is
        // lost. Replayed revisions are skipped by the items themselves.
        let stream = inner.store.changes(inner.change_options())?;
        let range = AllDocsOptions::prefix(&inner.prefix).attachments(inner.options.load_attachments);
        let docs = inner.store.all_docs(&range).await?;
        let mut loaded = 0;
        for doc in docs {
            if !inner.owns(&doc) {
                trace!(collection = %inner.schema.type_name(), id = %doc.id, "skipping document of another type");
                continue;
            }
            if inner.upsert(doc).is_some() {
                loaded += 1;
            }
        }

        self.spawn_listener(stream);
        inner.subscribed.store(true, Ordering::SeqCst);
        debug!(collection = %inner.schema.type_name(), items = loaded, "subscribed");
        Ok(())
    }

    /// Stops following the change feed and clears the cache.
    pub async fn unsubscribe(&self) {
        self.inner.stop_listener();
        self.inner.items.write().clear();
        self.inner.subscribed.store(false, Ordering::SeqCst);
        debug!(collection = %self.type_name(), "unsubscribed");
    }

    fn spawn_listener(&self, mut stream: ChangeStream) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_change(event);
            }
        });
        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Every cached item, ordered by primary key.
    pub fn all(&self) -> Vec<Item> {
        self.inner.warn_if_unsubscribed("all");
        self.inner.items.read().values().cloned().collect()
    }

    /// Every cached item keyed by primary key.
    pub fn all_map(&self) -> BTreeMap<String, Item> {
        self.inner.warn_if_unsubscribed("all_map");
        self.inner.items.read().clone()
    }

    /// Looks up an item by primary key or composite id.
    pub fn get_item(&self, id: &str) -> Option<Item> {
        self.inner.warn_if_unsubscribed("get_item");
        self.inner.items.read().get(self.inner.normalize(id)).cloned()
    }

    /// Number of cached items.
    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    /// Builds a new, unsaved item from defaults overlaid with `data`.
    ///
    /// An absent or null primary key is filled with a fresh uuid. Any other
    /// value is validated as given. Neither the cache nor the store is
    /// touched until the item is saved.
    pub fn create(&self, data: Value) -> MirrorResult<Item> {
        let schema = &self.inner.schema;
        let mut fields = schema.defaults();
        match data {
            Value::Object(map) => {
                for (name, value) in map {
                    if name.starts_with('_') {
                        debug!(collection = %schema.type_name(), field = %name, "dropping reserved field");
                        continue;
                    }
                    fields.insert(name, value);
                }
            }
            Value::Null => {}
            other => {
                return Err(ValidationError::single("", format!("expected an object, got {other}")).into());
            }
        }

        let primary = schema.primary_field();
        if fields.get(primary).map_or(true, Value::is_null) {
            fields.insert(primary.to_string(), Value::String(Uuid::new_v4().to_string()));
        }

        schema.validate_document(&Value::Object(fields.clone()))?;
        let key = fields
            .get(primary)
            .and_then(key_value)
            .ok_or_else(|| MirrorError::missing_key(primary))?;

        let doc = Document::with_fields(self.composite_key(&key), fields);
        Ok(Item::new(doc, Arc::downgrade(&self.inner), Arc::clone(schema)))
    }

    /// Creates one item per entry, saving each in order when `save` is set.
    pub async fn bulk_create(&self, data: Vec<Value>, save: bool) -> MirrorResult<Vec<Item>> {
        let items = data
            .into_iter()
            .map(|entry| self.create(entry))
            .collect::<MirrorResult<Vec<_>>>()?;
        if save {
            for item in &items {
                item.save().await?;
            }
        }
        Ok(items)
    }

    /// Writes an item and returns the stored document.
    ///
    /// The item is registered in the cache before the write, so concurrent
    /// puts of a new key share one cache entry. A failed write leaves that
    /// entry in place for the retry.
    pub async fn put(&self, item: &Item) -> MirrorResult<Document> {
        if !item.belongs_to(&self.inner) {
            return Err(MirrorError::ForeignItem);
        }
        let doc = item.doc();
        if doc.id.is_empty() {
            return Err(MirrorError::missing_key("_id"));
        }
        let key = self
            .inner
            .primary_of(&doc)
            .ok_or_else(|| MirrorError::missing_key(self.primary_field()))?;

        self.inner
            .items
            .write()
            .entry(key.clone())
            .or_insert_with(|| item.clone());

        let id = doc.id.clone();
        if let Err(e) = self.inner.store.put(doc).await {
            warn!(collection = %self.type_name(), key = %key, error = %e, "put failed");
            return Err(e.into());
        }
        let stored = self.inner.store.get(&id, self.inner.options.load_attachments).await?;
        trace!(collection = %self.type_name(), key = %key, rev = ?stored.rev, "put");
        Ok(stored)
    }

    /// Adds an attachment to a saved item directly in the store and pushes
    /// the result into the cache.
    pub async fn put_attachment(
        &self,
        item_id: &str,
        name: &str,
        data: impl Into<Bytes>,
        content_type: &str,
    ) -> MirrorResult<()> {
        let item = self
            .get_item(item_id)
            .ok_or_else(|| MirrorError::not_found(item_id))?;
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "attachment name" });
        }
        let id = item.id();
        let current = self.inner.store.get(&id, false).await?;
        let rev = current.rev.ok_or(MirrorError::NotPersisted)?;
        self.inner
            .store
            .put_attachment(&id, name, &rev, data.into(), content_type)
            .await?;
        let doc = self.inner.store.get(&id, self.inner.options.load_attachments).await?;
        self.inner.upsert(doc);
        Ok(())
    }

    /// Fetches an attachment body from the store.
    pub async fn load_attachment(&self, item_id: &str, name: &str) -> MirrorResult<Bytes> {
        if item_id.is_empty() {
            return Err(MirrorError::EmptyName { what: "item id" });
        }
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "attachment name" });
        }
        let id = self.composite_key(self.inner.normalize(item_id));
        Ok(self.inner.store.get_attachment(&id, name).await?)
    }

    /// Deletes an item, consulting the before-remove hook first.
    ///
    /// The tombstone and any documents the hook adds are written in one
    /// batch. If the batch fails the item goes back into the cache, unless
    /// another item has taken its key meanwhile.
    pub async fn remove<'a>(&self, target: impl Into<ItemRef<'a>>) -> MirrorResult<()> {
        let item = match target.into() {
            ItemRef::Item(item) => item.clone(),
            ItemRef::Key(key) => self
                .get_item(key)
                .ok_or_else(|| MirrorError::not_found(key))?,
        };
        if !item.belongs_to(&self.inner) {
            return Err(MirrorError::ForeignItem);
        }
        if item.is_new() {
            return Err(MirrorError::NotPersisted);
        }
        let key = item
            .key()
            .ok_or_else(|| MirrorError::missing_key(self.primary_field()))?;

        let mut batch = match &self.inner.options.before_remove {
            Some(hook) => match hook.before_remove(&item).await.map_err(MirrorError::Hook)? {
                RemoveDecision::Proceed => Vec::new(),
                RemoveDecision::Veto => {
                    debug!(collection = %self.type_name(), key = %key, "removal vetoed");
                    return Err(MirrorError::Vetoed { key });
                }
                RemoveDecision::ProceedWith(docs) => docs,
            },
            None => Vec::new(),
        };

        let mut tombstone = self.inner.store.get(&item.id(), false).await?;
        tombstone.deleted = true;
        batch.push(tombstone);

        let evicted = self.inner.evict(&key, &item);
        match self.inner.store.bulk_docs(batch).await {
            Ok(_) => {
                item.mark_removed();
                debug!(collection = %self.type_name(), key = %key, "removed");
                Ok(())
            }
            Err(e) => {
                if evicted {
                    self.inner.items.write().entry(key.clone()).or_insert(item);
                }
                warn!(collection = %self.type_name(), key = %key, error = %e, "remove failed");
                Err(e.into())
            }
        }
    }

    /// Runs a store query restricted to this type and maps the results to
    /// cached items. Results without a cached item are dropped.
    pub async fn find(&self, selector: Selector) -> MirrorResult<Vec<Item>> {
        let selector = field(TYPE_FIELD).eq(self.type_name()).and(selector);
        let docs = self.inner.store.find(&selector).await?;
        let items = self.inner.items.read();
        Ok(docs
            .iter()
            .filter_map(|doc| self.inner.primary_of(doc))
            .filter_map(|key| items.get(&key).cloned())
            .collect())
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("type", &self.type_name())
            .field("subscribed", &self.is_subscribed())
            .field("items", &self.len())
            .finish()
    }
}

impl CollectionInner {
    fn change_options(&self) -> ChangesOptions {
        let type_name = self.schema.type_name().to_string();
        let prefix = self.prefix.clone();
        ChangesOptions::live()
            .attachments(self.options.load_attachments)
            .filter(move |doc| owns(doc, &type_name, &prefix))
    }

    fn owns(&self, doc: &Document) -> bool {
        owns(doc, self.schema.type_name(), &self.prefix)
    }

    fn normalize<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(self.prefix.as_str()).unwrap_or(id)
    }

    fn primary_of(&self, doc: &Document) -> Option<String> {
        doc.field(self.schema.primary_field()).and_then(key_value)
    }

    fn warn_if_unsubscribed(&self, operation: &str) {
        if !self.subscribed.load(Ordering::SeqCst) {
            warn!(collection = %self.schema.type_name(), operation, "read from unsubscribed collection");
        }
    }

    fn stop_listener(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Removes `key` from the cache if it still maps to `item`.
    fn evict(&self, key: &str, item: &Item) -> bool {
        let mut items = self.items.write();
        match items.get(key) {
            Some(cached) if Item::ptr_eq(cached, item) => {
                items.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Merges a store document into the cached item for its key, creating
    /// the item if there is none.
    pub(crate) fn upsert(self: &Arc<Self>, doc: Document) -> Option<Item> {
        let Some(key) = self.primary_of(&doc) else {
            warn!(collection = %self.schema.type_name(), id = %doc.id, "document has no primary key");
            return None;
        };
        let mut items = self.items.write();
        if let Some(item) = items.get(&key) {
            item.absorb(doc);
            return Some(item.clone());
        }
        let item = Item::new(doc, Arc::downgrade(self), Arc::clone(&self.schema));
        items.insert(key, item.clone());
        Some(item)
    }

    pub(crate) fn apply_change(self: &Arc<Self>, event: ChangeEvent) {
        let Some(doc) = event.doc else {
            trace!(id = %event.id, "change without document");
            return;
        };
        if !self.owns(&doc) {
            return;
        }
        if event.deleted {
            let key = self
                .primary_of(&doc)
                .or_else(|| doc.id.strip_prefix(self.prefix.as_str()).map(str::to_string));
            let evicted = key.and_then(|key| self.items.write().remove(&key));
            if let Some(item) = evicted {
                trace!(collection = %self.schema.type_name(), id = %doc.id, "evicted by feed");
                item.mark_removed();
            }
        } else {
            self.upsert(doc);
        }
    }
}

impl Drop for CollectionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

/// Tombstones written by other clients may carry no fields, so the id prefix
/// stands in for a missing discriminant.
fn owns(doc: &Document, type_name: &str, prefix: &str) -> bool {
    match doc.field(TYPE_FIELD).and_then(Value::as_str) {
        Some(t) => t == type_name,
        None => doc.id.starts_with(prefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmirror_store::InMemoryStore;
    use serde_json::json;

    fn options() -> CollectionOptions {
        CollectionOptions::new(json!({
            "type": "object",
            "properties": {
                "type": { "const": "todo" },
                "id": { "type": "string", "primary": true },
                "title": { "type": "string", "index": true },
                "counter": { "type": "integer", "maximum": 99, "default": 0 }
            },
            "required": ["id", "title"]
        }))
    }

    fn collection() -> (Arc<InMemoryStore>, Collection) {
        let store = Arc::new(InMemoryStore::new());
        let collection = Collection::new("todos", store.clone(), options()).unwrap();
        (store, collection)
    }

    #[test]
    fn composite_keys() {
        let (_, todos) = collection();
        assert_eq!(todos.composite_key("1"), "todo::1");
        assert_eq!(todos.inner.normalize("todo::1"), "1");
        assert_eq!(todos.inner.normalize("1"), "1");
    }

    #[test]
    fn create_applies_defaults_and_generates_keys() {
        let (store, todos) = collection();
        let item = todos.create(json!({ "title": "milk" })).unwrap();
        assert!(item.is_new());
        assert!(!item.is_dirty());
        assert_eq!(item.get("counter"), Some(json!(0)));
        assert_eq!(item.get("type"), Some(json!("todo")));
        let key = item.key().unwrap();
        assert_eq!(item.id(), format!("todo::{key}"));
        assert!(todos.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn create_validates() {
        let (_, todos) = collection();
        let err = todos.create(json!({ "id": "1" })).unwrap_err();
        let MirrorError::Validation(err) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(err.mentions("title"));
        assert!(todos.create(json!({ "title": "x", "counter": 100 })).is_err());
        assert!(todos.create(json!([1, 2])).is_err());
    }

    #[test]
    fn create_drops_reserved_fields() {
        let (_, todos) = collection();
        let item = todos
            .create(json!({ "id": "1", "title": "x", "_rev": "9-z" }))
            .unwrap();
        assert!(item.is_new());
    }

    #[tokio::test]
    async fn put_registers_before_write() {
        let (store, todos) = collection();
        let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
        store.close();

        assert!(todos.put(&item).await.is_err());
        let cached = todos.get_item("1").unwrap();
        assert!(Item::ptr_eq(&cached, &item));
    }

    #[tokio::test]
    async fn put_rejects_foreign_items() {
        let (store, todos) = collection();
        let other = Collection::new("other", store, options()).unwrap();
        let item = other.create(json!({ "id": "1", "title": "milk" })).unwrap();
        assert!(matches!(todos.put(&item).await, Err(MirrorError::ForeignItem)));
    }

    #[tokio::test]
    async fn feed_tombstones_evict() {
        let (_, todos) = collection();
        todos.subscribe().await.unwrap();
        let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
        item.save().await.unwrap();

        let mut tombstone = Document::new("todo::1");
        tombstone.deleted = true;
        todos.inner.apply_change(ChangeEvent {
            seq: 99,
            id: "todo::1".into(),
            deleted: true,
            doc: Some(tombstone),
        });
        assert!(todos.get_item("1").is_none());
        assert!(item.is_removed());
    }

    #[tokio::test]
    async fn feed_ignores_other_types() {
        let (_, todos) = collection();
        todos.subscribe().await.unwrap();
        let doc = Document::with_fields(
            "user::1",
            json!({ "type": "user", "id": "1" }).as_object().cloned().unwrap(),
        );
        todos.inner.apply_change(ChangeEvent {
            seq: 1,
            id: doc.id.clone(),
            deleted: false,
            doc: Some(doc),
        });
        assert!(todos.is_empty());
    }

    #[tokio::test]
    async fn load_attachment_checks_names() {
        let (_, todos) = collection();
        assert!(matches!(
            todos.load_attachment("", "a").await,
            Err(MirrorError::EmptyName { what: "item id" })
        ));
        assert!(matches!(
            todos.load_attachment("1", "").await,
            Err(MirrorError::EmptyName { what: "attachment name" })
        ));
    }

    #[tokio::test]
    async fn remove_unknown_key() {
        let (_, todos) = collection();
        todos.subscribe().await.unwrap();
        assert!(matches!(todos.remove("nope").await, Err(MirrorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn failed_remove_restores_item() {
        let (store, todos) = collection();
        todos.subscribe().await.unwrap();
        let item = todos.create(json!({ "id": "1", "title": "milk" })).unwrap();
        item.save().await.unwrap();

        // a stale extra document makes the batch fail
        let todos = {
            let store: Arc<dyn DocumentStore> = store.clone();
            let options = options().before_remove(crate::hook::hook_fn(|_| async {
                let mut stale = Document::new("todo::1");
                stale.rev = Some("1-stale".into());
                Ok(RemoveDecision::ProceedWith(vec![stale]))
            }));
            let hooked = Collection::new("todos", store, options).unwrap();
            hooked.subscribe().await.unwrap();
            hooked
        };
        let item = todos.get_item("1").unwrap();
        assert!(todos.remove(&item).await.is_err());
        assert!(Item::ptr_eq(&todos.get_item("1").unwrap(), &item));
        assert!(!item.is_removed());
    }

    #[tokio::test]
    async fn unsubscribe_clears_cache() {
        let (_, todos) = collection();
        todos.subscribe().await.unwrap();
        todos
            .create(json!({ "id": "1", "title": "milk" }))
            .unwrap()
            .save()
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);

        todos.unsubscribe().await;
        assert!(!todos.is_subscribed());
        assert!(todos.is_empty());
        todos.unsubscribe().await;
    }
}
