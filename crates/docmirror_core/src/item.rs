//! Live handles to cached documents.

use crate::collection::{Collection, CollectionInner};
use crate::error::{MirrorError, MirrorResult};
use crate::schema::Schema;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use docmirror_store::{Attachment, Attachments, Document};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

const ATTACHMENTS_FIELD: &str = "_attachments";

/// A handle to one document of a collection.
///
/// Items are cheap to clone; clones share state. A subscribed collection
/// hands out at most one item per primary key, so two handles for the same
/// key are always [`Item::ptr_eq`].
///
/// Every change to the document, the dirty flag or the attachment view bumps
/// a version counter that can be observed with [`Item::watch`].
#[derive(Clone)]
pub struct Item {
    inner: Arc<ItemInner>,
}

struct ItemInner {
    collection: Weak<CollectionInner>,
    schema: Arc<Schema>,
    state: RwLock<ItemState>,
    version: watch::Sender<u64>,
}

struct ItemState {
    /// Document without attachments; those live in `attachments`.
    doc: Document,
    attachments: Attachments,
    dirty: bool,
    removed: bool,
}

impl Item {
    pub(crate) fn new(mut doc: Document, collection: Weak<CollectionInner>, schema: Arc<Schema>) -> Self {
        let attachments = std::mem::take(&mut doc.attachments);
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(ItemInner {
                collection,
                schema,
                state: RwLock::new(ItemState {
                    doc,
                    attachments,
                    dirty: false,
                    removed: false,
                }),
                version,
            }),
        }
    }

    /// Returns true if both handles point at the same item.
    pub fn ptr_eq(a: &Item, b: &Item) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Composite store id, `"{type}::{primary}"`.
    pub fn id(&self) -> String {
        self.inner.state.read().doc.id.clone()
    }

    /// Primary key value.
    pub fn key(&self) -> Option<String> {
        let state = self.inner.state.read();
        state
            .doc
            .field(self.inner.schema.primary_field())
            .and_then(key_value)
    }

    /// Current revision, `None` until saved.
    pub fn rev(&self) -> Option<String> {
        self.inner.state.read().doc.rev.clone()
    }

    /// Returns true if the item has never been saved.
    pub fn is_new(&self) -> bool {
        self.inner.state.read().doc.is_new()
    }

    /// Returns true if the item has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.inner.state.read().dirty
    }

    /// Returns true once the item has been removed from the store.
    pub fn is_removed(&self) -> bool {
        self.inner.state.read().removed
    }

    /// Returns a copy of the current document, attachments included.
    pub fn doc(&self) -> Document {
        let state = self.inner.state.read();
        let mut doc = state.doc.clone();
        doc.attachments = state.attachments.clone();
        doc
    }

    /// Reads a field by dotted path. Reflects unsaved changes.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.state.read().doc.get_path(path)
    }

    /// Reads a field and decodes it, `None` if absent or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|value| serde_json::from_value(value).ok())
    }

    /// Decodes the whole document into a model type.
    pub fn to_model<T: DeserializeOwned>(&self) -> MirrorResult<T> {
        let value = serde_json::to_value(self.doc())?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sets one field and marks the item dirty.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> &Self {
        let mut patch = Map::new();
        patch.insert(field.to_string(), value.into());
        self.apply(patch, false);
        self
    }

    /// Merges the fields of `patch` and marks the item dirty.
    pub fn set_doc(&self, patch: Value) -> &Self {
        self.merge(patch, false)
    }

    /// Merges the fields of `patch`, leaving the dirty flag alone when
    /// `dont_dirty` is set.
    ///
    /// `_id`, `_rev`, `_deleted` and the primary field are never overwritten.
    /// An `_attachments` entry replaces the attachment view wholesale.
    pub fn merge(&self, patch: Value, dont_dirty: bool) -> &Self {
        match patch {
            Value::Object(map) => self.apply(map, dont_dirty),
            other => warn!(id = %self.id(), patch = %other, "ignoring non-object patch"),
        }
        self
    }

    fn apply(&self, patch: Map<String, Value>, dont_dirty: bool) {
        let primary = self.inner.schema.primary_field();
        let mut changed = false;
        {
            let mut state = self.inner.state.write();
            for (field, value) in patch {
                if matches!(field.as_str(), "_id" | "_rev" | "_deleted") || field == primary {
                    debug!(id = %state.doc.id, field = %field, "dropping write to protected field");
                    continue;
                }
                if field == ATTACHMENTS_FIELD {
                    match serde_json::from_value::<Attachments>(value) {
                        Ok(attachments) => state.attachments = attachments,
                        Err(e) => {
                            warn!(id = %state.doc.id, error = %e, "ignoring malformed attachments");
                            continue;
                        }
                    }
                } else {
                    state.doc.fields.insert(field, value);
                }
                if !dont_dirty {
                    state.dirty = true;
                }
                changed = true;
            }
        }
        if changed {
            self.bump();
        }
    }

    /// Writes the item through its collection and adopts the stored document.
    ///
    /// On failure the item keeps its state, including the dirty flag.
    pub async fn save(&self) -> MirrorResult<()> {
        if self.is_removed() {
            return Err(MirrorError::Removed);
        }
        let collection = self.collection()?;
        let stored = collection.put(self).await?;
        self.replace(stored);
        Ok(())
    }

    /// Removes the item through its collection.
    pub async fn remove(&self) -> MirrorResult<()> {
        if self.is_new() {
            return Err(MirrorError::NotPersisted);
        }
        self.collection()?.remove(self).await
    }

    /// Adds or replaces a local attachment. Persisted by the next save.
    pub fn attach(&self, name: &str, data: impl Into<Bytes>, content_type: &str) -> MirrorResult<()> {
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "attachment name" });
        }
        {
            let mut state = self.inner.state.write();
            state
                .attachments
                .insert(name.to_string(), Attachment::local(data, content_type));
            state.dirty = true;
        }
        self.bump();
        Ok(())
    }

    /// Drops an attachment. Persisted by the next save.
    pub fn detach(&self, name: &str) -> MirrorResult<()> {
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "attachment name" });
        }
        {
            let mut state = self.inner.state.write();
            if state.attachments.remove(name).is_none() {
                return Err(MirrorError::attachment_not_found(name));
            }
            state.dirty = true;
        }
        self.bump();
        Ok(())
    }

    /// Returns true if an attachment of that name exists.
    pub fn has_attachment(&self, name: &str) -> bool {
        self.inner.state.read().attachments.contains_key(name)
    }

    /// Digest of the named attachment.
    pub fn attachment_digest(&self, name: &str) -> Option<String> {
        self.inner
            .state
            .read()
            .attachments
            .get(name)
            .map(|attachment| attachment.digest.clone())
    }

    /// The named attachment as currently held, stub or local.
    pub fn get_attachment(&self, name: &str) -> Option<Attachment> {
        self.inner.state.read().attachments.get(name).cloned()
    }

    /// Every attachment as currently held.
    pub fn attachments(&self) -> Attachments {
        self.inner.state.read().attachments.clone()
    }

    /// `Some(true)` if the named attachment carries its body.
    pub fn is_local_attachment(&self, name: &str) -> Option<bool> {
        self.inner
            .state
            .read()
            .attachments
            .get(name)
            .map(Attachment::is_local)
    }

    /// Returns the named attachment with its body.
    ///
    /// Stubs are fetched from the store. The returned value is a copy; the
    /// item keeps holding the stub.
    pub async fn load_attachment(&self, name: &str) -> MirrorResult<Attachment> {
        if name.is_empty() {
            return Err(MirrorError::EmptyName { what: "attachment name" });
        }
        let attachment = self
            .get_attachment(name)
            .ok_or_else(|| MirrorError::attachment_not_found(name))?;
        if attachment.is_local() {
            return Ok(attachment);
        }
        let data = self.collection()?.load_attachment(&self.id(), name).await?;
        Ok(attachment.with_data(data))
    }

    /// Returns a `data:` URL for the named attachment.
    ///
    /// Resolves to `None` when the attachment is a stub and `local_only` is
    /// set.
    pub async fn load_attachment_as_url(&self, name: &str, local_only: bool) -> MirrorResult<Option<String>> {
        let attachment = self
            .get_attachment(name)
            .ok_or_else(|| MirrorError::attachment_not_found(name))?;
        let loaded = if attachment.is_local() {
            attachment
        } else if local_only {
            return Ok(None);
        } else {
            self.load_attachment(name).await?
        };
        Ok(loaded
            .data
            .as_ref()
            .map(|data| data_url(&loaded.content_type, data)))
    }

    /// The owning collection.
    pub fn collection(&self) -> MirrorResult<Collection> {
        self.inner
            .collection
            .upgrade()
            .map(Collection::from_inner)
            .ok_or(MirrorError::Detached)
    }

    /// Current version. Starts at 0 and grows with every change.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Subscribes to version changes.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub(crate) fn belongs_to(&self, collection: &Arc<CollectionInner>) -> bool {
        std::ptr::eq(self.inner.collection.as_ptr(), Arc::as_ptr(collection))
    }

    /// Merges a pushed document without dirtying.
    ///
    /// Pushes that are not newer than the held revision are skipped, so an
    /// echo of our own save or a replayed event never rolls the item back.
    pub(crate) fn absorb(&self, mut doc: Document) -> bool {
        {
            let mut state = self.inner.state.write();
            if !supersedes(doc.rev.as_deref(), state.doc.rev.as_deref()) {
                trace!(id = %doc.id, rev = ?doc.rev, "skipping stale push");
                return false;
            }
            let primary = self.inner.schema.primary_field();
            for (field, value) in std::mem::take(&mut doc.fields) {
                if field != primary {
                    state.doc.fields.insert(field, value);
                }
            }
            state.doc.rev = doc.rev;
            state.attachments = doc.attachments;
        }
        self.bump();
        true
    }

    /// Adopts the canonical document returned after a save.
    pub(crate) fn replace(&self, mut doc: Document) {
        {
            let mut state = self.inner.state.write();
            let current = state.doc.rev.as_deref();
            if doc.rev.as_deref() == current || supersedes(doc.rev.as_deref(), current) {
                state.attachments = std::mem::take(&mut doc.attachments);
                state.doc = doc;
            }
            state.dirty = false;
        }
        self.bump();
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.state.write().removed = true;
        self.bump();
    }

    fn bump(&self) {
        self.inner.version.send_modify(|version| *version += 1);
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        Item::ptr_eq(self, other)
    }
}

impl Eq for Item {}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Item")
            .field("id", &state.doc.id)
            .field("rev", &state.doc.rev)
            .field("dirty", &state.dirty)
            .field("removed", &state.removed)
            .finish_non_exhaustive()
    }
}

/// String form of a primary key value. Empty strings are no key.
pub(crate) fn key_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn generation(rev: &str) -> Option<u64> {
    rev.split_once('-').and_then(|(gen, _)| gen.parse().ok())
}

/// Returns true if `incoming` is a later revision than `current`.
fn supersedes(incoming: Option<&str>, current: Option<&str>) -> bool {
    match (incoming, current) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) if a == b => false,
        (Some(a), Some(b)) => match (generation(a), generation(b)) {
            (Some(x), Some(y)) => x >= y,
            _ => true,
        },
    }
}

fn data_url(content_type: &str, data: &[u8]) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(data))
}
