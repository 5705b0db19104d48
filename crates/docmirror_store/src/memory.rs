//! In-memory document store.

use crate::backend::{AllDocsOptions, DocumentStore, PutResponse};
use crate::changes::{ChangeEvent, ChangeFeed, ChangeStream, ChangesOptions};
use crate::document::{Attachment, Document};
use crate::error::{StoreError, StoreResult};
use crate::selector::Selector;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

#[derive(Debug, Default)]
struct State {
    /// Every document ever written, tombstones included, with bodies.
    docs: BTreeMap<String, Document>,
    /// Last committed sequence.
    seq: u64,
}

/// An in-memory document store.
///
/// This store keeps all documents and attachment bodies in memory and is
/// suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral caches that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads and
/// collections behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use docmirror_store::{Document, DocumentStore, InMemoryStore};
///
/// # tokio_test_block(async {
/// let store = InMemoryStore::new();
/// let written = store.put(Document::new("todo::1")).await.unwrap();
/// assert!(written.rev.starts_with("1-"));
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    feed: ChangeFeed,
    closed: AtomicBool,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (non-deleted) documents.
    pub fn len(&self) -> usize {
        self.state.read().docs.values().filter(|d| !d.deleted).count()
    }

    /// Returns true if the store holds no live documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the last committed sequence number.
    pub fn sequence(&self) -> u64 {
        self.state.read().seq
    }

    /// Returns the change feed, for inspection.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Closes the store. Every later operation fails with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn live<'a>(state: &'a State, id: &str) -> StoreResult<&'a Document> {
        state
            .docs
            .get(id)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| StoreError::not_found(id))
    }

    /// Commits already prepared documents and publishes them.
    ///
    /// Runs under the state write lock so events leave in commit order.
    fn commit(&self, state: &mut State, prepared: Vec<Document>) -> Vec<PutResponse> {
        let mut responses = Vec::with_capacity(prepared.len());
        let mut events = Vec::with_capacity(prepared.len());

        for doc in prepared {
            state.seq += 1;
            trace!(seq = state.seq, id = %doc.id, deleted = doc.deleted, "commit");
            let rev = doc.rev.clone().unwrap_or_default();
            responses.push(PutResponse {
                id: doc.id.clone(),
                rev,
            });
            events.push(ChangeEvent {
                seq: state.seq,
                id: doc.id.clone(),
                deleted: doc.deleted,
                doc: Some(doc.clone()),
            });
            state.docs.insert(doc.id.clone(), doc);
        }

        self.feed.emit_batch(events);
        responses
    }
}

/// Validates `doc` against `current` and returns the document to store.
fn prepare(current: Option<&Document>, mut doc: Document) -> StoreResult<Document> {
    if doc.id.is_empty() {
        return Err(StoreError::invalid("document id must not be empty"));
    }

    match current {
        Some(existing) if !existing.deleted => {
            if doc.rev != existing.rev {
                return Err(StoreError::conflict(&doc.id));
            }
        }
        Some(tombstone) => {
            if doc.rev.is_some() && doc.rev != tombstone.rev {
                return Err(StoreError::conflict(&doc.id));
            }
        }
        None => {
            if doc.rev.is_some() {
                return Err(StoreError::conflict(&doc.id));
            }
        }
    }

    if doc.deleted {
        doc.attachments.clear();
    } else {
        let mut resolved = BTreeMap::new();
        for (name, attachment) in std::mem::take(&mut doc.attachments) {
            let stored = match attachment.data {
                Some(data) => Attachment {
                    digest: digest_of(&data),
                    length: data.len() as u64,
                    content_type: attachment.content_type,
                    data: Some(data),
                    stub: false,
                },
                None => current
                    .and_then(|c| c.attachments.get(&name))
                    .filter(|existing| existing.digest == attachment.digest)
                    .cloned()
                    .ok_or_else(|| StoreError::MissingStub {
                        id: doc.id.clone(),
                        name: name.clone(),
                    })?,
            };
            resolved.insert(name, stored);
        }
        doc.attachments = resolved;
    }

    let generation = current
        .and_then(|c| c.rev.as_deref())
        .and_then(|rev| rev.split('-').next())
        .and_then(|g| g.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let previous = current.and_then(|c| c.rev.clone());
    doc.rev = Some(format!("{generation}-{}", revision_hash(&doc, previous.as_deref())));

    Ok(doc)
}

fn revision_hash(doc: &Document, previous: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc.id.as_bytes());
    hasher.update(previous.unwrap_or("").as_bytes());
    hasher.update([u8::from(doc.deleted)]);
    hasher.update(serde_json::Value::Object(doc.fields.clone()).to_string().as_bytes());
    for (name, attachment) in &doc.attachments {
        hasher.update(name.as_bytes());
        hasher.update(attachment.digest.as_bytes());
    }
    let mut hex = to_hex(&hasher.finalize());
    hex.truncate(32);
    hex
}

fn digest_of(data: &[u8]) -> String {
    format!("sha256-{}", to_hex(&Sha256::digest(data)))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn shaped(doc: &Document, attachments: bool) -> Document {
    if attachments {
        doc.clone()
    } else {
        doc.with_stubs()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn all_docs(&self, options: &AllDocsOptions) -> StoreResult<Vec<Document>> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state
            .docs
            .values()
            .filter(|doc| !doc.deleted && options.contains(&doc.id))
            .map(|doc| shaped(doc, options.attachments))
            .collect())
    }

    async fn get(&self, id: &str, attachments: bool) -> StoreResult<Document> {
        self.check_open()?;
        let state = self.state.read();
        Self::live(&state, id).map(|doc| shaped(doc, attachments))
    }

    async fn put(&self, doc: Document) -> StoreResult<PutResponse> {
        self.check_open()?;
        let mut state = self.state.write();
        let prepared = prepare(state.docs.get(&doc.id), doc)?;
        let mut responses = self.commit(&mut state, vec![prepared]);
        responses
            .pop()
            .ok_or_else(|| StoreError::invalid("empty commit"))
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> StoreResult<Vec<PutResponse>> {
        self.check_open()?;
        let mut state = self.state.write();

        // Stage everything first; nothing is committed unless all succeed.
        let mut seen = HashSet::with_capacity(docs.len());
        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs {
            if !seen.insert(doc.id.clone()) {
                return Err(StoreError::invalid(format!("duplicate id {} in batch", doc.id)));
            }
            prepared.push(prepare(state.docs.get(&doc.id), doc)?);
        }
        Ok(self.commit(&mut state, prepared))
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: &str,
        data: Bytes,
        content_type: &str,
    ) -> StoreResult<PutResponse> {
        self.check_open()?;
        if name.is_empty() {
            return Err(StoreError::invalid("attachment name must not be empty"));
        }

        let mut state = self.state.write();
        let mut doc = Self::live(&state, id)?.clone();
        if doc.rev.as_deref() != Some(rev) {
            return Err(StoreError::conflict(id));
        }
        doc.attachments
            .insert(name.to_string(), Attachment::local(data, content_type));

        let prepared = prepare(state.docs.get(id), doc)?;
        let mut responses = self.commit(&mut state, vec![prepared]);
        responses
            .pop()
            .ok_or_else(|| StoreError::invalid("empty commit"))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Bytes> {
        self.check_open()?;
        let state = self.state.read();
        Self::live(&state, id)?
            .attachments
            .get(name)
            .and_then(|attachment| attachment.data.clone())
            .ok_or_else(|| StoreError::not_found(format!("{id}/{name}")))
    }

    async fn find(&self, selector: &Selector) -> StoreResult<Vec<Document>> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state
            .docs
            .values()
            .filter(|doc| !doc.deleted && selector.matches(doc))
            .map(Document::with_stubs)
            .collect())
    }

    fn changes(&self, options: ChangesOptions) -> StoreResult<ChangeStream> {
        self.check_open()?;
        Ok(self.feed.subscribe(options))
    }
}
