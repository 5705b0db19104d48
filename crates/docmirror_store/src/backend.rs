//! Document store trait definition.

use crate::changes::{ChangeStream, ChangesOptions};
use crate::document::Document;
use crate::error::StoreResult;
use crate::selector::Selector;
use async_trait::async_trait;
use bytes::Bytes;

/// Options for a range read over document ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllDocsOptions {
    /// Inclusive lower bound. `None` starts at the first id.
    pub start_key: Option<String>,
    /// Inclusive upper bound. `None` runs to the last id.
    pub end_key: Option<String>,
    /// Only ids starting with this string.
    pub prefix: Option<String>,
    /// Return attachment bodies instead of stubs.
    pub attachments: bool,
}

impl AllDocsOptions {
    /// Range covering every id that starts with `prefix`.
    #[must_use]
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start_key: Some(prefix.to_string()),
            prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    /// Sets whether attachment bodies are returned.
    #[must_use]
    pub fn attachments(mut self, value: bool) -> Self {
        self.attachments = value;
        self
    }

    /// Returns true if `id` lies within the range.
    pub fn contains(&self, id: &str) -> bool {
        self.start_key.as_deref().map_or(true, |start| id >= start)
            && self.end_key.as_deref().map_or(true, |end| id <= end)
            && self.prefix.as_deref().map_or(true, |prefix| id.starts_with(prefix))
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    /// The written document id.
    pub id: String,
    /// The new revision.
    pub rev: String,
}

/// An eventually-consistent document store.
///
/// Stores hold [`Document`]s keyed by id, issue a new revision on every
/// write and publish committed writes on a change feed.
///
/// # Invariants
///
/// - `put` is optimistic: the supplied revision must equal the stored one,
///   and a document without revision must not collide with a live document
/// - `bulk_docs` applies every document or none
/// - Change events are published after commit, in commit order
/// - Stores must be `Send + Sync` so one handle can serve many collections
///
/// # Implementors
///
/// - [`crate::InMemoryStore`] - In-process store for tests and ephemeral use
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads every live document whose id lies in the range, ordered by id.
    async fn all_docs(&self, options: &AllDocsOptions) -> StoreResult<Vec<Document>>;

    /// Reads one live document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the id is unknown or deleted.
    async fn get(&self, id: &str, attachments: bool) -> StoreResult<Document>;

    /// Writes one document.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on a revision mismatch and `MissingStub` when a stub
    /// attachment has no stored body with the same digest.
    async fn put(&self, doc: Document) -> StoreResult<PutResponse>;

    /// Writes several documents atomically.
    ///
    /// An id may appear at most once per batch.
    async fn bulk_docs(&self, docs: Vec<Document>) -> StoreResult<Vec<PutResponse>>;

    /// Adds or replaces one attachment against the given revision.
    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: &str,
        data: Bytes,
        content_type: &str,
    ) -> StoreResult<PutResponse>;

    /// Fetches one attachment body.
    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Bytes>;

    /// Returns every live document matching the selector.
    async fn find(&self, selector: &Selector) -> StoreResult<Vec<Document>>;

    /// Opens a change subscription.
    fn changes(&self, options: ChangesOptions) -> StoreResult<ChangeStream>;
}
