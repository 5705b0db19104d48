//! # docmirror store
//!
//! Document store contract and an in-memory implementation for docmirror.
//!
//! This crate describes the external, eventually-consistent store that
//! docmirror collections mirror. Stores hold JSON documents keyed by a
//! composite id, issue a revision on every write, carry named binary
//! attachments and publish committed writes on a change feed.
//!
//! ## Design Principles
//!
//! - Stores are shared as `Arc<dyn DocumentStore>` (`Send + Sync`)
//! - Writes are optimistic: a stale revision is a `Conflict`, never a merge
//! - Change events leave in commit order, after commit
//! - Attachments come back as stubs unless bodies are requested
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral storage
//!
//! ## Example
//!
//! ```rust
//! use docmirror_store::{AllDocsOptions, Document, DocumentStore, InMemoryStore};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = InMemoryStore::new();
//! store.put(Document::new("todo::1")).await.unwrap();
//!
//! let todos = store.all_docs(&AllDocsOptions::prefix("todo::")).await.unwrap();
//! assert_eq!(todos.len(), 1);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod changes;
mod document;
mod error;
mod memory;
pub mod selector;

pub use backend::{AllDocsOptions, DocumentStore, PutResponse};
pub use changes::{
    ChangeEvent, ChangeFeed, ChangeFilter, ChangeStream, ChangesOptions, Since, DEFAULT_MAX_HISTORY,
};
pub use document::{Attachment, Attachments, Document};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use selector::{field, Selector};
