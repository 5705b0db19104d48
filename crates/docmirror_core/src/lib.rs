//! # docmirror core
//!
//! A live, schema-validated mirror of an eventually-consistent document store.
//!
//! This crate provides:
//! - [`Schema`] compilation with primary key, type discriminant, defaults and indexes
//! - [`Collection`], an identity-mapped cache kept current by the store's change feed
//! - [`Item`], a handle to one document with dirty tracking, attachments and a
//!   watchable version counter
//! - [`Database`], which owns the store handle and a registry of collections
//! - A before-remove hook that can veto removals or add documents to the batch

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod database;
mod error;
mod hook;
mod item;
mod schema;

pub use collection::{Collection, ItemRef, KEY_SEPARATOR};
pub use config::CollectionOptions;
pub use database::Database;
pub use error::{BoxError, FieldViolation, MirrorError, MirrorResult, SchemaError, ValidationError};
pub use hook::{hook_fn, BeforeRemove, HookFn, RemoveDecision};
pub use item::Item;
pub use schema::{Schema, TYPE_FIELD};

pub use docmirror_store::{field, Attachment, Attachments, Document, DocumentStore, InMemoryStore, Selector};
