//! # docmirror testkit
//!
//! Test utilities for docmirror.
//!
//! This crate provides:
//! - Sample schemas and a ready in-memory database
//! - Tracing initialisation for test binaries
//! - An async polling helper for change-feed driven assertions
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docmirror_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn todos_load() {
//!     let db = TestDatabase::memory();
//!     let todos = db.todos();
//!     todos.subscribe().await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
