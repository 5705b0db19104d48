//! Collection configuration.

use crate::hook::BeforeRemove;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Configuration for creating a collection.
#[derive(Clone)]
pub struct CollectionOptions {
    /// JSON schema definition of the collection's documents.
    pub schema: Value,

    /// Whether reads and feed events carry attachment bodies instead of stubs.
    pub load_attachments: bool,

    /// Hook consulted before every removal.
    pub before_remove: Option<Arc<dyn BeforeRemove>>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            schema: Value::Null,
            load_attachments: false,
            before_remove: None,
        }
    }
}

impl CollectionOptions {
    /// Creates options for the given schema definition.
    #[must_use]
    pub fn new(schema: Value) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Sets whether attachment bodies are loaded eagerly.
    #[must_use]
    pub fn load_attachments(mut self, value: bool) -> Self {
        self.load_attachments = value;
        self
    }

    /// Installs the before-remove hook.
    #[must_use]
    pub fn before_remove(mut self, hook: impl BeforeRemove + 'static) -> Self {
        self.before_remove = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("schema", &self.schema.get("title"))
            .field("load_attachments", &self.load_attachments)
            .field("before_remove", &self.before_remove.is_some())
            .finish()
    }
}
