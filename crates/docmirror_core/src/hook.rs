//! Pre-removal hook.

use crate::error::BoxError;
use crate::item::Item;
use async_trait::async_trait;
use docmirror_store::Document;
use std::future::Future;

/// What a before-remove hook decided.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RemoveDecision {
    /// Remove the item.
    #[default]
    Proceed,
    /// Keep the item; the removal fails with `Vetoed`.
    Veto,
    /// Remove the item and write these documents in the same batch.
    ///
    /// The documents are written as given, ahead of the tombstone.
    ProceedWith(Vec<Document>),
}

/// Runs before an item is removed and may veto it or add documents to the
/// removal batch.
#[async_trait]
pub trait BeforeRemove: Send + Sync {
    /// Decides the fate of `item`.
    async fn before_remove(&self, item: &Item) -> Result<RemoveDecision, BoxError>;
}

/// A [`BeforeRemove`] backed by an async closure.
pub struct HookFn<F>(F);

/// Wraps an async closure as a before-remove hook.
///
/// ```rust
/// use docmirror_core::{hook_fn, RemoveDecision};
///
/// let hook = hook_fn(|item| async move {
///     if item.get("locked").is_some() {
///         Ok(RemoveDecision::Veto)
///     } else {
///         Ok(RemoveDecision::Proceed)
///     }
/// });
/// # let _ = hook;
/// ```
pub fn hook_fn<F, Fut>(f: F) -> HookFn<F>
where
    F: Fn(Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RemoveDecision, BoxError>> + Send + 'static,
{
    HookFn(f)
}

#[async_trait]
impl<F, Fut> BeforeRemove for HookFn<F>
where
    F: Fn(Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RemoveDecision, BoxError>> + Send + 'static,
{
    async fn before_remove(&self, item: &Item) -> Result<RemoveDecision, BoxError> {
        (self.0)(item.clone()).await
    }
}
