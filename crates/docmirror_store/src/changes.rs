//! Change feed for observing committed document writes.
//!
//! The change feed emits one event per committed document write, enabling:
//! - Live collection caches
//! - Reactive UI updates
//! - Replicas of the same store
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut changes = store.changes(ChangesOptions::live())?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = changes.next().await {
//!         println!("change: {} deleted={}", event.id, event.deleted);
//!     }
//! });
//! ```

use crate::document::Document;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A single change event from the change feed.
///
/// Change events are emitted only after a write commits, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Sequence number of the commit.
    pub seq: u64,
    /// Id of the changed document.
    pub id: String,
    /// Whether the write was a tombstone.
    pub deleted: bool,
    /// The document as written, when the subscription asked for bodies.
    pub doc: Option<Document>,
}

/// Where a subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Since {
    /// Only changes committed after subscribing.
    #[default]
    Now,
    /// Replays retained history with a sequence above the given one first.
    ///
    /// Replayed documents carry attachment stubs only; bodies are read back
    /// with `get_attachment`.
    Seq(u64),
}

/// Server-side predicate restricting which documents are delivered.
pub type ChangeFilter = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Options for a change subscription.
#[derive(Clone, Default)]
pub struct ChangesOptions {
    /// Starting point.
    pub since: Since,
    /// Deliver document bodies with each event.
    pub include_docs: bool,
    /// Deliver attachment bodies instead of stubs.
    pub attachments: bool,
    /// Optional predicate evaluated against the written document.
    pub filter: Option<ChangeFilter>,
}

impl ChangesOptions {
    /// Live subscription from now on, with document bodies.
    #[must_use]
    pub fn live() -> Self {
        Self {
            include_docs: true,
            ..Self::default()
        }
    }

    /// Sets the starting point.
    #[must_use]
    pub fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Sets whether attachment bodies are delivered.
    #[must_use]
    pub fn attachments(mut self, value: bool) -> Self {
        self.attachments = value;
        self
    }

    /// Sets the server-side filter.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for ChangesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesOptions")
            .field("since", &self.since)
            .field("include_docs", &self.include_docs)
            .field("attachments", &self.attachments)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// The receiving end of a change subscription.
///
/// Dropping or cancelling the stream unsubscribes it; the feed prunes it on
/// the next emit.
pub struct ChangeStream {
    rx: UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    /// Waits for the next event. Returns `None` once cancelled and drained.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery. Events already queued can still be drained.
    pub fn cancel(&mut self) {
        self.rx.close();
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream").finish_non_exhaustive()
    }
}

struct Subscriber {
    tx: UnboundedSender<ChangeEvent>,
    options: ChangesOptions,
}

impl Subscriber {
    /// Applies filter and shaping. `None` means the event is not for us.
    fn shape(&self, event: &ChangeEvent) -> Option<ChangeEvent> {
        if let Some(filter) = &self.options.filter {
            match &event.doc {
                Some(doc) if filter(doc) => {}
                _ => return None,
            }
        }

        let doc = if self.options.include_docs {
            event.doc.as_ref().map(|doc| {
                if self.options.attachments {
                    doc.clone()
                } else {
                    doc.with_stubs()
                }
            })
        } else {
            None
        };

        Some(ChangeEvent {
            seq: event.seq,
            id: event.id.clone(),
            deleted: event.deleted,
            doc,
        })
    }
}

/// History retained by [`ChangeFeed::new`].
pub const DEFAULT_MAX_HISTORY: usize = 1_000;

/// A change feed that distributes committed writes to subscribers.
///
/// The change feed:
/// - Emits only committed writes
/// - Preserves commit order
/// - Supports multiple subscribers, each with its own filter
/// - Is thread-safe
pub struct ChangeFeed {
    /// Live subscribers.
    subscribers: RwLock<Vec<Subscriber>>,
    /// Recent events, attachments stubbed, for `Since::Seq` replay.
    history: RwLock<Vec<ChangeEvent>>,
    /// Maximum history size.
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates a change feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to the change feed.
    pub fn subscribe(&self, options: ChangesOptions) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { tx, options };

        // Lock order subscribers -> history, same as emit, so a replayed
        // event is never delivered twice.
        let mut subscribers = self.subscribers.write();
        if let Since::Seq(cursor) = subscriber.options.since {
            let history = self.history.read();
            for event in history.iter().filter(|e| e.seq > cursor) {
                if let Some(shaped) = subscriber.shape(event) {
                    let _ = subscriber.tx.send(shaped);
                }
            }
        }
        subscribers.push(subscriber);

        ChangeStream { rx }
    }

    /// Emits a change event to all subscribers.
    ///
    /// This is called by the store after a write commits.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.write();

        {
            let mut history = self.history.write();
            history.push(ChangeEvent {
                doc: event.doc.as_ref().map(Document::with_stubs),
                ..event.clone()
            });
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        // Send to subscribers (remove closed ones)
        subscribers.retain(|subscriber| match subscriber.shape(&event) {
            Some(shaped) => subscriber.tx.send(shaped).is_ok(),
            None => !subscriber.tx.is_closed(),
        });
    }

    /// Emits multiple events from a single commit.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Returns the latest sequence number in history.
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.seq).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscribers.read().len())
            .field("history", &self.history.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Attachment;
    use serde_json::json;

    fn event(seq: u64, kind: &str) -> ChangeEvent {
        let mut doc = Document::with_fields(
            format!("{kind}::{seq}"),
            json!({ "type": kind }).as_object().cloned().unwrap(),
        );
        doc.rev = Some(format!("1-{seq}"));
        doc.attachments
            .insert("a".into(), Attachment::local(vec![1u8, 2, 3], "x/y"));
        ChangeEvent {
            seq,
            id: doc.id.clone(),
            deleted: false,
            doc: Some(doc),
        }
    }

    #[test]
    fn subscribe_receives_future_events_only() {
        let feed = ChangeFeed::new();
        feed.emit(event(1, "todo"));

        let mut stream = feed.subscribe(ChangesOptions::live());
        feed.emit(event(2, "todo"));

        let received = stream.try_next().unwrap();
        assert_eq!(received.seq, 2);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn filter_is_applied_server_side() {
        let feed = ChangeFeed::new();
        let mut stream = feed.subscribe(
            ChangesOptions::live().filter(|doc| doc.field("type") == Some(&json!("todo"))),
        );

        feed.emit(event(1, "user"));
        feed.emit(event(2, "todo"));

        assert_eq!(stream.try_next().unwrap().seq, 2);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn attachments_are_stubbed_unless_requested() {
        let feed = ChangeFeed::new();
        let mut stubs = feed.subscribe(ChangesOptions::live());
        let mut bodies = feed.subscribe(ChangesOptions::live().attachments(true));
        let mut bare = feed.subscribe(ChangesOptions::default());

        feed.emit(event(1, "todo"));

        let stubbed = stubs.try_next().unwrap().doc.unwrap();
        assert!(stubbed.attachments["a"].stub);
        let full = bodies.try_next().unwrap().doc.unwrap();
        assert!(full.attachments["a"].is_local());
        assert!(bare.try_next().unwrap().doc.is_none());
    }

    #[test]
    fn cancelled_subscribers_are_pruned() {
        let feed = ChangeFeed::new();
        let mut stream = feed.subscribe(ChangesOptions::live());
        assert_eq!(feed.subscriber_count(), 1);

        stream.cancel();
        feed.emit(event(1, "todo"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn since_seq_replays_history() {
        let feed = ChangeFeed::new();
        feed.emit_batch(vec![event(1, "todo"), event(2, "todo"), event(3, "todo")]);

        let mut stream = feed.subscribe(ChangesOptions::live().since(Since::Seq(1)));
        assert_eq!(stream.try_next().unwrap().seq, 2);
        assert_eq!(stream.try_next().unwrap().seq, 3);
        assert!(stream.try_next().is_none());
        assert_eq!(feed.latest_sequence(), 3);
    }

    #[test]
    fn history_keeps_stubs_only() {
        let feed = ChangeFeed::new();
        let mut live = feed.subscribe(ChangesOptions::live().attachments(true));
        feed.emit(event(1, "todo"));
        assert!(live.try_next().unwrap().doc.unwrap().attachments["a"].is_local());

        let mut replay = feed.subscribe(ChangesOptions::live().attachments(true).since(Since::Seq(0)));
        let replayed = replay.try_next().unwrap().doc.unwrap();
        assert!(replayed.attachments["a"].stub);
        assert!(replayed.attachments["a"].data.is_none());
        assert_eq!(replayed.attachments["a"].length, 3);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(2);
        feed.emit_batch((1..=5).map(|seq| event(seq, "todo")).collect());

        let mut stream = feed.subscribe(ChangesOptions::live().since(Since::Seq(0)));
        assert_eq!(stream.try_next().unwrap().seq, 4);
        assert_eq!(stream.try_next().unwrap().seq, 5);
    }
}
