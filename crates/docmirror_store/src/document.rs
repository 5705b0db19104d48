//! Store-level document and attachment types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attachment map keyed by attachment name.
pub type Attachments = BTreeMap<String, Attachment>;

/// A named binary payload attached to a document.
///
/// An attachment is either *local* (the body is present in `data`) or a
/// *stub* (only metadata is known, the body stays in the store until it is
/// fetched with [`crate::DocumentStore::get_attachment`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type of the payload.
    pub content_type: String,
    /// Content fingerprint. Synthetic for local attachments that were never
    /// written, `sha256-{hex}` once the store has seen the body.
    pub digest: String,
    /// Payload size in bytes.
    #[serde(default)]
    pub length: u64,
    /// The payload, when it is held locally.
    #[serde(skip)]
    pub data: Option<Bytes>,
    /// Set when the body was not loaded.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stub: bool,
}

impl Attachment {
    /// Creates a local attachment with a freshly generated digest.
    pub fn local(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            content_type: content_type.into(),
            digest: Uuid::new_v4().to_string(),
            length: data.len() as u64,
            data: Some(data),
            stub: false,
        }
    }

    /// Returns true if the payload is present.
    pub fn is_local(&self) -> bool {
        self.data.is_some()
    }

    /// Returns a metadata-only copy of this attachment.
    #[must_use]
    pub fn to_stub(&self) -> Self {
        Self {
            content_type: self.content_type.clone(),
            digest: self.digest.clone(),
            length: self.length,
            data: None,
            stub: true,
        }
    }

    /// Returns a copy carrying `data` with the stub marker cleared.
    #[must_use]
    pub fn with_data(&self, data: Bytes) -> Self {
        Self {
            content_type: self.content_type.clone(),
            digest: self.digest.clone(),
            length: data.len() as u64,
            data: Some(data),
            stub: false,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A document as held by the store.
///
/// Serialises in the store's natural shape: `_id`, `_rev`, `_deleted` and
/// `_attachments` next to the user fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Composite key, `"{type}::{primary}"` for collection documents.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision token. `None` until the document has been written.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Attachments by name.
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: Attachments,
    /// User fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Creates an empty, never-written document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Creates a never-written document with the given fields.
    pub fn with_fields(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
            ..Self::default()
        }
    }

    /// Returns true if the document has never been written.
    pub fn is_new(&self) -> bool {
        self.rev.is_none()
    }

    /// Returns a top-level user field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Resolves a dotted path (`"author.name"`) against the document.
    ///
    /// `_id` and `_rev` resolve to the store metadata.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        match path {
            "_id" => return Some(Value::String(self.id.clone())),
            "_rev" => return self.rev.clone().map(Value::String),
            _ => {}
        }

        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Returns a copy in which every attachment is reduced to a stub.
    #[must_use]
    pub fn with_stubs(&self) -> Self {
        let mut doc = self.clone();
        for attachment in doc.attachments.values_mut() {
            *attachment = attachment.to_stub();
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialises_in_store_shape() {
        let mut doc = Document::new("todo::1");
        doc.rev = Some("1-abc".into());
        doc.fields.insert("title".into(), json!("milk"));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], "todo::1");
        assert_eq!(value["_rev"], "1-abc");
        assert_eq!(value["title"], "milk");
        assert!(value.get("_deleted").is_none());
        assert!(value.get("_attachments").is_none());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn attachments_deserialise_as_stubs() {
        let doc: Document = serde_json::from_value(json!({
            "_id": "todo::1",
            "_attachments": {
                "pic": { "content_type": "image/png", "digest": "sha256-00", "length": 4, "stub": true }
            }
        }))
        .unwrap();

        let pic = &doc.attachments["pic"];
        assert!(pic.stub);
        assert!(!pic.is_local());
        assert_eq!(pic.length, 4);
    }

    #[test]
    fn dotted_paths() {
        let doc = Document::with_fields(
            "recipe::1",
            json!({ "author": { "name": "Ann" }, "tags": ["a", "b"] })
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(doc.get_path("author.name"), Some(json!("Ann")));
        assert_eq!(doc.get_path("tags.1"), Some(json!("b")));
        assert_eq!(doc.get_path("author.age"), None);
        assert_eq!(doc.get_path("_id"), Some(json!("recipe::1")));
        assert_eq!(doc.get_path("_rev"), None);
    }

    #[test]
    fn local_attachment_and_stub() {
        let att = Attachment::local(Bytes::from_static(b"abcd"), "text/plain");
        assert!(att.is_local());
        assert_eq!(att.length, 4);
        assert!(!att.digest.is_empty());

        let stub = att.to_stub();
        assert!(stub.stub);
        assert!(stub.data.is_none());
        assert_eq!(stub.digest, att.digest);

        let loaded = stub.with_data(Bytes::from_static(b"abcd"));
        assert!(!loaded.stub);
        assert_eq!(loaded.length, 4);
    }
}
