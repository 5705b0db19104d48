//! Property-based test generators using proptest.

use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for primary key values.
pub fn primary_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for free-text titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z ]{1,24}").expect("Invalid regex")
}

/// Strategy for valid partial `todo` data, with or without a key.
pub fn todo_data_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(primary_key_strategy()),
        title_strategy(),
        0i64..=99,
    )
        .prop_map(|(id, title, counter)| {
            let mut data = json!({ "title": title, "counter": counter });
            if let Some(id) = id {
                data["id"] = Value::String(id);
            }
            data
        })
}

/// Strategy for attachment payloads: name, body and content type.
pub fn attachment_strategy() -> impl Strategy<Value = (String, Vec<u8>, String)> {
    (
        prop::string::string_regex("[a-z]{1,12}(\\.[a-z]{2,4})?").expect("Invalid regex"),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::sample::select(vec!["text/plain", "image/png", "application/octet-stream"]),
    )
        .prop_map(|(name, body, content_type)| (name, body, content_type.to_string()))
}
