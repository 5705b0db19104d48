//! Pass-through document selectors for `find`.
//!
//! Selectors are evaluated document by document. There is no planner and no
//! index use.

use crate::document::Document;
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Matches every document.
    All,
    /// Field equals the value.
    Eq(String, Value),
    /// Field is absent or differs from the value.
    Ne(String, Value),
    /// Field is greater than the value.
    Gt(String, Value),
    /// Field is greater than or equal to the value.
    Gte(String, Value),
    /// Field is less than the value.
    Lt(String, Value),
    /// Field is less than or equal to the value.
    Lte(String, Value),
    /// Field presence (`true`) or absence (`false`).
    Exists(String, bool),
    /// Every inner selector matches.
    And(Vec<Selector>),
    /// At least one inner selector matches.
    Or(Vec<Selector>),
}

/// Starts a fluent selector on a dotted field path.
///
/// ```rust
/// use docmirror_store::selector::field;
///
/// let selector = field("counter").gt(3).and(field("done").eq(false));
/// ```
pub fn field(path: &str) -> FieldSelector {
    FieldSelector {
        path: path.to_string(),
    }
}

/// Fluent builder returned by [`field`].
pub struct FieldSelector {
    path: String,
}

impl FieldSelector {
    /// Field equals `value`.
    pub fn eq(self, value: impl Into<Value>) -> Selector {
        Selector::Eq(self.path, value.into())
    }

    /// Field differs from `value`.
    pub fn ne(self, value: impl Into<Value>) -> Selector {
        Selector::Ne(self.path, value.into())
    }

    /// Field is greater than `value`.
    pub fn gt(self, value: impl Into<Value>) -> Selector {
        Selector::Gt(self.path, value.into())
    }

    /// Field is greater than or equal to `value`.
    pub fn gte(self, value: impl Into<Value>) -> Selector {
        Selector::Gte(self.path, value.into())
    }

    /// Field is less than `value`.
    pub fn lt(self, value: impl Into<Value>) -> Selector {
        Selector::Lt(self.path, value.into())
    }

    /// Field is less than or equal to `value`.
    pub fn lte(self, value: impl Into<Value>) -> Selector {
        Selector::Lte(self.path, value.into())
    }

    /// Field is present.
    pub fn exists(self) -> Selector {
        Selector::Exists(self.path, true)
    }

    /// Field is absent.
    pub fn missing(self) -> Selector {
        Selector::Exists(self.path, false)
    }
}

impl Selector {
    /// Conjunction of `self` and `other`, flattening nested `And`s.
    #[must_use]
    pub fn and(self, other: Selector) -> Selector {
        match (self, other) {
            (Selector::All, other) => other,
            (this, Selector::All) => this,
            (Selector::And(mut left), Selector::And(right)) => {
                left.extend(right);
                Selector::And(left)
            }
            (Selector::And(mut left), other) => {
                left.push(other);
                Selector::And(left)
            }
            (this, other) => Selector::And(vec![this, other]),
        }
    }

    /// Disjunction of `self` and `other`.
    #[must_use]
    pub fn or(self, other: Selector) -> Selector {
        match (self, other) {
            (Selector::Or(mut left), other) => {
                left.push(other);
                Selector::Or(left)
            }
            (this, other) => Selector::Or(vec![this, other]),
        }
    }

    /// Evaluates the selector against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::All => true,
            Selector::Eq(path, value) => doc.get_path(path).as_ref() == Some(value),
            Selector::Ne(path, value) => doc.get_path(path).as_ref() != Some(value),
            Selector::Gt(path, value) => compare(doc, path, value) == Some(Ordering::Greater),
            Selector::Gte(path, value) => matches!(
                compare(doc, path, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Selector::Lt(path, value) => compare(doc, path, value) == Some(Ordering::Less),
            Selector::Lte(path, value) => matches!(
                compare(doc, path, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Selector::Exists(path, present) => doc.get_path(path).is_some() == *present,
            Selector::And(inner) => inner.iter().all(|s| s.matches(doc)),
            Selector::Or(inner) => inner.iter().any(|s| s.matches(doc)),
        }
    }
}

/// Orders numbers numerically and strings lexicographically; anything else
/// is incomparable.
fn compare(doc: &Document, path: &str, value: &Value) -> Option<Ordering> {
    let actual = doc.get_path(path)?;
    match (&actual, value) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
