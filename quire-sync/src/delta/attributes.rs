//! Formatting attributes carried by insert and retain operations.
//!
//! The engine never interprets attribute keys. A retain carrying
//! `AttrValue::Null` for a key removes that attribute from the retained
//! range; everything else is last-writer-wins per key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    /// Removes the attribute when composed onto content.
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

/// Attribute key/value map. Empty means "no attributes".
pub type AttributeMap = BTreeMap<String, AttrValue>;

/// Build an attribute map from `(key, value)` pairs.
pub fn attrs<K, V, I>(pairs: I) -> AttributeMap
where
    K: Into<String>,
    V: Into<AttrValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Apply `b` on top of `a`.
///
/// `keep_null` is true when composing two retains: the null markers must
/// survive so they still clear attributes once applied to content.
pub fn compose(a: &AttributeMap, b: &AttributeMap, keep_null: bool) -> AttributeMap {
    let mut out: AttributeMap = b
        .iter()
        .filter(|(_, v)| keep_null || !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in a {
        if !b.contains_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Transform `b` against a concurrently applied `a`.
///
/// With `priority`, `a` is considered to have happened first and keeps the
/// keys both sides touched.
pub fn transform(a: &AttributeMap, b: &AttributeMap, priority: bool) -> AttributeMap {
    if a.is_empty() || !priority {
        return b.clone();
    }
    b.iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Attributes that undo `attributes` when they were applied over `base`.
pub fn invert(attributes: &AttributeMap, base: &AttributeMap) -> AttributeMap {
    let mut out = AttributeMap::new();
    for (key, value) in base {
        if let Some(applied) = attributes.get(key) {
            if applied != value {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    for key in attributes.keys() {
        if !base.contains_key(key) {
            out.insert(key.clone(), AttrValue::Null);
        }
    }
    out
}
