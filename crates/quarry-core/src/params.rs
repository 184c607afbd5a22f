//! Canonical request parameters.
//!
//! The canonical form is the input to fingerprinting, so it must serialize
//! deterministically: fields live in a `BTreeMap` (key-sorted JSON) and
//! values are already normalized by the time they are stored here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A normalized parameter value.
///
/// Variant order matters for untagged deserialization: integral JSON
/// numbers must resolve to `Int` before `Float` is tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

/// Canonical, order-independent form of a request's filter set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalParams(BTreeMap<String, CanonicalValue>);

impl CanonicalParams {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: CanonicalValue) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&CanonicalValue> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CanonicalValue)> {
        self.0.iter()
    }

    /// Deterministic JSON serialization (keys sorted by construction).
    pub fn to_canonical_json(&self) -> String {
        // BTreeMap of primitives cannot fail to serialize
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_is_key_sorted() {
        let mut a = CanonicalParams::new();
        a.insert("year", CanonicalValue::Int(2024));
        a.insert("county", CanonicalValue::Str("06037".into()));

        let mut b = CanonicalParams::new();
        b.insert("county", CanonicalValue::Str("06037".into()));
        b.insert("year", CanonicalValue::Int(2024));

        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
        assert!(a.to_canonical_json().starts_with("{\"county\""));
    }

    #[test]
    fn test_canonical_json_round_trip() {
        let mut p = CanonicalParams::new();
        p.insert("purposes", CanonicalValue::StrList(vec!["purchase".into(), "refi".into()]));
        p.insert("rate", CanonicalValue::Float(6.25));

        let json = p.to_canonical_json();
        let back: CanonicalParams = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn test_integral_numbers_deserialize_as_int() {
        let back: CanonicalParams = serde_json::from_str(r#"{"year":2024}"#).unwrap();
        assert_eq!(back.get("year"), Some(&CanonicalValue::Int(2024)));
    }
}
