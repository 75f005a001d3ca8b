//! Tag sets attached to traffic by processors.
//!
//! A tag is a lower-cased key with zero or more lower-cased values. Values
//! under one key are de-duplicated and keep first-insertion order. Tags can only be
//! added; nothing in this module removes a key or value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// A multimap of tag keys to ordered, de-duplicated values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, Vec<String>>);

impl Tags {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `values` under `key`.
    ///
    /// Key and values are lower-cased. Values already present under the key are
    /// skipped. An empty key or an empty value is refused and nothing is added.
    pub fn add<I, S>(&mut self, key: &str, values: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = normalise_key(key)?;
        let values: Vec<String> = values
            .into_iter()
            .map(|v| v.into().trim().to_lowercase())
            .collect();
        if values.iter().any(String::is_empty) {
            return Err(PipelineError::InvalidTag {
                message: format!("tag '{key}' has an empty value"),
            });
        }

        let entry = self.0.entry(key).or_default();
        for value in values {
            if !entry.contains(&value) {
                entry.push(value);
            }
        }
        Ok(())
    }

    /// Adds a key with no values, used as a boolean flag.
    pub fn insert(&mut self, key: &str) -> Result<(), PipelineError> {
        self.add(key, std::iter::empty::<String>())
    }

    /// Merges `other` into `self` as a union.
    ///
    /// For keys present on both sides, `self`'s values come first followed by
    /// any new values from `other`.
    pub fn merge(&mut self, other: &Tags) {
        for (key, values) in &other.0 {
            let entry = self.0.entry(key.clone()).or_default();
            for value in values {
                if !entry.contains(value) {
                    entry.push(value.clone());
                }
            }
        }
    }

    /// Returns the values recorded under `key`, if the key is present.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(&key.to_lowercase()).map(Vec::as_slice)
    }

    /// Returns `true` when `key` is present, with or without values.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    /// Iterates keys in sorted order with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn normalise_key(key: &str) -> Result<String, PipelineError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(PipelineError::InvalidTag {
            message: "tag key must not be empty".to_string(),
        });
    }
    Ok(key.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_lowercased_and_values_deduplicated() {
        let mut tags = Tags::new();
        tags.add("Topics", ["billing", "refunds"]).unwrap();
        tags.add("TOPICS", ["Refunds", "shipping"]).unwrap();

        assert_eq!(
            tags.get("topics").unwrap(),
            ["billing", "refunds", "shipping"]
        );
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn empty_key_or_value_is_refused_without_partial_insert() {
        let mut tags = Tags::new();
        assert!(tags.add("", ["x"]).is_err());
        assert!(tags.add("k", ["ok", " "]).is_err());
        assert!(tags.is_empty());
    }

    #[test]
    fn flag_keys_have_no_values() {
        let mut tags = Tags::new();
        tags.insert("rounded").unwrap();
        assert!(tags.contains_key("rounded"));
        assert!(tags.get("rounded").unwrap().is_empty());
    }

    #[test]
    fn merge_order_matters_only_for_overlapping_keys() {
        let mut a = Tags::new();
        a.add("topic", ["a"]).unwrap();
        let mut b = Tags::new();
        b.add("topic", ["b"]).unwrap();

        let mut ab = Tags::new();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = Tags::new();
        ba.merge(&b);
        ba.merge(&a);
        assert_eq!(ab.get("topic").unwrap(), ["a", "b"]);
        assert_eq!(ba.get("topic").unwrap(), ["b", "a"]);

        let mut c = Tags::new();
        c.add("lang", ["en"]).unwrap();
        let mut ac = Tags::new();
        ac.merge(&a);
        ac.merge(&c);
        let mut ca = Tags::new();
        ca.merge(&c);
        ca.merge(&a);
        assert_eq!(ac, ca);
    }
}
