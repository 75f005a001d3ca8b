//! Free-form metadata attached to traffic.
//!
//! Metadata keys are write-once: the strict merge refuses any key that is
//! already present, even when both sides hold the same value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PipelineError;

/// Key/value metadata with JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a single key, failing if it is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), PipelineError> {
        let key = key.into();
        if self.0.contains_key(&key) {
            return Err(PipelineError::MetadataCollision { key });
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Merges every entry of `other` into `self`.
    ///
    /// All keys are checked before anything is written, so on error `self` is
    /// unchanged. The error names the first colliding key in sorted order.
    pub fn merge_strict(&mut self, other: &Metadata) -> Result<(), PipelineError> {
        if let Some(key) = self.first_collision(other) {
            return Err(PipelineError::MetadataCollision {
                key: key.to_string(),
            });
        }
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Returns the first key of `other` that is already present in `self`.
    pub fn first_collision<'a>(&self, other: &'a Metadata) -> Option<&'a str> {
        other
            .0
            .keys()
            .find(|k| self.0.contains_key(*k))
            .map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the metadata and returns the underlying JSON object.
    pub fn into_json(self) -> serde_json::Map<String, Value> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
