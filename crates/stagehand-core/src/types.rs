use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arbitrary key/value payload attached to triggers, tasks, and reports
///
/// Wraps a JSON object so user-supplied keys stay opaque to the engine.
/// In memory the payload is fully structured; at the persistence boundary it
/// is flattened to a single encoded string so property names never collide
/// with the store's own field names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap {
    value: Map<String, Value>,
}

impl PropertyMap {
    /// Create an empty property map
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a property map from an existing JSON object
    pub fn from_map(value: Map<String, Value>) -> Self {
        Self { value }
    }

    /// Insert a property, replacing any previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.value.insert(key.into(), value);
    }

    /// Get a property value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    /// Check whether the map holds no properties
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Number of properties in the map
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Merge another map into this one; keys from `other` win on collision
    pub fn merge(&mut self, other: &PropertyMap) {
        for (key, value) in &other.value {
            self.value.insert(key.clone(), value.clone());
        }
    }

    /// Borrow the underlying JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.value
    }

    /// Take ownership of the underlying JSON object
    pub fn into_map(self) -> Map<String, Value> {
        self.value
    }

    /// Encode the map to its persisted string form
    ///
    /// An empty map encodes to the empty string, matching the stored
    /// representation of an absent payload.
    pub fn encode(&self) -> String {
        if self.value.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.value).unwrap_or_default()
    }

    /// Decode the persisted string form back into a map
    ///
    /// A malformed blob yields an empty map rather than an error, so one bad
    /// field never fails the whole record.
    pub fn decode(encoded: &str) -> Self {
        if encoded.is_empty() {
            return Self::new();
        }
        match serde_json::from_str::<Map<String, Value>>(encoded) {
            Ok(value) => Self { value },
            Err(_) => Self::new(),
        }
    }
}

impl From<Map<String, Value>> for PropertyMap {
    fn from(value: Map<String, Value>) -> Self {
        Self { value }
    }
}
