//! Decoded update messages.
//!
//! A delta arrives as a JSON object keyed by collection name. Two keys are
//! reserved and are separated from the data exactly once, here:
//!
//! - `deleted` inside a collection object: entity ids to remove from that
//!   collection;
//! - `invalidated` at any object level, including the top: keys to remove
//!   from the matching replica node before that level is merged.
//!
//! ```text
//! {"Athletes": {"deleted": ["7"], "12": {"Name": "…"}},   Delta
//!  "invalidated": ["Ranking"]}                            ├─ deletions: Athletes → [7]
//!                                                         └─ root: DeltaNode
//!                                                              ├─ invalidations: [Ranking]
//!                                                              └─ entries: Athletes → Node{12 → …}
//! ```
//!
//! Below the collection level `deleted` is ordinary data.

use serde_json::{Map, Value};

use crate::error::DecodeError;

pub const DELETED_KEY: &str = "deleted";
pub const INVALIDATED_KEY: &str = "invalidated";

/// Value of one delta entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaValue {
    /// Nested object, merged field by field
    Node(DeltaNode),
    /// Array, always replaces the destination wholesale
    Sequence(Vec<Value>),
    /// Anything else, assigned directly
    Scalar(Value),
}

impl DeltaValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Node(DeltaNode::from_map(map)),
            Value::Array(items) => Self::Sequence(items),
            other => Self::Scalar(other),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Node(node) => node.to_json(),
            Self::Sequence(items) => Value::Array(items.clone()),
            Self::Scalar(value) => value.clone(),
        }
    }
}

/// One object level of a delta.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaNode {
    invalidations: Vec<String>,
    entries: Vec<(String, DeltaValue)>,
}

impl DeltaNode {
    fn from_map(map: Map<String, Value>) -> Self {
        let mut node = Self::default();
        for (key, value) in map {
            if key == INVALIDATED_KEY {
                node.invalidations = key_list(value, INVALIDATED_KEY);
            } else {
                node.entries.push((key, DeltaValue::from_json(value)));
            }
        }
        node
    }

    /// Keys to purge from the destination before merging this level.
    pub fn invalidations(&self) -> &[String] {
        &self.invalidations
    }

    pub fn entries(&self) -> &[(String, DeltaValue)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&DeltaValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.invalidations.is_empty()
    }

    fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        if !self.invalidations.is_empty() {
            map.insert(INVALIDATED_KEY.to_string(), string_array(&self.invalidations));
        }
        Value::Object(map)
    }
}

/// A fully decoded update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta {
    deletions: Vec<(String, Vec<String>)>,
    root: DeltaNode,
    key_count: usize,
}

impl Delta {
    /// Parse a delta from JSON text.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        Self::from_json(serde_json::from_str(text)?)
    }

    /// Build a delta from an already parsed JSON value. Only objects are
    /// accepted at the top level.
    pub fn from_json(value: Value) -> Result<Self, DecodeError> {
        let map = match value {
            Value::Object(map) => map,
            other => return Err(DecodeError::NotAnObject(json_kind(&other))),
        };

        let key_count = map.len();
        let mut deletions = Vec::new();
        let mut root = DeltaNode::default();
        for (key, value) in map {
            if key == INVALIDATED_KEY {
                root.invalidations = key_list(value, INVALIDATED_KEY);
                continue;
            }
            let value = match value {
                Value::Object(mut collection) => {
                    if let Some(ids) = collection.remove(DELETED_KEY) {
                        deletions.push((key.clone(), key_list(ids, DELETED_KEY)));
                    }
                    DeltaValue::Node(DeltaNode::from_map(collection))
                }
                other => DeltaValue::from_json(other),
            };
            root.entries.push((key, value));
        }

        Ok(Self {
            deletions,
            root,
            key_count,
        })
    }

    /// A delta with no keys at all. Applying it is a no-op.
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Collection → entity ids to remove, applied before the merge pass.
    pub fn deletions(&self) -> &[(String, Vec<String>)] {
        &self.deletions
    }

    pub fn root(&self) -> &DeltaNode {
        &self.root
    }

    /// Names of the top-level collections this delta touches.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.root.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Wire form, with the reserved keys restored.
    pub fn to_json(&self) -> Value {
        let mut value = self.root.to_json();
        if let Value::Object(map) = &mut value {
            for (collection, ids) in &self.deletions {
                if let Some(Value::Object(target)) = map.get_mut(collection) {
                    target.insert(DELETED_KEY.to_string(), string_array(ids));
                }
            }
        }
        value
    }
}

/// Read a list of keys or ids. Numbers are normalised to their decimal form;
/// anything that is not a list is ignored.
fn key_list(value: Value, field: &str) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            log::warn!("`{field}` should be a list, got {}; ignoring", json_kind(&other));
            return Vec::new();
        }
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(key) => Some(key),
            Value::Number(key) => Some(key.to_string()),
            other => {
                log::debug!("skipping {} entry in `{field}`", json_kind(&other));
                None
            }
        })
        .collect()
}

fn string_array(keys: &[String]) -> Value {
    Value::Array(keys.iter().cloned().map(Value::String).collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
