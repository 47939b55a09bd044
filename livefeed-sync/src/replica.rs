//! The shared, in-memory replica of upstream state.
//!
//! The replica is a tree of [`Record`]s: collections at the top, entities
//! keyed by id below them. Every record is a shared handle, so a collaborator
//! that captured `replica.entity("Athletes", "12")` before a merge sees the
//! merged fields afterwards without looking the entity up again.
//!
//! ```text
//! Replica ─┬─ gate (RwLock)           whole-merge exclusion for `read()`
//!          ├─ last_update
//!          └─ root: Record ─┬─ "Athletes": Record ─┬─ "12": Record { Name, … }
//!                           │                      └─ "13": Record { … }
//!                           └─ "Event": Record { … }
//! ```
//!
//! Only the merge engine and the session reset mutate the tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde_json::{Map, Value};

/// A field value inside a record.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Scalar or array (never an object)
    Value(Value),
    /// Nested record, shared by identity
    Record(Record),
}

impl Slot {
    /// Convert a JSON value, turning objects into fresh records.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Record(Record::from_map(map)),
            other => Self::Value(other),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Record(record) => record.to_json(),
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            Self::Value(_) => None,
        }
    }
}

/// A mutable mapping node with stable identity.
///
/// Cloning a `Record` clones the handle, not the data.
#[derive(Clone, Default)]
pub struct Record {
    fields: Arc<RwLock<BTreeMap<String, Slot>>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_map(map: Map<String, Value>) -> Self {
        let fields = map
            .into_iter()
            .map(|(key, value)| (key, Slot::from_json(value)))
            .collect();
        Self {
            fields: Arc::new(RwLock::new(fields)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Slot> {
        self.fields.read().get(key).cloned()
    }

    /// Nested record under `key`, if that field holds one.
    pub fn record(&self, key: &str) -> Option<Record> {
        match self.fields.read().get(key) {
            Some(Slot::Record(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// JSON form of the field under `key`.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.fields.read().get(key).map(Slot::to_json)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.fields.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }

    /// Whether both handles point at the same node.
    pub fn ptr_eq(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }

    /// Deep JSON copy of this node.
    pub fn to_json(&self) -> Value {
        let fields = self.fields.read();
        Value::Object(
            fields
                .iter()
                .map(|(key, slot)| (key.clone(), slot.to_json()))
                .collect(),
        )
    }

    pub(crate) fn fields_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Slot>> {
        self.fields.write()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({})", self.to_json())
    }
}

#[derive(Default)]
struct ReplicaInner {
    root: Record,
    gate: RwLock<()>,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

/// Handle to the process-wide replica. Clones share the same tree.
#[derive(Clone, Default)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live top-level record. Not a snapshot.
    pub fn root(&self) -> Record {
        self.inner.root.clone()
    }

    pub fn collection(&self, name: &str) -> Option<Record> {
        self.inner.root.record(name)
    }

    pub fn entity(&self, collection: &str, id: &str) -> Option<Record> {
        self.collection(collection)?.record(id)
    }

    /// Run `f` while no merge is in progress.
    pub fn read<R>(&self, f: impl FnOnce(&Record) -> R) -> R {
        let _gate = self.inner.gate.read();
        f(&self.inner.root)
    }

    /// Consistent deep copy of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.read(Record::to_json)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.root.is_empty()
    }

    /// When the last non-empty delta was applied; `None` since the last reset.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_update.read()
    }

    /// Snapshot and stamp taken under the same gate.
    pub fn stamped_snapshot(&self) -> (Value, Option<DateTime<Utc>>) {
        self.read(|root| (root.to_json(), self.last_update()))
    }

    pub fn ptr_eq(&self, other: &Replica) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&Record) -> R) -> R {
        let _gate = self.inner.gate.write();
        f(&self.inner.root)
    }

    /// Remove every top-level key in place. Handles to the root stay valid.
    pub(crate) fn clear(&self) {
        self.write(|root| {
            root.fields_mut().clear();
            self.set_last_update(None);
        });
    }

    /// Record the merge time. Call from inside [`write`](Self::write) so
    /// gated readers see data and stamp change together.
    pub(crate) fn touch(&self, at: DateTime<Utc>) {
        self.set_last_update(Some(at));
    }

    fn set_last_update(&self, at: Option<DateTime<Utc>>) {
        *self.inner.last_update.write() = at;
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("collections", &self.inner.root.keys())
            .field("last_update", &self.last_update())
            .finish()
    }
}
