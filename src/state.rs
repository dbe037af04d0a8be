//! Keyed state storage for stateful user functions.
//!
//! State is addressed by `(operator id, encoded key, namespace, tag)` rather
//! than by the user's key object, so a runner never holds a bare map keyed by
//! user values and the backing store can be swapped (in-memory, embedded
//! database, remote) without touching the runner.
//!
//! **Contract for backends:**
//! - `put` replaces the value stored at the address (last writer wins).
//! - `get` of an address never written, or removed, returns `None`.
//! - `apply` writes a whole batch or nothing: on error no write of the batch
//!   is visible.
//! - `snapshot`/`restore` round-trip the full contents; `restore` overwrites
//!   whatever the store held before.
//!
//! Runners stage writes for the duration of a bundle and hand them to
//! `apply` as one batch when the bundle commits, so a backend never sees a
//! partial bundle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

use crate::codec::StructuralKey;
use crate::window::Window;

/// Error type for state backend operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Storage or I/O error.
    #[error("storage error: {0}")]
    Storage(String),
    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("state lock poisoned")]
    LockPoisoned,
}

/// Identifier of the operator instance that owns a piece of state.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(String);

impl OperatorId {
    /// Creates an operator id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope within a key: global to the key, or one window of it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateNamespace {
    /// Not window-scoped.
    Global,
    /// Scoped to one window.
    Window(Window),
}

impl fmt::Display for StateNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateNamespace::Global => write!(f, "global"),
            StateNamespace::Window(w) => write!(f, "window:{}", w),
        }
    }
}

/// Full address of one state cell.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateAddress {
    /// Owning operator.
    pub operator: OperatorId,
    /// Encoded key bytes.
    pub key: Vec<u8>,
    /// Namespace within the key.
    pub namespace: StateNamespace,
    /// User-chosen state tag.
    pub tag: String,
}

impl StateAddress {
    /// Builds an address for a structural key.
    pub fn new(
        operator: OperatorId,
        key: &StructuralKey,
        namespace: StateNamespace,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            operator,
            key: key.encoded().to_vec(),
            namespace,
            tag: tag.into(),
        }
    }
}

/// Pluggable backend for keyed state.
pub trait KeyedStateStore: Send + Sync {
    /// Reads the value at an address.
    fn get(&self, address: &StateAddress) -> Result<Option<Vec<u8>>, StateError>;

    /// Writes the value at an address, replacing any previous value.
    fn put(&self, address: StateAddress, value: Vec<u8>) -> Result<(), StateError>;

    /// Removes the value at an address. Removing an absent address is a no-op.
    fn remove(&self, address: &StateAddress) -> Result<(), StateError>;

    /// Applies a batch of writes atomically. `Some` replaces the value at the
    /// address, `None` removes it.
    fn apply(&self, writes: Vec<(StateAddress, Option<Vec<u8>>)>) -> Result<(), StateError>;

    /// Snapshots the store for checkpointing.
    fn snapshot(&self) -> Result<Vec<u8>, StateError>;

    /// Restores the store from a snapshot. Overwrites current contents.
    fn restore(&self, data: &[u8]) -> Result<(), StateError>;
}

/// In-memory state store. Snapshots are JSON.
#[derive(Debug, Default)]
pub struct InMemoryKeyedStateStore {
    cells: RwLock<HashMap<StateAddress, Vec<u8>>>,
}

impl InMemoryKeyedStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cells.
    pub fn len(&self) -> Result<usize, StateError> {
        Ok(self.cells.read().map_err(|_| StateError::LockPoisoned)?.len())
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> Result<bool, StateError> {
        Ok(self.len()? == 0)
    }
}

impl KeyedStateStore for InMemoryKeyedStateStore {
    fn get(&self, address: &StateAddress) -> Result<Option<Vec<u8>>, StateError> {
        let cells = self.cells.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(cells.get(address).cloned())
    }

    fn put(&self, address: StateAddress, value: Vec<u8>) -> Result<(), StateError> {
        let mut cells = self.cells.write().map_err(|_| StateError::LockPoisoned)?;
        cells.insert(address, value);
        Ok(())
    }

    fn remove(&self, address: &StateAddress) -> Result<(), StateError> {
        let mut cells = self.cells.write().map_err(|_| StateError::LockPoisoned)?;
        cells.remove(address);
        Ok(())
    }

    fn apply(&self, writes: Vec<(StateAddress, Option<Vec<u8>>)>) -> Result<(), StateError> {
        let mut cells = self.cells.write().map_err(|_| StateError::LockPoisoned)?;
        for (address, value) in writes {
            match value {
                Some(bytes) => {
                    cells.insert(address, bytes);
                }
                None => {
                    cells.remove(&address);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, StateError> {
        let cells = self.cells.read().map_err(|_| StateError::LockPoisoned)?;
        let mut entries: Vec<(&StateAddress, &Vec<u8>)> = cells.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        serde_json::to_vec(&entries).map_err(|e| StateError::Serialization(e.to_string()))
    }

    fn restore(&self, data: &[u8]) -> Result<(), StateError> {
        let entries: Vec<(StateAddress, Vec<u8>)> =
            serde_json::from_slice(data).map_err(|e| StateError::Serialization(e.to_string()))?;
        let mut cells = self.cells.write().map_err(|_| StateError::LockPoisoned)?;
        *cells = entries.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(key: &str, tag: &str) -> StateAddress {
        StateAddress::new(
            OperatorId::new("op"),
            &StructuralKey::from_encoded(key.as_bytes().to_vec()),
            StateNamespace::Window(Window::interval(0, 10)),
            tag,
        )
    }

    #[test]
    fn put_get_remove() {
        let store = InMemoryKeyedStateStore::new();
        let a = address("k1", "count");
        assert_eq!(store.get(&a).unwrap(), None);
        store.put(a.clone(), b"1".to_vec()).unwrap();
        store.put(a.clone(), b"2".to_vec()).unwrap();
        assert_eq!(store.get(&a).unwrap(), Some(b"2".to_vec()));
        store.remove(&a).unwrap();
        assert_eq!(store.get(&a).unwrap(), None);
        store.remove(&a).unwrap();
    }

    #[test]
    fn apply_writes_and_removes_in_one_batch() {
        let store = InMemoryKeyedStateStore::new();
        store.put(address("k1", "stale"), b"0".to_vec()).unwrap();
        store
            .apply(vec![
                (address("k1", "a"), Some(b"1".to_vec())),
                (address("k1", "b"), Some(b"2".to_vec())),
                (address("k1", "stale"), None),
            ])
            .unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.get(&address("k1", "b")).unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(&address("k1", "stale")).unwrap(), None);
    }

    #[test]
    fn addresses_are_isolated() {
        let store = InMemoryKeyedStateStore::new();
        store.put(address("k1", "count"), b"1".to_vec()).unwrap();
        assert_eq!(store.get(&address("k2", "count")).unwrap(), None);
        assert_eq!(store.get(&address("k1", "sum")).unwrap(), None);

        let mut other_op = address("k1", "count");
        other_op.operator = OperatorId::new("other");
        assert_eq!(store.get(&other_op).unwrap(), None);
    }

    #[test]
    fn snapshot_restore_overwrites() {
        let store = InMemoryKeyedStateStore::new();
        store.put(address("k1", "count"), b"1".to_vec()).unwrap();
        store.put(address("k2", "count"), b"5".to_vec()).unwrap();
        let snapshot = store.snapshot().unwrap();

        let restored = InMemoryKeyedStateStore::new();
        restored.put(address("stale", "x"), b"0".to_vec()).unwrap();
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored.len().unwrap(), 2);
        assert_eq!(restored.get(&address("k2", "count")).unwrap(), Some(b"5".to_vec()));
        assert_eq!(restored.get(&address("stale", "x")).unwrap(), None);
    }

    #[test]
    fn restore_rejects_garbage() {
        let store = InMemoryKeyedStateStore::new();
        assert!(matches!(
            store.restore(b"{nope"),
            Err(StateError::Serialization(_))
        ));
        assert!(store.is_empty().unwrap());
    }
}
