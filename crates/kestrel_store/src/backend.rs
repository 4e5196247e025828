//! Persistence-backend seam.
//!
//! The store's durable state may be delegated to any ordered key-value
//! engine supporting atomic single-key and bounded-range operations, keyed
//! by the DN's hierarchical key bytes. The core issues get/put/delete/
//! range-scan calls and expects crash-durability from the implementation.
//!
//! Commit-stage failures are the only ones with ambiguous effect; the store
//! resolves them by re-querying the backend (`confirm_committed`), never by
//! blind retry.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use kestrel_common::error::StoreError;

/// Ordered key-value engine contract for durable entry state.
pub trait PersistenceBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All pairs with `start <= key < end`, in key order.
    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// After a failed put/delete, report whether the mutation actually took
    /// effect (`expected` is the value a successful put would have left, or
    /// `None` for a delete). Default: re-read and compare.
    fn confirm_committed(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let current = self.get(key)?;
        Ok(current.as_deref() == expected)
    }
}

/// Reference in-memory backend. Single mutex over a BTreeMap — correctness
/// baseline, not a performance target.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .data
            .lock()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
