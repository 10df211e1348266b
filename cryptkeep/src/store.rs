//! Persistent associative store abstraction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::ids::ObjectId;
use crate::txg::TxContext;

/// Pool-wide feature flags whose use is reference counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Datasets with a keychain exist in the pool
    Encryption,
}

impl Feature {
    /// Stable name of the feature.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Encryption => "encryption",
        }
    }
}

/// Stores objects that map `u64` keys to byte values.
///
/// Mutations take a [`TxContext`] and therefore only happen in syncing
/// context. Implementations must be thread-safe (`Send + Sync`).
pub trait ObjectStore: Send + Sync {
    /// Allocates a new, empty object.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the medium fails.
    fn create_object(&self, tx: &TxContext) -> Result<ObjectId, StoreError>;

    /// Frees an object and everything in it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchObject` if `obj` does not exist.
    fn destroy_object(&self, obj: ObjectId, tx: &TxContext) -> Result<(), StoreError>;

    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchObject` or `StoreError::NoSuchKey` if the
    /// value does not exist.
    fn get(&self, obj: ObjectId, key: u64) -> Result<Vec<u8>, StoreError>;

    /// Writes one value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchObject` if `obj` does not exist.
    fn put(&self, obj: ObjectId, key: u64, value: &[u8], tx: &TxContext) -> Result<(), StoreError>;

    /// Removes one value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchKey` if the value does not exist.
    fn delete(&self, obj: ObjectId, key: u64, tx: &TxContext) -> Result<(), StoreError>;

    /// Returns every `(key, value)` pair of `obj` in no particular order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchObject` if `obj` does not exist.
    fn iterate(&self, obj: ObjectId) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Takes a reference on `feature`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the medium fails.
    fn feature_incr(&self, feature: Feature, tx: &TxContext) -> Result<(), StoreError>;

    /// Drops a reference on `feature`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if the count is already zero.
    fn feature_decr(&self, feature: Feature, tx: &TxContext) -> Result<(), StoreError>;

    /// Current reference count of `feature`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the medium fails.
    fn feature_refcount(&self, feature: Feature) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemInner {
    next_obj: u64,
    objects: HashMap<ObjectId, HashMap<u64, Vec<u8>>>,
    features: HashMap<Feature, u64>,
}

/// In-memory [`ObjectStore`].
///
/// Iteration follows hash order. The number of `iterate` calls is counted so
/// callers can observe how often objects were scanned.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
    iterations: AtomicUsize,
}

impl MemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `iterate` calls served so far.
    #[must_use]
    pub fn iterate_calls(&self) -> usize {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

impl ObjectStore for MemStore {
    fn create_object(&self, _tx: &TxContext) -> Result<ObjectId, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_obj += 1;
        let obj = ObjectId(inner.next_obj);
        inner.objects.insert(obj, HashMap::new());
        Ok(obj)
    }

    fn destroy_object(&self, obj: ObjectId, _tx: &TxContext) -> Result<(), StoreError> {
        self.inner
            .lock()
            .objects
            .remove(&obj)
            .map(|_| ())
            .ok_or(StoreError::NoSuchObject(obj))
    }

    fn get(&self, obj: ObjectId, key: u64) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        let values = inner.objects.get(&obj).ok_or(StoreError::NoSuchObject(obj))?;
        values.get(&key).cloned().ok_or(StoreError::NoSuchKey { obj, key })
    }

    fn put(
        &self,
        obj: ObjectId,
        key: u64,
        value: &[u8],
        _tx: &TxContext,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let values = inner.objects.get_mut(&obj).ok_or(StoreError::NoSuchObject(obj))?;
        values.insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&self, obj: ObjectId, key: u64, _tx: &TxContext) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let values = inner.objects.get_mut(&obj).ok_or(StoreError::NoSuchObject(obj))?;
        values.remove(&key).map(|_| ()).ok_or(StoreError::NoSuchKey { obj, key })
    }

    fn iterate(&self, obj: ObjectId) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.iterations.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        let values = inner.objects.get(&obj).ok_or(StoreError::NoSuchObject(obj))?;
        Ok(values.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    fn feature_incr(&self, feature: Feature, _tx: &TxContext) -> Result<(), StoreError> {
        *self.inner.lock().features.entry(feature).or_insert(0) += 1;
        Ok(())
    }

    fn feature_decr(&self, feature: Feature, _tx: &TxContext) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let count = inner.features.entry(feature).or_insert(0);
        if *count == 0 {
            return Err(StoreError::Corrupt(format!(
                "feature {} refcount would go negative",
                feature.name()
            )));
        }
        *count -= 1;
        Ok(())
    }

    fn feature_refcount(&self, feature: Feature) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.features.get(&feature).copied().unwrap_or(0))
    }
}
