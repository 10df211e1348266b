use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::ids::ObjectId;
use crate::keychain::Keychain;

type KeychainTable = RwLock<BTreeMap<ObjectId, Arc<Keychain>>>;

/// Open keychains keyed by their store object.
///
/// Hits take the table lock shared. A miss takes it exclusive for the whole
/// open so no one observes a half-registered keychain and each keychain is
/// opened once.
#[derive(Default)]
pub struct KeychainRegistry {
    table: Arc<KeychainTable>,
}

impl KeychainRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a hold on `obj` if it is already open.
    #[must_use]
    pub fn hold_existing(&self, obj: ObjectId) -> Option<KeychainRef> {
        let table = self.table.read();
        table.get(&obj).map(|keychain| self.new_ref(keychain))
    }

    /// Takes a hold on `obj`, opening it with `open` on a miss.
    ///
    /// # Errors
    ///
    /// Returns whatever `open` fails with; nothing is registered then.
    pub fn hold_or_open(
        &self,
        obj: ObjectId,
        open: impl FnOnce() -> Result<Keychain>,
    ) -> Result<KeychainRef> {
        if let Some(held) = self.hold_existing(obj) {
            return Ok(held);
        }

        let mut table = self.table.write();
        if let Some(keychain) = table.get(&obj) {
            return Ok(self.new_ref(keychain));
        }
        let keychain = Arc::new(open()?);
        let held = self.new_ref(&keychain);
        table.insert(obj, keychain);
        debug!(kcobj = %obj, "registered keychain");
        Ok(held)
    }

    /// Gives up a hold; the last one unregisters and frees the keychain.
    pub fn release(&self, keychain: KeychainRef) {
        drop(keychain);
    }

    /// Outstanding holds on `obj`, if it is open.
    #[must_use]
    pub fn holds(&self, obj: ObjectId) -> Option<usize> {
        self.table.read().get(&obj).map(|keychain| keychain.holds())
    }

    /// Returns true if `obj` is open.
    #[must_use]
    pub fn is_open(&self, obj: ObjectId) -> bool {
        self.table.read().contains_key(&obj)
    }

    /// Number of open keychains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Returns true if nothing is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn new_ref(&self, keychain: &Arc<Keychain>) -> KeychainRef {
        keychain.take_hold();
        KeychainRef {
            keychain: Arc::clone(keychain),
            table: Arc::clone(&self.table),
        }
    }
}

impl fmt::Debug for KeychainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeychainRegistry").field("open", &self.len()).finish()
    }
}

/// A counted hold on a registered [`Keychain`].
///
/// Cloning takes another hold and dropping releases one.
pub struct KeychainRef {
    keychain: Arc<Keychain>,
    table: Arc<KeychainTable>,
}

impl Deref for KeychainRef {
    type Target = Keychain;

    fn deref(&self) -> &Keychain {
        &self.keychain
    }
}

impl Clone for KeychainRef {
    fn clone(&self) -> Self {
        self.keychain.take_hold();
        Self {
            keychain: Arc::clone(&self.keychain),
            table: Arc::clone(&self.table),
        }
    }
}

impl Drop for KeychainRef {
    fn drop(&mut self) {
        if self.keychain.release_shared_hold() {
            return;
        }

        let mut table = self.table.write();
        if self.keychain.release_hold() == 0 {
            let obj = self.keychain.obj();
            table.remove(&obj);
            debug!(kcobj = %obj, "freed keychain");
        }
    }
}

impl fmt::Debug for KeychainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeychainRef").field(&self.keychain).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Algorithm;
    use crate::error::Error;
    use crate::ids::DirId;
    use crate::key::{KeyEntry, WrappingKey, WrappingKeyRef};
    use crate::keychain::persist_entry;
    use crate::store::{MemStore, ObjectStore};
    use crate::txg::test_context;

    fn setup() -> (MemStore, WrappingKeyRef, ObjectId) {
        let store = MemStore::new();
        let wkey = WrappingKeyRef::new(DirId(1), WrappingKey::from_bytes(&[8; 32]).unwrap());
        let obj = store.create_object(&test_context(1)).unwrap();
        let entry = KeyEntry::generate(Algorithm::Aes256Gcm, 1).unwrap();
        persist_entry(&store, &entry, wkey.key(), obj, &test_context(1)).unwrap();
        (store, wkey, obj)
    }

    #[test]
    fn test_second_hold_reuses_open_keychain() {
        let (store, wkey, obj) = setup();
        let registry = KeychainRegistry::new();

        let first = registry
            .hold_or_open(obj, || Keychain::open(&store, wkey.clone(), obj))
            .unwrap();
        let second = registry
            .hold_or_open(obj, || panic!("keychain opened twice"))
            .unwrap();

        assert_eq!(registry.holds(obj), Some(2));
        assert_eq!(store.iterate_calls(), 1);
        assert_eq!(first.obj(), second.obj());
    }

    #[test]
    fn test_last_release_frees_keychain_and_wrapping_key() {
        let (store, wkey, obj) = setup();
        let registry = KeychainRegistry::new();

        let held = registry
            .hold_or_open(obj, || Keychain::open(&store, wkey.clone(), obj))
            .unwrap();
        let copy = held.clone();
        assert_eq!(wkey.handle_count(), 2);

        registry.release(held);
        assert_eq!(registry.holds(obj), Some(1));
        registry.release(copy);

        assert!(!registry.is_open(obj));
        assert!(registry.is_empty());
        assert_eq!(wkey.handle_count(), 1);
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        let registry = KeychainRegistry::new();
        let result = registry.hold_or_open(ObjectId(5), || Err(Error::InvalidKey));
        assert!(matches!(result, Err(Error::InvalidKey)));
        assert!(registry.hold_existing(ObjectId(5)).is_none());
    }

    #[test]
    fn test_concurrent_holds_open_once() {
        let (store, wkey, obj) = setup();
        let registry = KeychainRegistry::new();

        let refs: Vec<KeychainRef> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        registry
                            .hold_or_open(obj, || Keychain::open(&store, wkey.clone(), obj))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(store.iterate_calls(), 1);
        assert_eq!(registry.holds(obj), Some(8));
        drop(refs);
        assert!(!registry.is_open(obj));
    }
}
