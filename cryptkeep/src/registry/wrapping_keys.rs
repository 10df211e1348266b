use std::collections::BTreeMap;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ids::DirId;
use crate::key::{WrappingKey, WrappingKeyRef};

/// Wrapping keys loaded for encryption roots, keyed by directory.
#[derive(Debug, Default)]
pub struct WrappingKeyRegistry {
    keys: RwLock<BTreeMap<DirId, WrappingKeyRef>>,
}

impl WrappingKeyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `key` for `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyLoaded` if `dir` already has a key.
    pub fn load(&self, dir: DirId, key: WrappingKey) -> Result<()> {
        self.insert(WrappingKeyRef::new(dir, key))
    }

    /// Registers an already bound key.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyLoaded` if its directory already has a key.
    pub fn insert(&self, wkey: WrappingKeyRef) -> Result<()> {
        let mut keys = self.keys.write();
        let dir = wkey.dir();
        if keys.contains_key(&dir) {
            return Err(Error::AlreadyLoaded(dir));
        }
        keys.insert(dir, wkey);
        debug!(dir = %dir, "wrapping key loaded");
        Ok(())
    }

    /// Removes and frees the key of `dir`.
    ///
    /// Liveness is decided under the exclusive lock, so a keychain that is
    /// being opened concurrently either still holds the key here or has not
    /// taken it yet and will fail to resolve it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotLoaded` if no key is loaded and `Error::InUse` if
    /// an open keychain still holds it.
    pub fn unload(&self, dir: DirId) -> Result<()> {
        let mut keys = self.keys.write();
        let wkey = keys.get(&dir).ok_or(Error::NotLoaded(dir))?;
        let holders = wkey.handle_count() - 1;
        if holders != 0 {
            warn!(dir = %dir, holders, "wrapping key still in use");
            return Err(Error::InUse(format!(
                "key for directory {dir} is held by {holders} keychain(s)"
            )));
        }
        keys.remove(&dir);
        debug!(dir = %dir, "wrapping key unloaded");
        Ok(())
    }

    /// Takes a hold on the key loaded for encryption root `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeyLoaded` if none is loaded.
    pub fn resolve(&self, dir: DirId) -> Result<WrappingKeyRef> {
        self.keys.read().get(&dir).cloned().ok_or(Error::NoKeyLoaded(dir))
    }

    /// Returns true if a key is loaded for `dir`.
    #[must_use]
    pub fn is_loaded(&self, dir: DirId) -> bool {
        self.keys.read().contains_key(&dir)
    }

    /// Holds on the key of `dir` other than the registry's own.
    #[must_use]
    pub fn refcount(&self, dir: DirId) -> Option<usize> {
        self.keys.read().get(&dir).map(|wkey| wkey.handle_count() - 1)
    }

    /// Takes the registry exclusively for a multi-step update.
    pub fn lock_exclusive(&self) -> WrappingKeysGuard<'_> {
        WrappingKeysGuard {
            keys: self.keys.write(),
        }
    }
}

/// Exclusive access to a [`WrappingKeyRegistry`].
pub struct WrappingKeysGuard<'a> {
    keys: RwLockWriteGuard<'a, BTreeMap<DirId, WrappingKeyRef>>,
}

impl WrappingKeysGuard<'_> {
    /// Same as [`WrappingKeyRegistry::resolve`] through the held lock.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeyLoaded` if none is loaded.
    pub fn resolve(&self, dir: DirId) -> Result<WrappingKeyRef> {
        self.keys.get(&dir).cloned().ok_or(Error::NoKeyLoaded(dir))
    }

    /// Installs `wkey` for its directory, returning the key it displaced.
    pub fn replace(&mut self, wkey: WrappingKeyRef) -> Option<WrappingKeyRef> {
        let dir = wkey.dir();
        let old = self.keys.insert(dir, wkey);
        debug!(dir = %dir, "wrapping key replaced");
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> WrappingKey {
        WrappingKey::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_load_twice_fails() {
        let registry = WrappingKeyRegistry::new();
        registry.load(DirId(3), key(1)).unwrap();
        assert!(matches!(
            registry.load(DirId(3), key(2)),
            Err(Error::AlreadyLoaded(DirId(3)))
        ));
        assert!(registry.is_loaded(DirId(3)));
    }

    #[test]
    fn test_resolve_takes_a_hold() {
        let registry = WrappingKeyRegistry::new();
        registry.load(DirId(3), key(1)).unwrap();
        assert_eq!(registry.refcount(DirId(3)), Some(0));

        let held = registry.resolve(DirId(3)).unwrap();
        assert_eq!(held.dir(), DirId(3));
        assert_eq!(registry.refcount(DirId(3)), Some(1));

        drop(held);
        assert_eq!(registry.refcount(DirId(3)), Some(0));
        assert!(matches!(
            registry.resolve(DirId(4)),
            Err(Error::NoKeyLoaded(DirId(4)))
        ));
    }

    #[test]
    fn test_unload_refuses_held_key() {
        let registry = WrappingKeyRegistry::new();
        registry.load(DirId(3), key(1)).unwrap();
        let held = registry.resolve(DirId(3)).unwrap();

        assert!(matches!(registry.unload(DirId(3)), Err(Error::InUse(_))));
        drop(held);
        registry.unload(DirId(3)).unwrap();
        assert!(!registry.is_loaded(DirId(3)));
        assert!(matches!(
            registry.unload(DirId(3)),
            Err(Error::NotLoaded(DirId(3)))
        ));
    }

    #[test]
    fn test_guard_replace_keeps_old_handles_valid() {
        let registry = WrappingKeyRegistry::new();
        registry.load(DirId(3), key(1)).unwrap();
        let old = registry.resolve(DirId(3)).unwrap();

        let new = WrappingKeyRef::new(DirId(3), key(2));
        {
            let mut guard = registry.lock_exclusive();
            assert!(guard.resolve(DirId(3)).unwrap().same_key(&old));
            let displaced = guard.replace(new.clone()).unwrap();
            assert!(displaced.same_key(&old));
        }

        assert!(registry.resolve(DirId(3)).unwrap().same_key(&new));
        assert_eq!(old.handle_count(), 1);
        assert_eq!(old.key().expose(), &[1; 32]);
    }
}
