//! Transactional keychain operations.
//!
//! Add-key and rewrap are [`SyncTask`]s run by the engine. Creating,
//! cloning and destroying a keychain are sync-only steps that an enclosing
//! dataset task calls with its own [`TxContext`].

use tracing::debug;

use crate::algorithm::{Algorithm, CryptSetting};
use crate::error::{Error, Result};
use crate::hierarchy::DirTree;
use crate::ids::{DirId, ObjectId};
use crate::key::{KeyEntry, WrappingKey, WrappingKeyRef};
use crate::keychain::persist_entry;
use crate::keystore::Keystore;
use crate::params::CryptoParams;
use crate::registry::KeychainRef;
use crate::store::{Feature, ObjectStore};
use crate::txg::{SyncTask, TxContext};

impl<S: ObjectStore, D: DirTree> Keystore<S, D> {
    /// Holds the keychain of `dir`, requiring `dir` to be its encryption
    /// root when `needs_root` is set.
    ///
    /// The hold keeps the wrapping key in use, so it cannot be unloaded
    /// until the hold is released.
    fn check_keychain(&self, dir: DirId, needs_root: bool) -> Result<KeychainRef> {
        let keychain = self.hold_keychain(dir)?;
        if needs_root && keychain.wrapping_key_dir() != dir {
            return Err(Error::InvalidParams(format!(
                "directory {dir} is not an encryption root"
            )));
        }
        Ok(keychain)
    }

    /// Allocates a keychain object seeded with one generation at the
    /// transaction's txg, wrapped under `wkey`.
    ///
    /// # Errors
    ///
    /// Propagates entropy and store failures.
    pub fn create_keychain_sync(
        &self,
        algorithm: Algorithm,
        wkey: &WrappingKey,
        tx: &TxContext,
    ) -> Result<ObjectId> {
        let obj = self.store.create_object(tx)?;
        let entry = KeyEntry::generate(algorithm, tx.txg())?;
        persist_entry(&*self.store, &entry, wkey, obj, tx)?;
        self.store.feature_incr(Feature::Encryption, tx)?;

        debug!(kcobj = %obj, txg = tx.txg(), %algorithm, "created keychain");
        Ok(obj)
    }

    /// Allocates a keychain object holding every generation of `origin`'s
    /// keychain rewrapped under `wkey`, txgs preserved, plus a fresh
    /// generation when `add_key` is set.
    ///
    /// # Errors
    ///
    /// Returns any [`Keystore::hold_keychain`] failure for `origin`,
    /// `Error::InvalidParams` if `add_key` is set but the origin already has
    /// a generation at this txg, and propagates entropy and store failures.
    pub fn clone_keychain_sync(
        &self,
        origin: DirId,
        wkey: &WrappingKey,
        add_key: bool,
        tx: &TxContext,
    ) -> Result<ObjectId> {
        let origin_kc = self.hold_keychain(origin)?;
        let entries = origin_kc.entries();
        if add_key && entries.last().is_some_and(|last| last.txg() >= tx.txg()) {
            return Err(Error::InvalidParams(format!(
                "origin keychain {} already has a generation at txg {}",
                origin_kc.obj(),
                tx.txg()
            )));
        }

        let obj = self.store.create_object(tx)?;
        for entry in &entries {
            persist_entry(&*self.store, entry, wkey, obj, tx)?;
        }
        if add_key {
            let entry = KeyEntry::generate(origin_kc.algorithm(), tx.txg())?;
            persist_entry(&*self.store, &entry, wkey, obj, tx)?;
        }
        self.store.feature_incr(Feature::Encryption, tx)?;

        debug!(kcobj = %obj, origin = %origin_kc.obj(), add_key, "cloned keychain");
        Ok(obj)
    }

    /// Frees keychain object `obj`. Nothing may still hold it.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn destroy_keychain_sync(&self, obj: ObjectId, tx: &TxContext) -> Result<()> {
        self.store.destroy_object(obj, tx)?;
        self.store.feature_decr(Feature::Encryption, tx)?;
        debug!(kcobj = %obj, "destroyed keychain");
        Ok(())
    }
}

/// Appends a key generation to a directory's keychain.
pub struct AddKeyTask<'a, S, D> {
    keystore: &'a Keystore<S, D>,
    dir: DirId,
    held: Option<KeychainRef>,
}

impl<'a, S, D> AddKeyTask<'a, S, D> {
    /// Targets the keychain of `dir`.
    #[must_use]
    pub const fn new(keystore: &'a Keystore<S, D>, dir: DirId) -> Self {
        Self {
            keystore,
            dir,
            held: None,
        }
    }
}

impl<S: ObjectStore, D: DirTree> SyncTask for AddKeyTask<'_, S, D> {
    type Output = ();

    fn name(&self) -> &'static str {
        "add-key"
    }

    fn check(&mut self, _tx: &TxContext) -> Result<()> {
        self.held = Some(self.keystore.check_keychain(self.dir, false)?);
        Ok(())
    }

    fn sync(self, tx: &mut TxContext) -> Result<()> {
        let keychain = self.held.ok_or(Error::NoKeychain(self.dir))?;
        keychain.add_generation(&*self.keystore.store, tx)
    }
}

/// Moves an encryption root and every directory inheriting its key onto a
/// new wrapping key.
pub struct RewrapTask<'a, S, D> {
    keystore: &'a Keystore<S, D>,
    dir: DirId,
    params: CryptoParams,
    held: Option<KeychainRef>,
}

impl<'a, S, D> RewrapTask<'a, S, D> {
    /// Rewraps the subtree rooted at `dir` under `params.wrapping_key`.
    #[must_use]
    pub const fn new(
        keystore: &'a Keystore<S, D>,
        dir: DirId,
        params: CryptoParams,
    ) -> Self {
        Self {
            keystore,
            dir,
            params,
            held: None,
        }
    }
}

impl<S: ObjectStore, D: DirTree> SyncTask for RewrapTask<'_, S, D> {
    type Output = ();

    fn name(&self) -> &'static str {
        "rewrap"
    }

    fn check(&mut self, _tx: &TxContext) -> Result<()> {
        if self.params.crypt != CryptSetting::Inherit {
            return Err(Error::InvalidParams(
                "rewrap cannot change encryption".into(),
            ));
        }
        if self.params.wrapping_key.is_none() {
            return Err(Error::InvalidParams(
                "rewrap requires a new wrapping key".into(),
            ));
        }
        if self.params.cmd.is_some() {
            return Err(Error::InvalidParams(
                "rewrap does not accept a key command".into(),
            ));
        }
        self.held = Some(self.keystore.check_keychain(self.dir, true)?);
        Ok(())
    }

    fn sync(self, tx: &mut TxContext) -> Result<()> {
        let Self {
            keystore,
            dir: root,
            params,
            held,
        } = self;
        let root_kc = held.ok_or(Error::NoKeychain(root))?;
        let CryptoParams {
            keysource,
            salt,
            wrapping_key,
            ..
        } = params;
        let key = wrapping_key.ok_or_else(|| {
            Error::InvalidParams("rewrap requires a new wrapping key".into())
        })?;
        let new_key = WrappingKeyRef::new(root, key);

        let mut wkeys = keystore.wrapping_keys.lock_exclusive();
        let mut pending = vec![root];
        let mut rewrapped = 0usize;
        while let Some(dir) = pending.pop() {
            match keystore.dirs.keysource_dir(dir) {
                Ok(source) if source == root => {}
                Ok(_) | Err(Error::NoKeychain(_)) => continue,
                Err(err) => return Err(err),
            }

            let keychain = keystore.hold_keychain_with(dir, || wkeys.resolve(root))?;
            keychain.rewrap(&*keystore.store, new_key.clone(), tx)?;
            drop(keychain);

            pending.extend(keystore.dirs.children(dir)?);
            rewrapped += 1;
        }

        // Every keychain under the root now holds the new key, so the old
        // one is only referenced by the registry entry being replaced.
        drop(root_kc);
        wkeys.replace(new_key);
        drop(wkeys);
        debug!(dir = %root, keychains = rewrapped, "rewrap complete");

        if keysource.is_some() || salt.is_some() {
            keystore.dirs.set_keysource(root, keysource.as_deref(), salt, tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::KeystoreConfig;
    use crate::error::Error;
    use crate::hierarchy::MemDirTree;
    use crate::ids::DatasetId;
    use crate::keychain::Keychain;
    use crate::params::CryptoCmd;
    use crate::store::MemStore;
    use crate::txg::{SpaceCheck, TxgEngine};

    const ROOT: DirId = DirId(2);
    const CHILD: DirId = DirId(3);
    const GRANDCHILD: DirId = DirId(4);
    const NESTED_ROOT: DirId = DirId(5);

    fn key(byte: u8) -> WrappingKey {
        WrappingKey::from_bytes(&[byte; 32]).unwrap()
    }

    /// Root 2 (key 0x11) with children 3 and 5; 3 has child 4. Dir 5 is a
    /// separate encryption root under key 0x55. Both keys are loaded.
    fn keystore() -> Keystore<MemStore, MemDirTree> {
        let dirs = MemDirTree::new();
        dirs.add_root(DirId(1)).unwrap();
        dirs.add_child(DirId(1), ROOT).unwrap();
        dirs.add_child(ROOT, CHILD).unwrap();
        dirs.add_child(CHILD, GRANDCHILD).unwrap();
        dirs.add_child(ROOT, NESTED_ROOT).unwrap();
        dirs.set_encryption(ROOT, CryptSetting::Explicit(Algorithm::Aes128Gcm)).unwrap();
        dirs.set_local_keysource(ROOT, "raw,prompt").unwrap();
        dirs.set_local_keysource(NESTED_ROOT, "raw,prompt").unwrap();

        let ks = Keystore::new(
            Arc::new(MemStore::new()),
            Arc::new(dirs),
            Arc::new(TxgEngine::new(5)),
            KeystoreConfig::default(),
        );
        {
            let mut open = ks.engine().open_txg(SpaceCheck::Normal);
            let roots = [
                (ROOT, 0x11),
                (CHILD, 0x11),
                (GRANDCHILD, 0x11),
                (NESTED_ROOT, 0x55),
            ];
            for (dir, byte) in roots {
                let obj = ks
                    .create_keychain_sync(Algorithm::Aes128Gcm, &key(byte), open.tx())
                    .unwrap();
                ks.dirs().set_keychain_obj(dir, Some(obj)).unwrap();
            }
        }
        ks.load_wrapping_key(ROOT, CryptoParams::with_wrapping_key(key(0x11))).unwrap();
        ks.load_wrapping_key(NESTED_ROOT, CryptoParams::with_wrapping_key(key(0x55)))
            .unwrap();
        ks
    }

    fn plaintext_keys(ks: &Keystore<MemStore, MemDirTree>, dir: DirId) -> Vec<(u64, Vec<u8>)> {
        ks.hold_keychain(dir)
            .unwrap()
            .entries()
            .iter()
            .map(|e| (e.txg(), e.key().to_vec()))
            .collect()
    }

    fn reopen(ks: &Keystore<MemStore, MemDirTree>, dir: DirId, byte: u8) -> Result<Keychain> {
        let obj = ks.dirs().keychain_obj(dir).unwrap().unwrap();
        Keychain::open(ks.store(), WrappingKeyRef::new(dir, key(byte)), obj)
    }

    #[test]
    fn test_add_key_appends_at_engine_txg() {
        let ks = keystore();
        ks.add_key(CHILD).unwrap();

        let keychain = ks.hold_keychain(CHILD).unwrap();
        let txgs: Vec<u64> = keychain.entries().iter().map(|e| e.txg()).collect();
        assert_eq!(txgs, vec![5, 6]);
        assert_eq!(keychain.key_for_txg(5).unwrap().txg(), 5);
        assert_eq!(reopen(&ks, CHILD, 0x11).unwrap().entries().len(), 2);
    }

    /// Runs `between` after `task` passed its check and before it syncs.
    struct Interleaved<'a, T> {
        task: T,
        between: &'a dyn Fn(),
    }

    impl<T: SyncTask> SyncTask for Interleaved<'_, T> {
        type Output = T::Output;

        fn name(&self) -> &'static str {
            self.task.name()
        }

        fn check(&mut self, tx: &TxContext) -> Result<()> {
            self.task.check(tx)
        }

        fn sync(self, tx: &mut TxContext) -> Result<T::Output> {
            (self.between)();
            self.task.sync(tx)
        }
    }

    #[test]
    fn test_unload_between_add_key_phases_is_refused() {
        let ks = keystore();
        let obj = ks.dirs().keychain_obj(NESTED_ROOT).unwrap().unwrap();
        assert!(!ks.keychains().is_open(obj));

        let unload = || {
            assert!(matches!(
                ks.unload_wrapping_key(NESTED_ROOT),
                Err(Error::InUse(_))
            ));
        };
        let task = Interleaved {
            task: AddKeyTask::new(&ks, NESTED_ROOT),
            between: &unload,
        };
        ks.engine().run(task, SpaceCheck::Normal).unwrap();

        assert_eq!(reopen(&ks, NESTED_ROOT, 0x55).unwrap().entries().len(), 2);
        assert!(ks.keychains().is_empty());
        ks.unload_wrapping_key(NESTED_ROOT).unwrap();
    }

    #[test]
    fn test_unload_between_rewrap_phases_is_refused() {
        let ks = keystore();
        let unload = || {
            assert!(matches!(ks.unload_wrapping_key(ROOT), Err(Error::InUse(_))));
        };
        let params = CryptoParams::with_wrapping_key(key(0x22));
        let task = Interleaved {
            task: RewrapTask::new(&ks, ROOT, params),
            between: &unload,
        };
        ks.engine().run(task, SpaceCheck::Normal).unwrap();

        for dir in [ROOT, CHILD, GRANDCHILD] {
            assert!(reopen(&ks, dir, 0x22).is_ok());
        }
        assert!(ks.keychains().is_empty());
        ks.unload_wrapping_key(ROOT).unwrap();
    }

    #[test]
    fn test_add_key_check_rejects_without_key() {
        let ks = keystore();
        ks.unload_wrapping_key(NESTED_ROOT).unwrap();
        assert!(matches!(
            ks.add_key(NESTED_ROOT),
            Err(Error::PermissionDenied(NESTED_ROOT))
        ));
        assert!(matches!(ks.add_key(DirId(1)), Err(Error::NoKeychain(_))));
        assert_eq!(ks.engine().current_txg(), 6);
    }

    #[test]
    fn test_rewrap_check_rules() {
        let ks = keystore();
        assert!(matches!(
            ks.rewrap(ROOT, CryptoParams::default()),
            Err(Error::InvalidParams(_))
        ));

        let with_crypt = CryptoParams::with_wrapping_key(key(0x22)).crypt(CryptSetting::On);
        assert!(matches!(
            ks.rewrap(ROOT, with_crypt),
            Err(Error::InvalidParams(_))
        ));

        let with_cmd = CryptoParams::with_wrapping_key(key(0x22)).cmd(CryptoCmd::Rewrap);
        assert!(matches!(
            ks.rewrap(ROOT, with_cmd),
            Err(Error::InvalidParams(_))
        ));

        let not_root = CryptoParams::with_wrapping_key(key(0x22));
        assert!(matches!(
            ks.rewrap(CHILD, not_root),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_rewrap_covers_inheriting_subtree_only() {
        let ks = keystore();
        ks.create_keychain_record(DatasetId(40), GRANDCHILD).unwrap();
        let subtree = [ROOT, CHILD, GRANDCHILD];
        let before: Vec<_> = subtree.iter().map(|d| plaintext_keys(&ks, *d)).collect();
        let old = ks.resolve_wrapping_key(ROOT).unwrap();

        let params = CryptoParams::with_wrapping_key(key(0x22)).keysource("raw,file").salt(99);
        ks.rewrap(ROOT, params).unwrap();

        let after: Vec<_> = subtree.iter().map(|d| plaintext_keys(&ks, *d)).collect();
        assert_eq!(before, after);
        for dir in subtree {
            assert!(reopen(&ks, dir, 0x22).is_ok());
            assert!(matches!(reopen(&ks, dir, 0x11), Err(Error::InvalidKey)));
        }
        assert!(reopen(&ks, NESTED_ROOT, 0x55).is_ok());

        let current = ks.resolve_wrapping_key(ROOT).unwrap();
        assert!(!current.same_key(&old));
        assert_eq!(old.handle_count(), 1);
        let record = ks.records().lookup(DatasetId(40)).unwrap();
        assert!(record.wrapping_key().same_key(&current));

        assert_eq!(ks.dirs().local_keysource(ROOT).as_deref(), Some("raw,file"));
        assert_eq!(ks.dirs().local_salt(ROOT), Some(99));
    }

    #[test]
    fn test_clone_preserves_history() {
        let ks = keystore();
        ks.add_key(CHILD).unwrap();
        let origin = plaintext_keys(&ks, CHILD);

        let obj = {
            let mut open = ks.engine().open_txg(SpaceCheck::Normal);
            ks.clone_keychain_sync(CHILD, &key(0x77), false, open.tx()).unwrap()
        };
        let clone_key = WrappingKeyRef::new(DirId(9), key(0x77));
        let clone = Keychain::open(ks.store(), clone_key, obj).unwrap();
        let cloned: Vec<_> = clone.entries().iter().map(|e| (e.txg(), e.key().to_vec())).collect();
        assert_eq!(cloned, origin);
    }

    #[test]
    fn test_clone_with_add_key_rotates() {
        let ks = keystore();
        let obj = {
            let mut open = ks.engine().open_txg(SpaceCheck::Normal);
            ks.clone_keychain_sync(CHILD, &key(0x77), true, open.tx()).unwrap()
        };
        let clone_key = WrappingKeyRef::new(DirId(9), key(0x77));
        let clone = Keychain::open(ks.store(), clone_key, obj).unwrap();
        let txgs: Vec<u64> = clone.entries().iter().map(|e| e.txg()).collect();
        assert_eq!(txgs, vec![5, 6]);
        assert_eq!(clone.algorithm(), Algorithm::Aes128Gcm);
    }

    #[test]
    fn test_destroy_releases_feature() {
        let ks = keystore();
        assert_eq!(ks.store().feature_refcount(Feature::Encryption).unwrap(), 4);
        let obj = ks.dirs().keychain_obj(GRANDCHILD).unwrap().unwrap();
        {
            let mut open = ks.engine().open_txg(SpaceCheck::Normal);
            ks.destroy_keychain_sync(obj, open.tx()).unwrap();
        }
        assert_eq!(ks.store().feature_refcount(Feature::Encryption).unwrap(), 3);
        assert!(ks.store().iterate(obj).is_err());
    }
}
