//! The per-pool keystore.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::algorithm::{Algorithm, CryptSetting};
use crate::config::KeystoreConfig;
use crate::error::{Error, Result};
use crate::hierarchy::DirTree;
use crate::ids::{DatasetId, DirId};
use crate::key::{KeyEntry, WrappingKeyRef};
use crate::keychain::Keychain;
use crate::ops::{AddKeyTask, RewrapTask};
use crate::params::{CryptoCmd, CryptoParams};
use crate::registry::{KeychainRecordRegistry, KeychainRef, KeychainRegistry, WrappingKeyRegistry};
use crate::store::ObjectStore;
use crate::txg::TxgEngine;

/// Key availability of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// The directory is not encrypted
    None,
    /// Encrypted, but its wrapping key is not loaded
    Unavailable,
    /// Encrypted and its wrapping key is loaded
    Available,
}

/// Loaded key state of one pool plus the operations that change it.
///
/// Owns the three registries and borrows the pool's object store, directory
/// tree and transaction engine.
pub struct Keystore<S, D> {
    pub(crate) store: Arc<S>,
    pub(crate) dirs: Arc<D>,
    engine: Arc<TxgEngine>,
    config: KeystoreConfig,
    pub(crate) wrapping_keys: WrappingKeyRegistry,
    keychains: KeychainRegistry,
    records: KeychainRecordRegistry,
}

impl<S: ObjectStore, D: DirTree> Keystore<S, D> {
    /// Creates a keystore with nothing loaded.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        dirs: Arc<D>,
        engine: Arc<TxgEngine>,
        config: KeystoreConfig,
    ) -> Self {
        Self {
            store,
            dirs,
            engine,
            config,
            wrapping_keys: WrappingKeyRegistry::new(),
            keychains: KeychainRegistry::new(),
            records: KeychainRecordRegistry::new(),
        }
    }

    /// The persistent store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The directory tree.
    #[must_use]
    pub fn dirs(&self) -> &D {
        &self.dirs
    }

    /// The transaction engine.
    #[must_use]
    pub fn engine(&self) -> &TxgEngine {
        &self.engine
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &KeystoreConfig {
        &self.config
    }

    /// Loaded wrapping keys.
    #[must_use]
    pub const fn wrapping_keys(&self) -> &WrappingKeyRegistry {
        &self.wrapping_keys
    }

    /// Open keychains.
    #[must_use]
    pub const fn keychains(&self) -> &KeychainRegistry {
        &self.keychains
    }

    /// Dataset keychain records.
    #[must_use]
    pub const fn records(&self) -> &KeychainRecordRegistry {
        &self.records
    }

    /// Takes a hold on the wrapping key `dir` inherits.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeychain` if `dir` has no key source and
    /// `Error::NoKeyLoaded` if its key is not loaded.
    pub fn resolve_wrapping_key(&self, dir: DirId) -> Result<WrappingKeyRef> {
        self.wrapping_keys.resolve(self.dirs.keysource_dir(dir)?)
    }

    /// Takes a hold on the keychain of `dir`, opening it if needed.
    ///
    /// # Errors
    ///
    /// - `Error::NoKeychain` if `dir` is not encrypted
    /// - `Error::PermissionDenied` if it must be opened and its wrapping key
    ///   is not loaded
    /// - any [`Keychain::open`] failure
    pub fn hold_keychain(&self, dir: DirId) -> Result<KeychainRef> {
        self.hold_keychain_with(dir, || self.resolve_wrapping_key(dir))
    }

    /// Gives up a hold taken with [`Keystore::hold_keychain`].
    pub fn release_keychain(&self, keychain: KeychainRef) {
        self.keychains.release(keychain);
    }

    /// [`Keystore::hold_keychain`] with a caller-supplied key resolver, used
    /// while the wrapping-key registry is already locked.
    pub(crate) fn hold_keychain_with(
        &self,
        dir: DirId,
        resolve: impl FnOnce() -> Result<WrappingKeyRef>,
    ) -> Result<KeychainRef> {
        let obj = self.dirs.keychain_obj(dir)?.ok_or(Error::NoKeychain(dir))?;
        if let Some(held) = self.keychains.hold_existing(obj) {
            return Ok(held);
        }

        let wkey = resolve().map_err(|err| {
            debug!(dir = %dir, error = %err, "wrapping key unavailable");
            Error::PermissionDenied(dir)
        });
        self.keychains.hold_or_open(obj, || Keychain::open(&*self.store, wkey?, obj))
    }

    /// Loads the wrapping key of encryption root `dir`.
    ///
    /// `params` must carry the key and nothing else. Unless disabled in the
    /// configuration, the key is first proven by opening the keychain.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidParams` for a missing key, extra parameters or a
    ///   directory that is not an encryption root
    /// - `Error::NoKeychain` if `dir` is not encrypted
    /// - `Error::InvalidKey` if the key does not open the keychain
    /// - `Error::AlreadyLoaded` if a key is already loaded
    pub fn load_wrapping_key(&self, dir: DirId, params: CryptoParams) -> Result<()> {
        let CryptoParams {
            crypt,
            keysource,
            salt,
            wrapping_key,
            cmd,
        } = params;
        let key = wrapping_key.ok_or_else(|| {
            Error::InvalidParams("loading a key requires a wrapping key".into())
        })?;
        if crypt != CryptSetting::Inherit || keysource.is_some() || salt.is_some() {
            return Err(Error::InvalidParams(
                "loading a key does not accept encryption, keysource or salt".into(),
            ));
        }
        if cmd.is_some() {
            return Err(Error::InvalidParams(
                "loading a key does not accept a key command".into(),
            ));
        }

        let obj = self.dirs.keychain_obj(dir)?.ok_or(Error::NoKeychain(dir))?;
        if self.dirs.keysource_dir(dir)? != dir {
            return Err(Error::InvalidParams(format!(
                "directory {dir} is not an encryption root"
            )));
        }

        let wkey = WrappingKeyRef::new(dir, key);
        if self.config.verify_on_load {
            if let Err(err) = Keychain::open(&*self.store, wkey.clone(), obj) {
                warn!(dir = %dir, kcobj = %obj, error = %err, "wrapping key rejected");
                return Err(err);
            }
        }
        self.wrapping_keys.insert(wkey)
    }

    /// Unloads the wrapping key of `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotLoaded` if no key is loaded and `Error::InUse` if
    /// an open keychain still uses it.
    pub fn unload_wrapping_key(&self, dir: DirId) -> Result<()> {
        self.dirs.keychain_obj(dir)?;
        self.wrapping_keys.unload(dir).map_err(|err| {
            warn!(dir = %dir, error = %err, "unload refused");
            err
        })
    }

    /// Appends a key generation to the keychain of `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeychain` or `Error::PermissionDenied` if the
    /// keychain cannot be held.
    pub fn add_key(&self, dir: DirId) -> Result<()> {
        self.engine.run(AddKeyTask::new(self, dir), self.config.space_check)
    }

    /// Rewraps the keychain of encryption root `dir` and of every
    /// descendant that inherits its key, under `params.wrapping_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` for a missing key, a conflicting
    /// parameter, or a directory that is not an encryption root.
    pub fn rewrap(&self, dir: DirId, params: CryptoParams) -> Result<()> {
        self.engine.run(RewrapTask::new(self, dir, params), self.config.space_check)
    }

    /// Key availability of `dir`, recomputed on every call.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `dir` does not exist.
    pub fn key_status(&self, dir: DirId) -> Result<KeyStatus> {
        if self.dirs.keychain_obj(dir)?.is_none() {
            return Ok(KeyStatus::None);
        }
        Ok(match self.resolve_wrapping_key(dir) {
            Ok(_) => KeyStatus::Available,
            Err(_) => KeyStatus::Unavailable,
        })
    }

    /// Binds an opening dataset of `dir` to its keychain.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyBound` for a second record and any
    /// [`Keystore::hold_keychain`] failure.
    pub fn create_keychain_record(&self, dataset: DatasetId, dir: DirId) -> Result<()> {
        let keychain = self.hold_keychain(dir)?;
        self.records.bind(dataset, keychain)
    }

    /// Drops the record of a closing dataset.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotBound` if the dataset has no record.
    pub fn remove_keychain_record(&self, dataset: DatasetId) -> Result<()> {
        self.records.unbind(dataset)
    }

    /// Key that decrypts data `dataset` wrote in `txg`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotBound` if the dataset has no record and
    /// `Error::NoKeyForEpoch` if `txg` predates its keychain.
    pub fn lookup_key_for_read(&self, dataset: DatasetId, txg: u64) -> Result<Arc<KeyEntry>> {
        self.records.lookup(dataset)?.key_for_txg(txg)
    }

    /// Key that new writes of `dataset` use.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotBound` if the dataset has no record.
    pub fn lookup_key_for_write(&self, dataset: DatasetId) -> Result<Arc<KeyEntry>> {
        Ok(self.records.lookup(dataset)?.latest())
    }

    /// Algorithm a new child of `parent` created with `crypt` gets, `None`
    /// if it is unencrypted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSuchDirectory` if `parent` does not exist.
    pub fn effective_algorithm(
        &self,
        parent: DirId,
        crypt: CryptSetting,
    ) -> Result<Option<Algorithm>> {
        let setting = match crypt {
            CryptSetting::Inherit => self.dirs.encryption(parent)?,
            other => other,
        };
        Ok(setting.algorithm(self.config.default_algorithm))
    }

    /// Validates the crypto parameters of a new dataset under `parent`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` for a forbidden combination and
    /// `Error::PermissionDenied` if the child would inherit a key that is
    /// not loaded.
    pub fn check_create_encryption(&self, parent: DirId, params: &CryptoParams) -> Result<()> {
        let parent_encrypted = self.dirs.encryption(parent)?.is_encrypted();
        let has_key_params =
            params.salt.is_some() || params.keysource.is_some() || params.wrapping_key.is_some();

        let rejected = match params.crypt {
            CryptSetting::Off if parent_encrypted => {
                Some("an encrypted parent cannot have an unencrypted child")
            }
            CryptSetting::Off if has_key_params => {
                Some("key parameters given for an unencrypted dataset")
            }
            CryptSetting::Inherit if !parent_encrypted && has_key_params => {
                Some("key parameters given for a dataset inheriting no encryption")
            }
            CryptSetting::On | CryptSetting::Explicit(_)
                if !parent_encrypted && params.keysource.is_none() =>
            {
                Some("a new encryption root requires a keysource")
            }
            _ if params.cmd.is_some() => Some("dataset creation does not accept a key command"),
            _ => None,
        };
        if let Some(reason) = rejected {
            return Err(Error::InvalidParams(reason.into()));
        }

        self.check_parent_key(parent, parent_encrypted, params)
    }

    /// Validates the crypto parameters of a clone of `origin` under
    /// `parent`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` for a forbidden combination and
    /// `Error::PermissionDenied` if the clone would inherit a key that is
    /// not loaded.
    pub fn check_clone_encryption(
        &self,
        parent: DirId,
        origin: DirId,
        params: &CryptoParams,
    ) -> Result<()> {
        let parent_encrypted = self.dirs.encryption(parent)?.is_encrypted();
        let origin_encrypted = self.dirs.encryption(origin)?.is_encrypted();

        if params.crypt != CryptSetting::Inherit {
            return Err(Error::InvalidParams(
                "a clone inherits its origin's encryption".into(),
            ));
        }
        if parent_encrypted && !origin_encrypted {
            return Err(Error::InvalidParams(
                "an encrypted parent cannot hold a clone of an unencrypted origin".into(),
            ));
        }
        if params.cmd.is_some_and(|cmd| cmd != CryptoCmd::AddKey) {
            return Err(Error::InvalidParams(
                "a clone only accepts the add-key command".into(),
            ));
        }

        self.check_parent_key(parent, parent_encrypted, params)
    }

    fn check_parent_key(
        &self,
        parent: DirId,
        parent_encrypted: bool,
        params: &CryptoParams,
    ) -> Result<()> {
        if params.wrapping_key.is_none() && parent_encrypted {
            self.resolve_wrapping_key(parent).map_err(|_| Error::PermissionDenied(parent))?;
        }
        Ok(())
    }
}

impl<S, D> fmt::Debug for Keystore<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("config", &self.config)
            .field("wrapping_keys", &self.wrapping_keys)
            .field("keychains", &self.keychains)
            .finish_non_exhaustive()
    }
}
