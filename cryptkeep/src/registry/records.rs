use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use super::KeychainRef;
use crate::error::{Error, Result};
use crate::ids::DatasetId;

/// Keychain bindings of open datasets, consulted by the I/O path.
#[derive(Debug, Default)]
pub struct KeychainRecordRegistry {
    records: RwLock<BTreeMap<DatasetId, KeychainRef>>,
}

impl KeychainRecordRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `dataset` to `keychain`, taking over the hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyBound` if `dataset` already has a record; the
    /// hold is released in that case.
    pub fn bind(&self, dataset: DatasetId, keychain: KeychainRef) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&dataset) {
            drop(records);
            return Err(Error::AlreadyBound(dataset));
        }
        debug!(dataset = %dataset, kcobj = %keychain.obj(), "bound keychain record");
        records.insert(dataset, keychain);
        Ok(())
    }

    /// Removes the record of `dataset` and releases its hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotBound` if `dataset` has no record.
    pub fn unbind(&self, dataset: DatasetId) -> Result<()> {
        let removed = self.records.write().remove(&dataset);
        let keychain = removed.ok_or(Error::NotBound(dataset))?;
        debug!(dataset = %dataset, kcobj = %keychain.obj(), "removed keychain record");
        drop(keychain);
        Ok(())
    }

    /// Takes another hold on the keychain bound to `dataset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotBound` if `dataset` has no record.
    pub fn lookup(&self, dataset: DatasetId) -> Result<KeychainRef> {
        self.records.read().get(&dataset).cloned().ok_or(Error::NotBound(dataset))
    }

    /// Returns true if `dataset` has a record.
    #[must_use]
    pub fn is_bound(&self, dataset: DatasetId) -> bool {
        self.records.read().contains_key(&dataset)
    }
}
