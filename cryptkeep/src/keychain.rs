//! Per-directory key history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::algorithm::Algorithm;
use crate::error::{Error, Result};
use crate::ids::{DirId, ObjectId};
use crate::key::{KeyEntry, WrappingKey, WrappingKeyRef};
use crate::phys::WrappedKeyPhys;
use crate::store::ObjectStore;
use crate::txg::TxContext;
use crate::wrap::{unwrap_entry, wrap_entry};

/// Wraps `entry` under `wkey` and writes it into `obj`, keyed by its txg.
///
/// # Errors
///
/// Returns `Error::EntropyFailure` if no nonce can be drawn and
/// `Error::Store` if the write fails.
pub fn persist_entry<S: ObjectStore + ?Sized>(
    store: &S,
    entry: &KeyEntry,
    wkey: &WrappingKey,
    obj: ObjectId,
    tx: &TxContext,
) -> Result<()> {
    let phys = wrap_entry(wkey, entry)?;
    store.put(obj, entry.txg(), &phys.to_bytes(), tx)?;
    Ok(())
}

struct KeychainState {
    entries: Vec<Arc<KeyEntry>>,
    wrapping_key: WrappingKeyRef,
}

/// Decrypted key generations of one encrypted directory, ordered by txg.
///
/// The list is never empty and every entry shares one algorithm. Lookups
/// take the state lock shared; appends and rewraps take it exclusive, so a
/// reader never sees a half-updated list.
pub struct Keychain {
    obj: ObjectId,
    algorithm: Algorithm,
    state: RwLock<KeychainState>,
    holds: AtomicUsize,
}

impl Keychain {
    /// Reads and unwraps every generation stored in `obj`.
    ///
    /// # Errors
    ///
    /// - `Error::CorruptKeychain` if the object is empty, a record is
    ///   malformed, or the records disagree on the algorithm
    /// - `Error::InvalidKey` if `wrapping_key` does not authenticate
    /// - `Error::Store` if the store cannot be read
    pub fn open<S: ObjectStore + ?Sized>(
        store: &S,
        wrapping_key: WrappingKeyRef,
        obj: ObjectId,
    ) -> Result<Self> {
        let mut records = store
            .iterate(obj)?
            .into_iter()
            .map(|(txg, bytes)| {
                WrappedKeyPhys::from_bytes(&bytes).map(|phys| (txg, phys))
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_unstable_by_key(|(txg, _)| *txg);

        let Some(first) = records.first() else {
            return Err(Error::CorruptKeychain(format!(
                "keychain {obj} has no entries"
            )));
        };
        let crypt_alg = first.1.crypt_alg;
        if let Some((txg, _)) = records.iter().find(|(_, phys)| phys.crypt_alg != crypt_alg) {
            return Err(Error::CorruptKeychain(format!(
                "keychain {obj} entry at txg {txg} does not use algorithm {crypt_alg}"
            )));
        }

        let entries = records
            .iter()
            .map(|(txg, phys)| {
                unwrap_entry(wrapping_key.key(), *txg, phys).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let algorithm = entries[0].algorithm();

        debug!(
            kcobj = %obj,
            dir = %wrapping_key.dir(),
            entries = entries.len(),
            "opened keychain"
        );
        Ok(Self {
            obj,
            algorithm,
            state: RwLock::new(KeychainState {
                entries,
                wrapping_key,
            }),
            holds: AtomicUsize::new(0),
        })
    }

    /// Store object backing this keychain.
    #[must_use]
    pub const fn obj(&self) -> ObjectId {
        self.obj
    }

    /// Algorithm shared by every entry.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Wrapping key the entries are currently wrapped under.
    #[must_use]
    pub fn wrapping_key(&self) -> WrappingKeyRef {
        self.state.read().wrapping_key.clone()
    }

    /// Encryption root whose wrapping key protects this keychain.
    #[must_use]
    pub fn wrapping_key_dir(&self) -> DirId {
        self.state.read().wrapping_key.dir()
    }

    /// Snapshot of every entry in ascending txg order.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<KeyEntry>> {
        self.state.read().entries.clone()
    }

    /// Newest generation, the one new writes use.
    #[must_use]
    pub fn latest(&self) -> Arc<KeyEntry> {
        let state = self.state.read();
        Arc::clone(&state.entries[state.entries.len() - 1])
    }

    /// Generation that was current when `txg` was written: the entry with
    /// the greatest txg not after it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoKeyForEpoch` if `txg` predates every entry.
    pub fn key_for_txg(&self, txg: u64) -> Result<Arc<KeyEntry>> {
        let state = self.state.read();
        let idx = state.entries.partition_point(|entry| entry.txg() <= txg);
        if idx == 0 {
            return Err(Error::NoKeyForEpoch { txg });
        }
        Ok(Arc::clone(&state.entries[idx - 1]))
    }

    /// Creates, persists and appends a new generation at `tx`'s txg.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` if the keychain already has an entry at
    /// or after this txg, and propagates entropy and store failures.
    pub fn add_generation<S: ObjectStore + ?Sized>(&self, store: &S, tx: &TxContext) -> Result<()> {
        let mut state = self.state.write();
        let txg = tx.txg();
        if state.entries.last().is_some_and(|last| last.txg() >= txg) {
            return Err(Error::InvalidParams(format!(
                "keychain {} already has an entry at or after txg {txg}",
                self.obj
            )));
        }

        let entry = KeyEntry::generate(self.algorithm, txg)?;
        persist_entry(store, &entry, state.wrapping_key.key(), self.obj, tx)?;
        state.entries.push(Arc::new(entry));
        debug!(kcobj = %self.obj, txg, "appended key generation");
        Ok(())
    }

    /// Rewrites every entry under `new_key` and switches to it.
    ///
    /// # Errors
    ///
    /// Propagates entropy and store failures.
    pub fn rewrap<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
        new_key: WrappingKeyRef,
        tx: &TxContext,
    ) -> Result<()> {
        let mut state = self.state.write();
        for entry in &state.entries {
            persist_entry(store, entry, new_key.key(), self.obj, tx)?;
        }
        debug!(
            kcobj = %self.obj,
            dir = %new_key.dir(),
            entries = state.entries.len(),
            "rewrapped keychain"
        );
        state.wrapping_key = new_key;
        Ok(())
    }

    /// Number of outstanding registry holds.
    #[must_use]
    pub fn holds(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    pub(crate) fn take_hold(&self) {
        self.holds.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops a hold unless it is the last one. Returns false when the caller
    /// must drop the last hold under the registry lock instead.
    pub(crate) fn release_shared_hold(&self) -> bool {
        let mut current = self.holds.load(Ordering::SeqCst);
        while current > 1 {
            match self.holds.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Drops a hold, returning the remaining count.
    pub(crate) fn release_hold(&self) -> usize {
        self.holds.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("obj", &self.obj)
            .field("algorithm", &self.algorithm)
            .field("holds", &self.holds())
            .finish_non_exhaustive()
    }
}
