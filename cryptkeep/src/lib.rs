//! # `cryptkeep`
//!
//! Per-pool keystore for encrypted dataset hierarchies.
//!
//! Every encrypted directory owns a keychain: the history of its
//! data-encryption keys, one generation per key rotation, each wrapped under
//! the administrator's wrapping key. The keystore loads wrapping keys, opens
//! keychains on demand, binds open datasets to them and runs the
//! transactional operations that change key state.
//!
//! ## Features
//!
//! - AES-GCM and AES-CCM data keys (128, 192 and 256 bit) with
//!   per-generation dedup keys
//! - Key history lookup by transaction group
//! - Key rotation (add-key) and recursive wrapping-key replacement (rewrap)
//! - Reference-counted registries safe for concurrent use
//! - Pluggable object store and directory tree
//!
//! ## Example
//!
//! ```rust,ignore
//! use cryptkeep::prelude::*;
//!
//! let keystore = Keystore::new(store, dirs, engine, KeystoreConfig::default());
//! keystore.load_wrapping_key(root, CryptoParams::with_wrapping_key(key))?;
//! keystore.create_keychain_record(dataset, dir)?;
//!
//! let entry = keystore.lookup_key_for_read(dataset, block_txg)?;
//! let plaintext = entry.open(&nonce, &sealed, &aad)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod algorithm;
pub mod config;
pub mod crypt;
pub mod error;
pub mod hierarchy;
pub mod ids;
pub mod key;
pub mod keychain;
pub mod keystore;
pub mod ops;
pub mod params;
pub mod phys;
pub mod registry;
pub mod store;
pub mod txg;
pub mod wrap;

pub use keystore::{KeyStatus, Keystore};

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::algorithm::{Algorithm, CryptSetting};
    pub use crate::config::KeystoreConfig;
    pub use crate::error::{Error, Result, StoreError};
    pub use crate::hierarchy::{DirTree, MemDirTree};
    pub use crate::ids::{DatasetId, DirId, ObjectId};
    pub use crate::key::{KeyEntry, WrappingKey};
    pub use crate::keystore::{KeyStatus, Keystore};
    pub use crate::params::{CryptoCmd, CryptoParams};
    pub use crate::store::{Feature, MemStore, ObjectStore};
    pub use crate::txg::{SpaceCheck, SyncTask, TxContext, TxgEngine};
}
