//! Error types for keystore operations.

use std::fmt;

use crate::ids::{DatasetId, DirId, ObjectId};

/// Main error type for keystore operations.
///
/// The `Display` text of each variant is the message an administrative
/// front end shows the user; the core never formats anything else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// MAC verification failed while unwrapping: the wrapping key is wrong
    #[error("incorrect key provided")]
    InvalidKey,

    /// On-disk key history is malformed, empty or mixes algorithms
    #[error("keychain is corrupt: {0}")]
    CorruptKeychain(String),

    /// No wrapping key is loaded for the directory
    #[error("no key loaded for directory {0}")]
    NoKeyLoaded(DirId),

    /// The operation needs a wrapping key that is not loaded
    #[error("permission denied: key for directory {0} is not loaded")]
    PermissionDenied(DirId),

    /// A wrapping key is already loaded for the directory
    #[error("key already loaded for directory {0}")]
    AlreadyLoaded(DirId),

    /// No wrapping key is loaded for the directory
    #[error("key not loaded for directory {0}")]
    NotLoaded(DirId),

    /// The dataset already has a keychain record
    #[error("dataset {0} already has a keychain record")]
    AlreadyBound(DatasetId),

    /// The dataset has no keychain record
    #[error("dataset {0} has no keychain record")]
    NotBound(DatasetId),

    /// A resource cannot be removed while holds remain
    #[error("dataset is busy: {0}")]
    InUse(String),

    /// The random source could not supply bytes
    #[error("failed to gather entropy")]
    EntropyFailure,

    /// Persistent store failure
    #[error("I/O failure: {0}")]
    Store(#[from] StoreError),

    /// Cipher failure other than an authentication mismatch
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// No key generation covers the requested transaction group
    #[error("no key for txg {txg}")]
    NoKeyForEpoch {
        /// The transaction group that was looked up
        txg: u64,
    },

    /// The directory does not exist
    #[error("directory {0} does not exist")]
    NoSuchDirectory(DirId),

    /// The directory does not own a keychain object
    #[error("directory {0} is not encrypted")]
    NoKeychain(DirId),

    /// Crypto parameters conflict with the requested operation
    #[error("invalid crypto parameters: {0}")]
    InvalidParams(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by persistent store implementations.
#[derive(Debug)]
pub enum StoreError {
    /// The object does not exist
    NoSuchObject(ObjectId),

    /// The key does not exist in the object
    NoSuchKey {
        /// Object that was searched
        obj: ObjectId,
        /// Missing key
        key: u64,
    },

    /// The backing medium returned malformed data
    Corrupt(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchObject(obj) => write!(f, "no such object: {obj}"),
            Self::NoSuchKey { obj, key } => write!(f, "no key {key} in object {obj}"),
            Self::Corrupt(msg) => write!(f, "corrupt store data: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
