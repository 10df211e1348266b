//! Key material: wrapping keys and data-key generations.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, Secret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::algorithm::{Algorithm, DEDUP_KEY_LEN};
use crate::crypt::{fill_random, CipherContext, NONCE_LEN};
use crate::error::{Error, Result};
use crate::ids::DirId;

/// Wrapping key length in bytes. Only raw keys of this length are accepted.
pub const WRAPPING_KEY_LEN: usize = 32;

/// Algorithm used to wrap key generations under a wrapping key.
pub const WRAPPING_ALGORITHM: Algorithm = Algorithm::Aes256Gcm;

/// Administrator-supplied key that wraps a keychain's data keys.
///
/// The material is zeroed when the value is dropped.
pub struct WrappingKey {
    material: Secret<[u8; WRAPPING_KEY_LEN]>,
    cipher: CipherContext,
}

impl WrappingKey {
    /// Creates a wrapping key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParams` if `bytes` is not
    /// [`WRAPPING_KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let material: [u8; WRAPPING_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidParams(format!(
                "wrapping key must be {WRAPPING_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let cipher = CipherContext::new(WRAPPING_ALGORITHM, &material)?;
        Ok(Self {
            material: Secret::new(material),
            cipher,
        })
    }

    /// Exposes the raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8; WRAPPING_KEY_LEN] {
        self.material.expose_secret()
    }

    pub(crate) const fn cipher(&self) -> &CipherContext {
        &self.cipher
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey([REDACTED])")
    }
}

/// A counted hold on a wrapping key bound to its encryption root.
///
/// Cloning takes another hold; dropping releases it. The key is freed once
/// the registry and every holder have let go.
#[derive(Clone)]
pub struct WrappingKeyRef {
    dir: DirId,
    key: Arc<WrappingKey>,
}

impl WrappingKeyRef {
    /// Binds `key` to the directory that owns it.
    #[must_use]
    pub fn new(dir: DirId, key: WrappingKey) -> Self {
        Self {
            dir,
            key: Arc::new(key),
        }
    }

    /// Directory whose key-source property this key satisfies.
    #[must_use]
    pub const fn dir(&self) -> DirId {
        self.dir
    }

    /// The key itself.
    #[must_use]
    pub fn key(&self) -> &WrappingKey {
        &self.key
    }

    /// Returns true if both handles hold the same loaded key.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.key, &other.key)
    }

    /// Number of live handles, this one included.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.key)
    }
}

impl fmt::Debug for WrappingKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappingKeyRef").field("dir", &self.dir).finish_non_exhaustive()
    }
}

/// One generation of data-encryption key material.
///
/// Entries are immutable: rotation appends a new entry instead of changing
/// an existing one.
///
/// The key bytes are zeroed on drop. The keyed HMAC state is built once
/// and reset after every use; it holds key-derived pad blocks that the
/// `hmac` crate does not zero.
pub struct KeyEntry {
    algorithm: Algorithm,
    txg: u64,
    key: SecretVec<u8>,
    dedup_key: Secret<[u8; DEDUP_KEY_LEN]>,
    cipher: CipherContext,
    dedup_mac: Mutex<Hmac<Sha256>>,
}

impl KeyEntry {
    /// Creates a fresh generation from random bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::EntropyFailure` if the random source fails.
    pub fn generate(algorithm: Algorithm, txg: u64) -> Result<Self> {
        let mut key = Zeroizing::new(vec![0u8; algorithm.key_len()]);
        fill_random(&mut key[..])?;
        let mut dedup_key = Zeroizing::new([0u8; DEDUP_KEY_LEN]);
        fill_random(&mut dedup_key[..])?;
        Self::from_parts(algorithm, txg, &key[..], &dedup_key[..])
    }

    /// Rebuilds a generation from decrypted key bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoFailure` if either key has the wrong length.
    pub fn from_parts(
        algorithm: Algorithm,
        txg: u64,
        key: &[u8],
        dedup_key: &[u8],
    ) -> Result<Self> {
        let dedup_key: [u8; DEDUP_KEY_LEN] = dedup_key.try_into().map_err(|_| {
            Error::CryptoFailure(format!("dedup key must be {DEDUP_KEY_LEN} bytes"))
        })?;
        let cipher = CipherContext::new(algorithm, key)?;
        let dedup_mac = <Hmac<Sha256> as Mac>::new_from_slice(&dedup_key)
            .map_err(|e| Error::CryptoFailure(format!("dedup key rejected: {e}")))?;

        Ok(Self {
            algorithm,
            txg,
            key: SecretVec::new(key.to_vec()),
            dedup_key: Secret::new(dedup_key),
            cipher,
            dedup_mac: Mutex::new(dedup_mac),
        })
    }

    /// Algorithm of the data key.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Transaction group the generation was introduced in.
    #[must_use]
    pub const fn txg(&self) -> u64 {
        self.txg
    }

    /// Raw data key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.key.expose_secret()
    }

    /// Raw dedup HMAC key bytes.
    #[must_use]
    pub fn dedup_key(&self) -> &[u8; DEDUP_KEY_LEN] {
        self.dedup_key.expose_secret()
    }

    /// Encrypts a block with this generation's data key.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoFailure` if the primitive fails.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher.seal(nonce, plaintext, aad)
    }

    /// Decrypts a block sealed by [`KeyEntry::seal`].
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoFailure` if the block fails authentication.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        sealed: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.cipher.open(nonce, sealed, aad).map_err(|_| {
            Error::CryptoFailure(format!(
                "block authentication failed under txg {} key",
                self.txg
            ))
        })
    }

    /// HMAC-SHA256 of `data` under the dedup key.
    #[must_use]
    pub fn dedup_mac(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = self.dedup_mac.lock();
        mac.update(data);
        mac.finalize_reset().into_bytes().into()
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("algorithm", &self.algorithm)
            .field("txg", &self.txg)
            .finish_non_exhaustive()
    }
}
