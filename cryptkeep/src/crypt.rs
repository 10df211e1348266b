//! Prepared authenticated-cipher contexts.
//!
//! Every cipher here runs AES in Galois/Counter or CCM mode with a 13-byte
//! nonce and a 16-byte tag, the geometry the wrapped-key record reserves
//! space for. A 13-byte CCM nonce leaves a 2-byte length field, so CCM
//! contexts seal at most [`CCM_MAX_MSG_LEN`] bytes per call.

use std::fmt;

use aes_gcm::aead::consts::{U13, U16};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{AesGcm, Nonce};
use ccm::Ccm;
use zeroize::Zeroizing;

use crate::algorithm::Algorithm;
use crate::error::{Error, Result};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 13;

/// Authentication tag length in bytes.
pub const MAC_LEN: usize = 16;

type Aes128Gcm13 = AesGcm<Aes128, U13>;
type Aes192Gcm13 = AesGcm<Aes192, U13>;
type Aes256Gcm13 = AesGcm<Aes256, U13>;
type Aes128Ccm13 = Ccm<Aes128, U16, U13>;
type Aes192Ccm13 = Ccm<Aes192, U16, U13>;
type Aes256Ccm13 = Ccm<Aes256, U16, U13>;

/// Largest message a CCM context accepts, in bytes.
pub const CCM_MAX_MSG_LEN: usize = u16::MAX as usize;

/// A keyed AEAD instance, built once per key and reused for every call.
pub enum CipherContext {
    /// AES-128-GCM
    Aes128Gcm(Aes128Gcm13),
    /// AES-192-GCM
    Aes192Gcm(Aes192Gcm13),
    /// AES-256-GCM
    Aes256Gcm(Aes256Gcm13),
    /// AES-128-CCM
    Aes128Ccm(Aes128Ccm13),
    /// AES-192-CCM
    Aes192Ccm(Aes192Ccm13),
    /// AES-256-CCM
    Aes256Ccm(Aes256Ccm13),
}

macro_rules! with_cipher {
    ($ctx:expr, $cipher:ident => $body:expr) => {
        match $ctx {
            CipherContext::Aes128Gcm($cipher) => $body,
            CipherContext::Aes192Gcm($cipher) => $body,
            CipherContext::Aes256Gcm($cipher) => $body,
            CipherContext::Aes128Ccm($cipher) => $body,
            CipherContext::Aes192Ccm($cipher) => $body,
            CipherContext::Aes256Ccm($cipher) => $body,
        }
    };
}

impl CipherContext {
    /// Keys a cipher for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoFailure` if `key` has the wrong length.
    pub fn new(algorithm: Algorithm, key: &[u8]) -> Result<Self> {
        let ctx = match algorithm {
            Algorithm::Aes128Gcm => Aes128Gcm13::new_from_slice(key).map(Self::Aes128Gcm),
            Algorithm::Aes192Gcm => Aes192Gcm13::new_from_slice(key).map(Self::Aes192Gcm),
            Algorithm::Aes256Gcm => Aes256Gcm13::new_from_slice(key).map(Self::Aes256Gcm),
            Algorithm::Aes128Ccm => Aes128Ccm13::new_from_slice(key).map(Self::Aes128Ccm),
            Algorithm::Aes192Ccm => Aes192Ccm13::new_from_slice(key).map(Self::Aes192Ccm),
            Algorithm::Aes256Ccm => Aes256Ccm13::new_from_slice(key).map(Self::Aes256Ccm),
        };
        ctx.map_err(|_| {
            Error::CryptoFailure(format!("{} byte key is invalid for {algorithm}", key.len()))
        })
    }

    /// Returns the algorithm this context was keyed for.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        match self {
            Self::Aes128Gcm(_) => Algorithm::Aes128Gcm,
            Self::Aes192Gcm(_) => Algorithm::Aes192Gcm,
            Self::Aes256Gcm(_) => Algorithm::Aes256Gcm,
            Self::Aes128Ccm(_) => Algorithm::Aes128Ccm,
            Self::Aes192Ccm(_) => Algorithm::Aes192Ccm,
            Self::Aes256Ccm(_) => Algorithm::Aes256Ccm,
        }
    }

    /// Encrypts `plaintext`, returning `ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoFailure` if the primitive rejects the input,
    /// which for CCM includes messages over [`CCM_MAX_MSG_LEN`].
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::<U13>::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        with_cipher!(self, cipher => cipher.encrypt(nonce, payload)).map_err(|e| {
            Error::CryptoFailure(format!("{} encryption failed: {e}", self.algorithm()))
        })
    }

    /// Decrypts `ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns `aes_gcm::Error` when the tag does not verify.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        sealed: &[u8],
        aad: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, aes_gcm::Error> {
        let nonce = Nonce::<U13>::from_slice(nonce);
        let payload = Payload { msg: sealed, aad };
        with_cipher!(self, cipher => cipher.decrypt(nonce, payload)).map(Zeroizing::new)
    }
}

/// Fills `buf` from the operating system's random source.
///
/// # Errors
///
/// Returns `Error::EntropyFailure` if the source is unavailable.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::EntropyFailure)
}

/// Draws a fresh nonce.
///
/// # Errors
///
/// Returns `Error::EntropyFailure` if the source is unavailable.
pub fn random_nonce() -> Result<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CipherContext").field(&self.algorithm()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_each_algorithm() {
        for alg in Algorithm::ALL {
            let key = vec![7u8; alg.key_len()];
            let ctx = CipherContext::new(alg, &key).unwrap();
            let nonce = [3u8; NONCE_LEN];

            let sealed = ctx.seal(&nonce, b"block contents", b"bookmark").unwrap();
            assert_eq!(sealed.len(), b"block contents".len() + MAC_LEN);

            let opened = ctx.open(&nonce, &sealed, b"bookmark").unwrap();
            assert_eq!(&opened[..], b"block contents");
        }
    }

    #[test]
    fn test_modes_do_not_interoperate() {
        let key = [5u8; 32];
        let nonce = [9u8; NONCE_LEN];
        let gcm = CipherContext::new(Algorithm::Aes256Gcm, &key).unwrap();
        let ccm = CipherContext::new(Algorithm::Aes256Ccm, &key).unwrap();

        let sealed = gcm.seal(&nonce, b"payload", b"").unwrap();
        assert!(ccm.open(&nonce, &sealed, b"").is_err());
        assert_eq!(ccm.algorithm(), Algorithm::Aes256Ccm);
    }

    #[test]
    fn test_ccm_message_limit() {
        let ctx = CipherContext::new(Algorithm::Aes128Ccm, &[4u8; 16]).unwrap();
        let nonce = [0u8; NONCE_LEN];
        assert!(ctx.seal(&nonce, &vec![0u8; CCM_MAX_MSG_LEN], b"").is_ok());
        let result = ctx.seal(&nonce, &vec![0u8; CCM_MAX_MSG_LEN + 1], b"");
        assert!(matches!(result, Err(Error::CryptoFailure(_))));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        for alg in [Algorithm::Aes256Gcm, Algorithm::Aes256Ccm] {
            let result = CipherContext::new(alg, &[0u8; 16]);
            assert!(matches!(result, Err(Error::CryptoFailure(_))));
        }
    }

    #[test]
    fn test_tampered_aad_fails() {
        let ctx = CipherContext::new(Algorithm::Aes128Gcm, &[1u8; 16]).unwrap();
        let nonce = [0u8; NONCE_LEN];
        let sealed = ctx.seal(&nonce, b"data", b"a").unwrap();
        assert!(ctx.open(&nonce, &sealed, b"b").is_err());
    }
}
