//! Wrapping and unwrapping of key material under a wrapping key.
//!
//! A wrapped buffer is `ciphertext || tag` zero padded to
//! [`WRAPPED_KEY_LEN`]. The tag check on unwrap is the only proof that a
//! supplied wrapping key is the right one.

use zeroize::Zeroizing;

use crate::algorithm::{Algorithm, DEDUP_KEY_LEN};
use crate::crypt::{random_nonce, MAC_LEN, NONCE_LEN};
use crate::error::{Error, Result};
use crate::key::{KeyEntry, WrappingKey};
use crate::phys::{WrappedKeyPhys, WRAPPED_KEY_LEN};

/// Which buffer of a generation is being wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The data-encryption key of the given algorithm
    Data(Algorithm),
    /// The dedup HMAC key
    Dedup,
}

impl KeyKind {
    /// Plaintext length of this kind of key.
    #[must_use]
    pub const fn plain_len(self) -> usize {
        match self {
            Self::Data(alg) => alg.key_len(),
            Self::Dedup => DEDUP_KEY_LEN,
        }
    }
}

/// Wraps `plain_key` under `wkey` with `nonce`.
///
/// # Errors
///
/// Returns `Error::CryptoFailure` if `plain_key` does not match `kind` or
/// the cipher fails.
pub fn wrap(
    wkey: &WrappingKey,
    kind: KeyKind,
    plain_key: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> Result<[u8; WRAPPED_KEY_LEN]> {
    if plain_key.len() != kind.plain_len() {
        return Err(Error::CryptoFailure(format!(
            "{kind:?} key is {} bytes, expected {}",
            plain_key.len(),
            kind.plain_len()
        )));
    }

    let sealed = wkey.cipher().seal(nonce, plain_key, &[])?;
    let mut out = [0u8; WRAPPED_KEY_LEN];
    out[..sealed.len()].copy_from_slice(&sealed);
    Ok(out)
}

/// Unwraps a buffer produced by [`wrap`].
///
/// # Errors
///
/// Returns `Error::InvalidKey` if the tag does not verify, which is what a
/// wrong wrapping key looks like.
pub fn unwrap(
    wkey: &WrappingKey,
    kind: KeyKind,
    wrapped: &[u8; WRAPPED_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<Zeroizing<Vec<u8>>> {
    let sealed = &wrapped[..kind.plain_len() + MAC_LEN];
    wkey.cipher().open(nonce, sealed, &[]).map_err(|_| Error::InvalidKey)
}

/// Wraps both keys of `entry` under fresh nonces.
///
/// # Errors
///
/// Returns `Error::EntropyFailure` if no nonce can be drawn and propagates
/// [`wrap`] failures.
pub fn wrap_entry(wkey: &WrappingKey, entry: &KeyEntry) -> Result<WrappedKeyPhys> {
    let iv = random_nonce()?;
    let dd_iv = random_nonce()?;
    let keybuf = wrap(wkey, KeyKind::Data(entry.algorithm()), entry.key(), &iv)?;
    let dd_keybuf = wrap(wkey, KeyKind::Dedup, entry.dedup_key(), &dd_iv)?;

    Ok(WrappedKeyPhys {
        crypt_alg: entry.algorithm().id(),
        iv,
        padding: [0; 3],
        keybuf,
        dd_iv,
        padding2: [0; 3],
        dd_keybuf,
    })
}

/// Unwraps a persisted record into the generation introduced at `txg`.
///
/// # Errors
///
/// Returns `Error::CorruptKeychain` for an unknown algorithm and
/// `Error::InvalidKey` if either buffer fails authentication.
pub fn unwrap_entry(wkey: &WrappingKey, txg: u64, phys: &WrappedKeyPhys) -> Result<KeyEntry> {
    let algorithm = Algorithm::from_id(phys.crypt_alg).ok_or_else(|| {
        Error::CorruptKeychain(format!("unknown algorithm {} at txg {txg}", phys.crypt_alg))
    })?;
    let key = unwrap(wkey, KeyKind::Data(algorithm), &phys.keybuf, &phys.iv)?;
    let dedup_key = unwrap(wkey, KeyKind::Dedup, &phys.dd_keybuf, &phys.dd_iv)?;
    KeyEntry::from_parts(algorithm, txg, &key, &dedup_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wkey(byte: u8) -> WrappingKey {
        WrappingKey::from_bytes(&[byte; 32]).unwrap()
    }

    fn any_algorithm() -> impl Strategy<Value = Algorithm> {
        prop::sample::select(Algorithm::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_unwrap_inverts_wrap(
            alg in any_algorithm(),
            wbytes in prop::array::uniform32(any::<u8>()),
            key in prop::collection::vec(any::<u8>(), 32),
            nonce in prop::array::uniform13(any::<u8>()),
        ) {
            let wkey = WrappingKey::from_bytes(&wbytes).unwrap();
            let plain = &key[..alg.key_len()];
            let wrapped = wrap(&wkey, KeyKind::Data(alg), plain, &nonce).unwrap();
            let unwrapped = unwrap(&wkey, KeyKind::Data(alg), &wrapped, &nonce).unwrap();
            prop_assert_eq!(&unwrapped[..], plain);
        }

        #[test]
        fn prop_wrong_key_is_rejected(
            alg in any_algorithm(),
            right in prop::array::uniform32(any::<u8>()),
            wrong in prop::array::uniform32(any::<u8>()),
            nonce in prop::array::uniform13(any::<u8>()),
        ) {
            prop_assume!(right != wrong);
            let plain = vec![0x5A; alg.key_len()];
            let right = WrappingKey::from_bytes(&right).unwrap();
            let wrong = WrappingKey::from_bytes(&wrong).unwrap();
            let wrapped = wrap(&right, KeyKind::Data(alg), &plain, &nonce).unwrap();
            let result = unwrap(&wrong, KeyKind::Data(alg), &wrapped, &nonce);
            prop_assert!(matches!(result, Err(Error::InvalidKey)));
        }
    }

    #[test]
    fn test_short_keys_are_zero_padded() {
        let kind = KeyKind::Data(Algorithm::Aes128Gcm);
        let wrapped = wrap(&wkey(1), kind, &[9; 16], &[0; 13]).unwrap();
        assert!(wrapped[16 + MAC_LEN..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let kind = KeyKind::Data(Algorithm::Aes256Gcm);
        let result = wrap(&wkey(1), kind, &[9; 16], &[0; 13]);
        assert!(matches!(result, Err(Error::CryptoFailure(_))));
    }

    #[test]
    fn test_wrong_nonce_fails_authentication() {
        let kind = KeyKind::Dedup;
        let wrapped = wrap(&wkey(1), kind, &[3; 32], &[0; 13]).unwrap();
        assert!(matches!(
            unwrap(&wkey(1), kind, &wrapped, &[1; 13]),
            Err(Error::InvalidKey)
        ));
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = KeyEntry::generate(Algorithm::Aes192Gcm, 12).unwrap();
        let phys = wrap_entry(&wkey(2), &entry).unwrap();
        assert_eq!(phys.crypt_alg, Algorithm::Aes192Gcm.id());
        assert_ne!(phys.iv, phys.dd_iv);

        let back = unwrap_entry(&wkey(2), 12, &phys).unwrap();
        assert_eq!(back.key(), entry.key());
        assert_eq!(back.dedup_key(), entry.dedup_key());
        assert_eq!(back.txg(), 12);
    }

    #[test]
    fn test_entry_unknown_algorithm_is_corrupt() {
        let entry = KeyEntry::generate(Algorithm::Aes256Gcm, 1).unwrap();
        let mut phys = wrap_entry(&wkey(2), &entry).unwrap();
        phys.crypt_alg = 42;
        assert!(matches!(
            unwrap_entry(&wkey(2), 1, &phys),
            Err(Error::CorruptKeychain(_))
        ));
    }

    #[test]
    fn test_entry_wrong_wrapping_key() {
        let entry = KeyEntry::generate(Algorithm::Aes256Gcm, 1).unwrap();
        let phys = wrap_entry(&wkey(2), &entry).unwrap();
        assert!(matches!(
            unwrap_entry(&wkey(3), 1, &phys),
            Err(Error::InvalidKey)
        ));
    }
}
