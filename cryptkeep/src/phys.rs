//! On-disk layout of a wrapped key record.
//!
//! One record is stored per key generation, keyed by its txg. The layout is
//! fixed regardless of the algorithm's key length:
//!
//! ```text
//! offset  size  field
//!      0     8  crypt_alg   (u64, little-endian)
//!      8    13  iv          nonce for keybuf
//!     21     3  padding
//!     24    48  keybuf      wrapped data key + tag, zero padded
//!     72    13  dd_iv       nonce for dd_keybuf
//!     85     3  padding2
//!     88    48  dd_keybuf   wrapped dedup key + tag
//! ```

use crate::algorithm::MAX_KEY_LEN;
use crate::crypt::{MAC_LEN, NONCE_LEN};
use crate::error::{Error, Result};

/// Size of a wrapped key buffer (largest key plus tag).
pub const WRAPPED_KEY_LEN: usize = MAX_KEY_LEN + MAC_LEN;

/// Encoded size of a [`WrappedKeyPhys`].
pub const PHYS_LEN: usize = 8 + NONCE_LEN + 3 + WRAPPED_KEY_LEN + NONCE_LEN + 3 + WRAPPED_KEY_LEN;

const IV_OFF: usize = 8;
const PAD_OFF: usize = IV_OFF + NONCE_LEN;
const KEYBUF_OFF: usize = PAD_OFF + 3;
const DD_IV_OFF: usize = KEYBUF_OFF + WRAPPED_KEY_LEN;
const PAD2_OFF: usize = DD_IV_OFF + NONCE_LEN;
const DD_KEYBUF_OFF: usize = PAD2_OFF + 3;

/// A wrapped key generation as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyPhys {
    /// Algorithm identifier
    pub crypt_alg: u64,
    /// Nonce used to wrap `keybuf`
    pub iv: [u8; NONCE_LEN],
    /// Reserved, written as zero
    pub padding: [u8; 3],
    /// Wrapped data key
    pub keybuf: [u8; WRAPPED_KEY_LEN],
    /// Nonce used to wrap `dd_keybuf`
    pub dd_iv: [u8; NONCE_LEN],
    /// Reserved, written as zero
    pub padding2: [u8; 3],
    /// Wrapped dedup HMAC key
    pub dd_keybuf: [u8; WRAPPED_KEY_LEN],
}

impl WrappedKeyPhys {
    /// Serializes the record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PHYS_LEN] {
        let mut out = [0u8; PHYS_LEN];
        out[..IV_OFF].copy_from_slice(&self.crypt_alg.to_le_bytes());
        out[IV_OFF..PAD_OFF].copy_from_slice(&self.iv);
        out[PAD_OFF..KEYBUF_OFF].copy_from_slice(&self.padding);
        out[KEYBUF_OFF..DD_IV_OFF].copy_from_slice(&self.keybuf);
        out[DD_IV_OFF..PAD2_OFF].copy_from_slice(&self.dd_iv);
        out[PAD2_OFF..DD_KEYBUF_OFF].copy_from_slice(&self.padding2);
        out[DD_KEYBUF_OFF..].copy_from_slice(&self.dd_keybuf);
        out
    }

    /// Parses a record.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptKeychain` if `data` is not exactly
    /// [`PHYS_LEN`] bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != PHYS_LEN {
            return Err(Error::CorruptKeychain(format!(
                "wrapped key record is {} bytes, expected {PHYS_LEN}",
                data.len()
            )));
        }

        let mut alg = [0u8; 8];
        alg.copy_from_slice(&data[..IV_OFF]);

        let mut phys = Self {
            crypt_alg: u64::from_le_bytes(alg),
            iv: [0; NONCE_LEN],
            padding: [0; 3],
            keybuf: [0; WRAPPED_KEY_LEN],
            dd_iv: [0; NONCE_LEN],
            padding2: [0; 3],
            dd_keybuf: [0; WRAPPED_KEY_LEN],
        };
        phys.iv.copy_from_slice(&data[IV_OFF..PAD_OFF]);
        phys.padding.copy_from_slice(&data[PAD_OFF..KEYBUF_OFF]);
        phys.keybuf.copy_from_slice(&data[KEYBUF_OFF..DD_IV_OFF]);
        phys.dd_iv.copy_from_slice(&data[DD_IV_OFF..PAD2_OFF]);
        phys.padding2.copy_from_slice(&data[PAD2_OFF..DD_KEYBUF_OFF]);
        phys.dd_keybuf.copy_from_slice(&data[DD_KEYBUF_OFF..]);
        Ok(phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WrappedKeyPhys {
        WrappedKeyPhys {
            crypt_alg: 3,
            iv: [0x11; NONCE_LEN],
            padding: [0; 3],
            keybuf: [0x22; WRAPPED_KEY_LEN],
            dd_iv: [0x33; NONCE_LEN],
            padding2: [0; 3],
            dd_keybuf: [0x44; WRAPPED_KEY_LEN],
        }
    }

    #[test]
    fn test_record_size() {
        assert_eq!(WRAPPED_KEY_LEN, 48);
        assert_eq!(PHYS_LEN, 136);
    }

    #[test]
    fn test_field_offsets() {
        let bytes = sample().to_bytes();

        assert_eq!(hex::encode(&bytes[..8]), "0300000000000000");
        assert_eq!(hex::encode(&bytes[8..21]), "11".repeat(13));
        assert_eq!(hex::encode(&bytes[21..24]), "000000");
        assert_eq!(hex::encode(&bytes[24..72]), "22".repeat(48));
        assert_eq!(hex::encode(&bytes[72..85]), "33".repeat(13));
        assert_eq!(hex::encode(&bytes[85..88]), "000000");
        assert_eq!(hex::encode(&bytes[88..]), "44".repeat(48));
    }

    #[test]
    fn test_padding_is_preserved() {
        let mut phys = sample();
        phys.padding = [1, 2, 3];
        let parsed = WrappedKeyPhys::from_bytes(&phys.to_bytes()).unwrap();
        assert_eq!(parsed, phys);
    }

    #[test]
    fn test_wrong_length_is_corrupt() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            WrappedKeyPhys::from_bytes(&bytes[..PHYS_LEN - 1]),
            Err(Error::CorruptKeychain(_))
        ));
        assert!(matches!(
            WrappedKeyPhys::from_bytes(&[]),
            Err(Error::CorruptKeychain(_))
        ));
    }
}
