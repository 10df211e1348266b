//! Table of supported data-encryption algorithms.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest data key any algorithm uses, in bytes.
pub const MAX_KEY_LEN: usize = 32;

/// Length of every dedup HMAC-SHA256 key, in bytes.
pub const DEDUP_KEY_LEN: usize = 32;

/// Data-encryption algorithm of a keychain.
///
/// The discriminant is the identifier written to disk and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum Algorithm {
    /// AES-128 in Galois/Counter mode
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm = 1,
    /// AES-192 in Galois/Counter mode
    #[serde(rename = "aes-192-gcm")]
    Aes192Gcm = 2,
    /// AES-256 in Galois/Counter mode
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm = 3,
    /// AES-128 in Counter with CBC-MAC mode
    #[serde(rename = "aes-128-ccm")]
    Aes128Ccm = 4,
    /// AES-192 in Counter with CBC-MAC mode
    #[serde(rename = "aes-192-ccm")]
    Aes192Ccm = 5,
    /// AES-256 in Counter with CBC-MAC mode
    #[serde(rename = "aes-256-ccm")]
    Aes256Ccm = 6,
}

/// Block cipher mode of an [`Algorithm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Galois/Counter mode
    Gcm,
    /// Counter with CBC-MAC
    Ccm,
}

impl Algorithm {
    /// Every known algorithm, in identifier order.
    pub const ALL: [Self; 6] = [
        Self::Aes128Gcm,
        Self::Aes192Gcm,
        Self::Aes256Gcm,
        Self::Aes128Ccm,
        Self::Aes192Ccm,
        Self::Aes256Ccm,
    ];

    /// Looks up an on-disk identifier.
    #[must_use]
    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.id() == id)
    }

    /// Returns the on-disk identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self as u64
    }

    /// Returns the data key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes128Ccm => 16,
            Self::Aes192Gcm | Self::Aes192Ccm => 24,
            Self::Aes256Gcm | Self::Aes256Ccm => 32,
        }
    }

    /// Returns the cipher mode.
    #[must_use]
    pub const fn mode(self) -> CipherMode {
        match self {
            Self::Aes128Gcm | Self::Aes192Gcm | Self::Aes256Gcm => CipherMode::Gcm,
            Self::Aes128Ccm | Self::Aes192Ccm | Self::Aes256Ccm => CipherMode::Ccm,
        }
    }

    /// Returns the human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Aes128Ccm => "aes-128-ccm",
            Self::Aes192Ccm => "aes-192-ccm",
            Self::Aes256Ccm => "aes-256-ccm",
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Aes256Gcm
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a dataset's encryption property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptSetting {
    /// Take the parent's setting
    #[default]
    Inherit,
    /// Not encrypted
    Off,
    /// Encrypted with the pool's default algorithm
    On,
    /// Encrypted with a specific algorithm
    Explicit(Algorithm),
}

impl CryptSetting {
    /// Returns true unless the setting is `Off`.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Resolves `On` to `default`; `Inherit` and `Off` have no algorithm.
    #[must_use]
    pub const fn algorithm(self, default: Algorithm) -> Option<Algorithm> {
        match self {
            Self::On => Some(default),
            Self::Explicit(alg) => Some(alg),
            Self::Inherit | Self::Off => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable() {
        assert_eq!(Algorithm::Aes128Gcm.id(), 1);
        assert_eq!(Algorithm::Aes192Gcm.id(), 2);
        assert_eq!(Algorithm::Aes256Gcm.id(), 3);
        assert_eq!(Algorithm::Aes128Ccm.id(), 4);
        assert_eq!(Algorithm::Aes192Ccm.id(), 5);
        assert_eq!(Algorithm::Aes256Ccm.id(), 6);
        for alg in Algorithm::ALL {
            assert_eq!(Algorithm::from_id(alg.id()), Some(alg));
        }
        assert_eq!(Algorithm::from_id(0), None);
        assert_eq!(Algorithm::from_id(99), None);
    }

    #[test]
    fn test_ccm_entries_mirror_gcm() {
        let pairs = [
            (Algorithm::Aes128Gcm, Algorithm::Aes128Ccm),
            (Algorithm::Aes192Gcm, Algorithm::Aes192Ccm),
            (Algorithm::Aes256Gcm, Algorithm::Aes256Ccm),
        ];
        for (gcm, ccm) in pairs {
            assert_eq!(gcm.key_len(), ccm.key_len());
            assert_eq!(gcm.mode(), CipherMode::Gcm);
            assert_eq!(ccm.mode(), CipherMode::Ccm);
        }
        assert_eq!(
            serde_json::to_string(&Algorithm::Aes192Ccm).unwrap(),
            "\"aes-192-ccm\""
        );
        assert_eq!(Algorithm::Aes128Ccm.to_string(), "aes-128-ccm");
    }

    #[test]
    fn test_key_lengths_fit_buffer() {
        for alg in Algorithm::ALL {
            assert!(alg.key_len() <= MAX_KEY_LEN);
        }
    }

    #[test]
    fn test_crypt_setting_resolution() {
        assert_eq!(
            CryptSetting::On.algorithm(Algorithm::Aes128Gcm),
            Some(Algorithm::Aes128Gcm)
        );
        assert_eq!(
            CryptSetting::Explicit(Algorithm::Aes192Gcm).algorithm(Algorithm::Aes128Gcm),
            Some(Algorithm::Aes192Gcm)
        );
        assert_eq!(CryptSetting::Inherit.algorithm(Algorithm::Aes256Gcm), None);
        assert!(!CryptSetting::Off.is_encrypted());
        assert!(CryptSetting::Inherit.is_encrypted());
    }
}
