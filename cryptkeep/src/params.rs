//! Crypto parameters supplied with administrative requests.

use crate::algorithm::CryptSetting;
use crate::key::WrappingKey;

/// Key command carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoCmd {
    /// Load a wrapping key
    LoadKey,
    /// Unload a wrapping key
    UnloadKey,
    /// Append a new key generation
    AddKey,
    /// Replace the wrapping key
    Rewrap,
}

/// Encryption-related arguments of an administrative request.
///
/// Every field is optional; each operation validates the combination it
/// accepts.
#[derive(Debug, Default)]
pub struct CryptoParams {
    /// Requested encryption property
    pub crypt: CryptSetting,
    /// Requested key-source property
    pub keysource: Option<String>,
    /// Requested PBKDF2 salt
    pub salt: Option<u64>,
    /// New wrapping key
    pub wrapping_key: Option<WrappingKey>,
    /// Key command
    pub cmd: Option<CryptoCmd>,
}

impl CryptoParams {
    /// Parameters carrying only a wrapping key.
    #[must_use]
    pub fn with_wrapping_key(key: WrappingKey) -> Self {
        Self {
            wrapping_key: Some(key),
            ..Self::default()
        }
    }

    /// Sets the encryption property.
    #[must_use]
    pub const fn crypt(mut self, crypt: CryptSetting) -> Self {
        self.crypt = crypt;
        self
    }

    /// Sets the key-source property.
    #[must_use]
    pub fn keysource(mut self, keysource: impl Into<String>) -> Self {
        self.keysource = Some(keysource.into());
        self
    }

    /// Sets the salt.
    #[must_use]
    pub const fn salt(mut self, salt: u64) -> Self {
        self.salt = Some(salt);
        self
    }

    /// Sets the key command.
    #[must_use]
    pub const fn cmd(mut self, cmd: CryptoCmd) -> Self {
        self.cmd = Some(cmd);
        self
    }
}
