//! Keystore configuration.

use serde::{Deserialize, Serialize};

use crate::algorithm::Algorithm;
use crate::txg::SpaceCheck;

/// Tunables for a [`Keystore`](crate::Keystore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Algorithm used when encryption is turned on without naming one
    pub default_algorithm: Algorithm,
    /// Space policy for add-key and rewrap tasks
    pub space_check: SpaceCheck,
    /// Prove a wrapping key against the keychain before loading it
    pub verify_on_load: bool,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            default_algorithm: Algorithm::Aes256Gcm,
            space_check: SpaceCheck::Normal,
            verify_on_load: true,
        }
    }
}
