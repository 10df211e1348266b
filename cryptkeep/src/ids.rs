//! Stable identifiers for the resources the keystore addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! object_number {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

object_number!(
    /// Object number of a dataset directory.
    DirId
);

object_number!(
    /// Object number of a dataset (a snapshot, clone or head).
    DatasetId
);

object_number!(
    /// Object number inside the persistent associative store.
    ObjectId
);
