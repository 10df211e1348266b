//! In-memory registries of loaded key state.
//!
//! Lock order is wrapping keys before keychains. A keychain miss resolves
//! its wrapping key first and drops that lock before registering, so the
//! only path holding both is a rewrap, which takes them in that order.

mod keychains;
mod records;
mod wrapping_keys;

pub use keychains::{KeychainRef, KeychainRegistry};
pub use records::KeychainRecordRegistry;
pub use wrapping_keys::{WrappingKeyRegistry, WrappingKeysGuard};
