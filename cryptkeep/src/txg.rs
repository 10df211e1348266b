//! Transaction-group engine.
//!
//! Administrative changes run as two-phase tasks: a `check` that may fail
//! without side effects, then a `sync` that applies the change inside the
//! open transaction group. A failed sync leaves the pool half-written, so
//! the engine treats it as fatal.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// How much free space a task may consume when it syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaceCheck {
    /// Ordinary administrative change
    #[default]
    Normal,
    /// May dip into the pool's reserved slop space
    Reserved,
    /// Never fails for lack of space
    None,
}

/// Handle for the transaction group a task syncs in.
///
/// Only the engine creates these, so holding `&mut TxContext` proves the
/// caller is running in syncing context.
#[derive(Debug)]
pub struct TxContext {
    txg: u64,
    space_check: SpaceCheck,
}

impl TxContext {
    /// Transaction group being synced.
    #[must_use]
    pub const fn txg(&self) -> u64 {
        self.txg
    }

    /// Space policy the task was submitted with.
    #[must_use]
    pub const fn space_check(&self) -> SpaceCheck {
        self.space_check
    }
}

/// A two-phase administrative change.
pub trait SyncTask {
    /// Value produced by a successful sync.
    type Output;

    /// Short task name used in logs and fatal messages.
    fn name(&self) -> &'static str;

    /// Validates the change against current state.
    ///
    /// The task may keep holds taken here for `sync` to consume, so that
    /// nothing it validated can go away between the two phases.
    ///
    /// # Errors
    ///
    /// Any error rejects the task; nothing has been modified.
    fn check(&mut self, tx: &TxContext) -> Result<()>;

    /// Applies the change. Must succeed whenever `check` did.
    ///
    /// # Errors
    ///
    /// An error here is a broken invariant and aborts the engine.
    fn sync(self, tx: &mut TxContext) -> Result<Self::Output>;
}

/// Serialises tasks and hands out transaction groups.
#[derive(Debug)]
pub struct TxgEngine {
    open: Mutex<u64>,
}

impl TxgEngine {
    /// Creates an engine whose first task syncs in `first_txg`.
    #[must_use]
    pub fn new(first_txg: u64) -> Self {
        Self {
            open: Mutex::new(first_txg),
        }
    }

    /// Transaction group the next task will sync in.
    #[must_use]
    pub fn current_txg(&self) -> u64 {
        *self.open.lock()
    }

    /// Runs `task` in the open transaction group.
    ///
    /// # Errors
    ///
    /// Returns whatever `check` rejected the task with.
    ///
    /// # Panics
    ///
    /// Panics if `sync` fails after `check` accepted the task.
    pub fn run<T: SyncTask>(&self, mut task: T, space_check: SpaceCheck) -> Result<T::Output> {
        let mut open = self.open.lock();
        let mut tx = TxContext {
            txg: *open,
            space_check,
        };
        let name = task.name();

        if let Err(err) = task.check(&tx) {
            warn!(task = name, txg = tx.txg, error = %err, "sync task rejected");
            return Err(err);
        }

        let output = match task.sync(&mut tx) {
            Ok(output) => output,
            Err(err) => panic!("sync task {name} failed in txg {}: {err}", tx.txg),
        };
        debug!(task = name, txg = tx.txg, "sync task committed");
        *open += 1;
        Ok(output)
    }

    /// Opens a transaction group for sync-only work driven by the caller.
    ///
    /// The group commits when the returned handle is dropped; no other
    /// task runs until then.
    pub fn open_txg(&self, space_check: SpaceCheck) -> OpenTxg<'_> {
        let open = self.open.lock();
        let tx = TxContext {
            txg: *open,
            space_check,
        };
        OpenTxg { open, tx }
    }
}

impl Default for TxgEngine {
    fn default() -> Self {
        Self::new(1)
    }
}

/// An open transaction group returned by [`TxgEngine::open_txg`].
pub struct OpenTxg<'a> {
    open: MutexGuard<'a, u64>,
    tx: TxContext,
}

impl OpenTxg<'_> {
    /// The syncing context.
    pub fn tx(&mut self) -> &mut TxContext {
        &mut self.tx
    }
}

impl Drop for OpenTxg<'_> {
    fn drop(&mut self) {
        debug!(txg = self.tx.txg, "transaction group committed");
        *self.open += 1;
    }
}

#[cfg(test)]
pub(crate) fn test_context(txg: u64) -> TxContext {
    TxContext {
        txg,
        space_check: SpaceCheck::Normal,
    }
}
