/*!
In-process serialization of backup and restore runs.
*/

use crate::{Result, VaultError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared mutex held for the duration of a backup or restore
///
/// Clones share the same underlying lock. A restore holds it while taking its
/// safety snapshot, so the backup engine exposes an entry point that assumes
/// the lock is already held.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    inner: Arc<Mutex<()>>,
}

/// Proof that the operation lock is held
pub type OperationGuard<'a> = MutexGuard<'a, ()>;

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other run is in progress
    pub fn acquire(&self) -> Result<OperationGuard<'_>> {
        self.inner
            .lock()
            .map_err(|_| VaultError::Lock("a previous operation panicked while holding the lock".to_string()))
    }

    /// Acquire without blocking; `None` when another run holds the lock
    pub fn try_acquire(&self) -> Result<Option<OperationGuard<'_>>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(Some(guard)),
            Err(std::sync::TryLockError::WouldBlock) => Ok(None),
            Err(std::sync::TryLockError::Poisoned(_)) => Err(VaultError::Lock(
                "a previous operation panicked while holding the lock".to_string(),
            )),
        }
    }
}
