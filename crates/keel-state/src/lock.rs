//! Single-process implementation of [`LockFactory`].
//!
//! Suitable when every build of a cluster runs in one process (the CLI,
//! tests). Multi-node deployments plug in a database-backed factory.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{Lock, LockFactory, LockId, StorageResult};

type HeldLocks = Arc<Mutex<HashSet<LockId>>>;

/// Lock factory backed by a process-wide set of held lock ids.
#[derive(Debug, Clone, Default)]
pub struct InProcessLockFactory {
    held: HeldLocks,
}

impl InProcessLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently held by anyone.
    pub fn is_held(&self, id: &LockId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

#[async_trait]
impl LockFactory for InProcessLockFactory {
    async fn acquire(&self, id: &LockId) -> StorageResult<Option<Box<dyn Lock>>> {
        let acquired = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());

        if !acquired {
            debug!(lock = %id, "lock already held");
            return Ok(None);
        }

        debug!(lock = %id, "lock acquired");
        Ok(Some(Box::new(InProcessLock {
            id: id.clone(),
            held: Some(self.held.clone()),
        })))
    }
}

struct InProcessLock {
    id: LockId,
    held: Option<HeldLocks>,
}

impl InProcessLock {
    fn unlock(&mut self) -> bool {
        match self.held.take() {
            Some(held) => held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id),
            None => false,
        }
    }
}

impl Lock for InProcessLock {
    fn id(&self) -> &LockId {
        &self.id
    }

    fn release(mut self: Box<Self>) -> StorageResult<()> {
        if self.unlock() {
            debug!(lock = %self.id, "lock released");
            Ok(())
        } else {
            Err(StorageError::LockNotHeld {
                lock: self.id.to_string(),
            })
        }
    }
}

impl Drop for InProcessLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
