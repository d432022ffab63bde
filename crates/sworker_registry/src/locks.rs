//! Per-worker async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use sworker_ids::WorkerId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per worker id, created on demand.
///
/// The table only holds weak references, so an entry disappears once no
/// guard or waiter needs it. Dead entries are swept on each acquire.
#[derive(Default)]
pub(crate) struct WorkerLocks {
    table: Mutex<HashMap<WorkerId, Weak<AsyncMutex<()>>>>,
}

impl WorkerLocks {
    pub(crate) async fn acquire(&self, id: &WorkerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    table.retain(|_, entry| entry.strong_count() > 0);
                    let lock = Arc::new(AsyncMutex::new(()));
                    table.insert(id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}
