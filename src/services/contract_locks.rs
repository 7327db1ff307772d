use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per contract id so overlapping reconciliations of the same
/// contract run one after the other.
///
/// The registry only holds weak references. A lock lives exactly as long as a
/// guard or a waiter holds it, so an entry can never be dropped while in use.
/// Dead entries are pruned once the registry reaches `prune_threshold`.
#[derive(Clone)]
pub struct ContractLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>>,
    prune_threshold: usize,
}

impl ContractLocks {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            prune_threshold: prune_threshold.max(1),
        }
    }

    pub async fn acquire(&self, contract_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(contract_id).lock_owned().await
    }

    fn lock_for(&self, contract_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(contract_id).and_then(Weak::upgrade) {
            return lock;
        }

        if locks.len() >= self.prune_threshold {
            locks.retain(|_, lock| lock.strong_count() > 0);
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(contract_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
