use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Process-scoped named mutexes, one per `(scope, key)` pair.
///
/// Entries are never evicted; the key space is bounded by the number of
/// networks this host serves.
#[derive(Default)]
pub struct KeyedLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, scope: &str, key: impl Display) -> OwnedMutexGuard<()> {
        let name = format!("{scope}-{key}");
        let existing = { self.locks.read().await.get(&name).cloned() };
        let lock = match existing {
            Some(lock) => lock,
            None => self
                .locks
                .write()
                .await
                .entry(name)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        lock.lock_owned().await
    }
}
