use crate::{SaltKey, SaltRecord, SaltStoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Tracks salt creations that are currently running, one per key.
///
/// The first caller for a key runs its creation future; callers arriving while
/// it is pending wait for that result instead of starting their own. If the
/// creation fails the next waiter gets to run its own attempt.
#[derive(Default)]
pub(crate) struct InflightCreates {
    pending: Mutex<HashMap<SaltKey, Arc<OnceCell<SaltRecord>>>>,
}

impl InflightCreates {
    pub(crate) async fn run<F, Fut>(&self, key: &SaltKey, create: F) -> Result<SaltRecord, SaltStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SaltRecord, SaltStoreError>>,
    {
        let cell = self.pending.lock().entry(key.clone()).or_default().clone();

        let result = cell.get_or_try_init(create).await.cloned();

        // Once settled the store itself answers, so only the entry we used is dropped
        let mut pending = self.pending.lock();
        if let Some(current) = pending.get(key)
            && Arc::ptr_eq(current, &cell)
        {
            pending.remove(key);
        }

        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
