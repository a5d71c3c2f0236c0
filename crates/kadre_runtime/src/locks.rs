use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::errors::ExecError;

/// Process-wide named action locks. Waiters queue in FIFO order (tokio's
/// mutex fairness); an action holds at most one named lock at a time, which
/// keeps lock ordering trivially deadlock-free.
#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> Result<OwnedMutexGuard<()>, ExecError> {
        let mutex = {
            let mut map = self
                .inner
                .lock()
                .map_err(|_| ExecError::LockDenied(name.to_owned()))?;
            Arc::clone(map.entry(name.to_owned()).or_default())
        };
        Ok(mutex.lock_owned().await)
    }
}
