//! Per-image single-flight locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async locks, one per target image name.
///
/// Entries are never removed; the set of image names a process touches is
/// small.
#[derive(Debug, Default)]
pub struct ImageLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `image`.
    pub async fn acquire(&self, image: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(image.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
