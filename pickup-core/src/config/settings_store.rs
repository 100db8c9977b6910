//! Reloadable settings with change notification.
//!
//! `SettingsStore<T>` keeps the current value behind an `RwLock` and bumps a
//! version on every replacement. Long-running loops read a fresh copy each
//! tick and may also `await` a [`SettingsWatcher`] to react immediately.

use std::sync::Arc;
use tokio::sync::{RwLock, watch};

pub struct SettingsStore<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    data: RwLock<T>,
    version_tx: watch::Sender<u64>,
}

/// Resolves when the watched [`SettingsStore`] is replaced.
pub struct SettingsWatcher {
    version_rx: watch::Receiver<u64>,
}

impl<T: Clone> SettingsStore<T> {
    pub fn new(initial: T) -> Self {
        let (version_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(initial),
                version_tx,
            }),
        }
    }

    /// Replace the value and wake every watcher.
    pub async fn update(&self, value: T) {
        let mut guard = self.inner.data.write().await;
        *guard = value;
        drop(guard);
        self.inner.version_tx.send_modify(|v| *v += 1);
    }

    /// A copy of the current value.
    pub async fn current(&self) -> T {
        self.inner.data.read().await.clone()
    }

    pub fn version(&self) -> u64 {
        *self.inner.version_tx.borrow()
    }

    pub fn subscribe(&self) -> SettingsWatcher {
        SettingsWatcher {
            version_rx: self.inner.version_tx.subscribe(),
        }
    }
}

impl<T> Clone for SettingsStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SettingsWatcher {
    /// Wait for the next update. Errors once the store is dropped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.version_rx.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_notifies_watchers() {
        let store = SettingsStore::new(1u32);
        let mut watcher = store.subscribe();

        store.update(2).await;
        watcher.changed().await.unwrap();

        assert_eq!(store.current().await, 2);
        assert_eq!(store.version(), 1);
    }
}
