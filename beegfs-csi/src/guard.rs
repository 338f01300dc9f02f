//! Per-volume mutual exclusion and the record of completed operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use libcsi::Volume;
use tokio::sync::RwLock;

/// Set of keys currently being worked on.
///
/// A key is held by at most one caller at a time.  Callers that cannot get
/// the key give up instead of waiting, and the orchestrator retries.
#[derive(Debug, Clone, Default)]
pub struct KeyLock {
    held: Arc<DashSet<String>>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` if nobody holds it.  Returns whether it was taken.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.held.insert(key.to_owned())
    }

    pub fn release(&self, key: &str) {
        self.held.remove(key);
    }

    /// Take `key` for the lifetime of the returned guard.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        self.try_acquire(key).then(|| KeyGuard {
            lock: self.clone(),
            key: key.to_owned(),
        })
    }

    /// Take every key in `keys` or none of them.
    pub fn try_lock_all(&self, keys: &[&str]) -> Option<Vec<KeyGuard>> {
        keys.iter().map(|key| self.try_lock(key)).collect()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}

/// Releases its key when dropped, including when the owning future is
/// cancelled.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard {
    lock: KeyLock,
    key: String,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.lock.release(&self.key);
    }
}

/// Last completed lifecycle step of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeStatus {
    /// Holds the response returned when the volume was created.
    Created(Volume),
    Deleted,
}

/// In-memory record of volumes this process created or deleted.
#[derive(Debug, Default)]
pub struct StatusLedger {
    entries: RwLock<HashMap<String, VolumeStatus>>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write(&self, key: &str, status: VolumeStatus) {
        self.entries.write().await.insert(key.to_owned(), status);
    }

    pub async fn read(&self, key: &str) -> Option<VolumeStatus> {
        self.entries.read().await.get(key).cloned()
    }
}
