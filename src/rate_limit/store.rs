use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Window state after an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Whether this call was admitted and recorded.
    pub allowed: bool,
    /// Admitted calls in the trailing window, including this one if allowed.
    pub count: u32,
    /// Timestamp (epoch millis) of the oldest admitted call still in the window.
    pub oldest_ms: Option<u64>,
}

/// Storage for sliding-window counters.
///
/// `try_acquire` must be atomic per key: concurrent callers for the same key
/// may never both be admitted past `limit`. Distributed backends typically
/// implement it as a server-side script over a sorted set.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drop entries older than `now_ms - window_ms`, then record `now_ms` if
    /// fewer than `limit` remain.
    async fn try_acquire(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowState, StoreError>;

    /// Forget all history for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

// Acquisitions between sweeps of idle windows.
const SWEEP_INTERVAL: u64 = 1_024;

#[derive(Debug, Default)]
struct Window {
    window_ms: u64,
    // admitted call timestamps, oldest first
    admitted: VecDeque<u64>,
}

impl Window {
    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while self.admitted.front().is_some_and(|&t| t <= cutoff) {
            self.admitted.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<String, Window>,
    acquisitions: u64,
}

impl Windows {
    fn purge(&mut self, now_ms: u64) -> usize {
        let before = self.by_key.len();
        self.by_key.retain(|_, w| {
            w.prune(now_ms);
            !w.admitted.is_empty()
        });
        before - self.by_key.len()
    }
}

/// In-memory sliding log of admitted call timestamps.
///
/// A key is dropped once its last admitted call leaves the window. Idle keys
/// are swept as acquisitions come in, or on demand with
/// [`purge_expired`](Self::purge_expired).
#[derive(Default, Clone, Debug)]
pub struct InMemoryWindowStore {
    windows: Arc<Mutex<Windows>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with calls still inside their window, as of the last
    /// acquisition or sweep.
    pub fn tracked_keys(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.by_key.len())
    }

    /// Drop every key with no admitted call inside its window at `now_ms`.
    /// Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        Ok(self.lock()?.purge(now_ms))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Windows>, StoreError> {
        self.windows.lock().map_err(|_| StoreError::poisoned("rate windows"))
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn try_acquire(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowState, StoreError> {
        let mut guard = self.lock()?;
        guard.acquisitions += 1;
        if guard.acquisitions % SWEEP_INTERVAL == 0 {
            guard.purge(now_ms);
        }

        let window = guard.by_key.entry(key.to_string()).or_default();
        window.window_ms = window_ms;
        window.prune(now_ms);

        let allowed = window.admitted.len() < limit as usize;
        if allowed {
            window.admitted.push_back(now_ms);
        }
        let state = WindowState {
            allowed,
            count: u32::try_from(window.admitted.len()).unwrap_or(u32::MAX),
            oldest_ms: window.admitted.front().copied(),
        };
        if window.admitted.is_empty() {
            guard.by_key.remove(key);
        }
        Ok(state)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.by_key.remove(key);
        Ok(())
    }
}
