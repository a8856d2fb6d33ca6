//! WorkspaceLock (spec §4.7): FIFO mutex over a filesystem workspace path.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

struct Entry {
    holder: Option<String>,
    waiters: VecDeque<(String, oneshot::Sender<()>)>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            holder: None,
            waiters: VecDeque::new(),
        }
    }
}

pub struct WorkspaceLock {
    entries: DashMap<PathBuf, Mutex<Entry>>,
}

impl WorkspaceLock {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// If the workspace is free, takes it immediately and returns true.
    /// Otherwise enqueues a waiter; if `timeout_ms` elapses first, removes
    /// the waiter and returns false. A timed-out waiter MUST NOT later
    /// acquire the lock (spec §4.7 invariant 3).
    pub async fn wait_for_lock(&self, path: &std::path::Path, lock_id: &str, timeout_ms: u64) -> bool {
        let rx = {
            let entry_lock = self
                .entries
                .entry(path.to_path_buf())
                .or_insert_with(|| Mutex::new(Entry::default()));
            let mut entry = entry_lock.lock().unwrap();
            if entry.holder.is_none() {
                entry.holder = Some(lock_id.to_string());
                return true;
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push_back((lock_id.to_string(), tx));
            rx
        };

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                // Timed out: remove ourselves from the waiter queue so we
                // cannot be granted the lock after the fact.
                if let Some(entry_lock) = self.entries.get(path) {
                    let mut entry = entry_lock.lock().unwrap();
                    entry.waiters.retain(|(id, _)| id != lock_id);
                }
                false
            }
        }
    }

    /// Idempotent for a mismatched `lock_id` (double-release safe).
    pub fn release(&self, path: &std::path::Path, lock_id: &str) {
        let Some(entry_lock) = self.entries.get(path) else {
            return;
        };
        let mut entry = entry_lock.lock().unwrap();
        if entry.holder.as_deref() != Some(lock_id) {
            return;
        }
        entry.holder = None;
        while let Some((waiter_id, tx)) = entry.waiters.pop_front() {
            if tx.send(()).is_ok() {
                entry.holder = Some(waiter_id);
                break;
            }
            // Receiver already dropped (timed out concurrently); try the
            // next waiter in FIFO order.
        }
    }

    pub fn is_locked(&self, path: &std::path::Path) -> bool {
        self.entries
            .get(path)
            .map(|e| e.lock().unwrap().holder.is_some())
            .unwrap_or(false)
    }
}

impl Default for WorkspaceLock {
    fn default() -> Self {
        Self::new()
    }
}
