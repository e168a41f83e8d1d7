// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! In-process counter store for fixed-window rate limiting.
//!
//! Every operation runs inside one critical section over the whole map, so
//! a read-check-write sequence issued through [`CounterStore::transaction`]
//! is atomic with respect to every other caller. Entries whose window has
//! ended are treated as absent and are removed by a background sweep owned
//! by the store.

use crate::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Count of admissions for one key within one fixed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub key: String,
    pub count: u32,
    pub window_start: DateTime<Utc>,
    /// Exclusive
    pub window_end: DateTime<Utc>,
}

impl CounterEntry {
    fn fresh(key: &str, now: DateTime<Utc>, window_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            count: 0,
            window_start: now,
            window_end: window_end(now, window_ms),
        }
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }
}

/// End of a window of `window_ms` opened at `start`, saturating at the
/// latest representable instant.
pub fn window_end(start: DateTime<Utc>, window_ms: u64) -> DateTime<Utc> {
    i64::try_from(window_ms)
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|length| start.checked_add_signed(length))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Mutable view of the store, valid for the duration of one critical section.
pub struct CounterTxn<'a> {
    entries: &'a mut HashMap<String, CounterEntry>,
}

impl CounterTxn<'_> {
    /// Live entry for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&CounterEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    /// Return the live entry, opening a new window if there is none.
    pub fn set_or_reset(&mut self, key: &str, now: DateTime<Utc>, window_ms: u64) -> CounterEntry {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::fresh(key, now, window_ms));
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(key, now, window_ms);
        }
        entry.clone()
    }

    /// Count one admission. The entry must have been opened by
    /// [`set_or_reset`](Self::set_or_reset) in the same transaction.
    pub fn increment(&mut self, key: &str) -> Option<CounterEntry> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                Some(entry.clone())
            }
            None => {
                warn!(key, "Increment on absent counter entry");
                None
            }
        }
    }

    /// Return one slot. Saturates at zero; a no-op once the window has ended.
    pub fn decrement(&mut self, key: &str, now: DateTime<Utc>) -> Option<CounterEntry> {
        let entry = self.entries.get_mut(key).filter(|e| !e.is_expired(now))?;
        entry.count = entry.count.saturating_sub(1);
        Some(entry.clone())
    }

    pub fn reset(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

struct SweepTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Key → [`CounterEntry`] map shared by every request handler.
pub struct CounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
    sweeper: StdMutex<Option<SweepTask>>,
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl CounterStore {
    /// Create a store without a background sweep. Expired entries are
    /// still ignored lazily; call [`sweep`](Self::sweep) to reclaim them.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            sweeper: StdMutex::new(None),
        }
    }

    /// Create a store and start its sweep task. Must be called from within
    /// a Tokio runtime.
    pub fn start(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new(clock));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(sweep_loop(Arc::downgrade(&store), sweep_interval, shutdown_rx));
        if let Ok(mut slot) = store.sweeper.lock() {
            *slot = Some(SweepTask { shutdown, handle });
        }
        debug!(?sweep_interval, "Counter store sweep started");
        store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `f` inside the store's critical section.
    ///
    /// `f` must not block or await; it holds the only lock on the map.
    pub async fn transaction<R>(&self, f: impl FnOnce(&mut CounterTxn<'_>) -> R) -> R {
        let mut entries = self.entries.lock().await;
        let mut txn = CounterTxn {
            entries: &mut *entries,
        };
        f(&mut txn)
    }

    pub async fn get(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        self.transaction(|txn| txn.get(key, now).cloned()).await
    }

    pub async fn set_or_reset(&self, key: &str, now: DateTime<Utc>, window_ms: u64) -> CounterEntry {
        self.transaction(|txn| txn.set_or_reset(key, now, window_ms))
            .await
    }

    pub async fn increment(&self, key: &str) -> Option<CounterEntry> {
        self.transaction(|txn| txn.increment(key)).await
    }

    pub async fn decrement(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        self.transaction(|txn| txn.decrement(key, now)).await
    }

    /// Drop the entry for `key`, returning whether one existed.
    pub async fn reset(&self, key: &str) -> bool {
        self.transaction(|txn| txn.reset(key)).await
    }

    /// Remove every entry whose window ended at or before `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of entries held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop the sweep task, waiting for it to exit.
    pub async fn shutdown(&self) {
        let task = match self.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Counter store sweep task ended abnormally");
            }
            debug!("Counter store sweep stopped");
        }
    }
}

impl Drop for CounterStore {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(task) = slot.take() {
                task.handle.abort();
            }
        }
    }
}

async fn sweep_loop(store: Weak<CounterStore>, every: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately; nothing to sweep yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else { break };
                let removed = store.sweep(store.clock.now()).await;
                if removed > 0 {
                    debug!(removed, "Swept expired counter entries");
                }
            }
        }
    }
}
