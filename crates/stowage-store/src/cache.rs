//! Write-behind object cache.
//!
//! A [`Cache`] holds live, typed objects keyed by string and persists them
//! through one [`StorageContainer`]. Reads hit memory first; writes mark the
//! entry dirty and a periodic flush cycle (see [`Cache::start_flush_task`])
//! stores every dirty entry. In [`WriteMode::Synchronous`] writes go through
//! inline instead.
//!
//! Each entry moves through [`EntryState`]:
//!
//! ```text
//!   Clean ──put──▶ Dirty ──flush──▶ Flushing ──stored──▶ Clean
//!                    ▲                 │
//!                    └── failed, or ───┤
//!                        put in flight │
//!   Error ◀── failed maxFlushFailures ─┘
//!     └──put──▶ Dirty
//! ```
//!
//! A flush snapshots the live value when it dequeues the entry. A write that
//! lands while the store is in flight bumps the entry's generation, and the
//! entry ends up `Dirty` instead of `Clean` so the newer value is written on
//! the next cycle.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::container::StorageContainer;
use crate::decomposer::{Decomposer, Stored};
use crate::error::{StorageError, StorageResult};
use crate::hooks::{HookRegistry, Operation};
use crate::settings::{FlushMode, StorageSettings, WriteMode};

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness and flush health.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Successful backend writes, inline or from a flush cycle.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate between 0.0 and 1.0 (0.0 before any lookup).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.flushes,
            &self.flush_failures,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}% flushes={} failures={} evictions={}",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
            self.flushes(),
            self.flush_failures(),
            self.evictions(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Cached objects
// ═══════════════════════════════════════════════════════════════════════

/// Where a cached entry stands relative to its backend copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Matches the backend.
    Clean,
    /// Changed since the last successful write.
    Dirty,
    /// A write is in flight.
    Flushing,
    /// Writing failed too many times in a row. Retained, not retried until
    /// the application writes the entry again.
    Error,
    /// Removed from its cache. Writes to the handle no longer persist.
    Removed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Flushing => "flushing",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Slot<T> {
    value: Arc<T>,
    state: EntryState,
    generation: u64,
    failures: u32,
    last_error: Option<String>,
    last_access: Instant,
    last_write: Instant,
}

/// A live object held by a [`Cache`].
///
/// The value is shared as an `Arc<T>`; replacing it through [`set`](Self::set)
/// or [`modify`](Self::modify) marks the entry dirty. Writes made through
/// the handle are persisted by the next flush, even in synchronous mode.
/// Use [`Cache::put`] or [`Cache::update`] to write through inline.
pub struct CachedObject<T> {
    key: String,
    slot: Mutex<Slot<T>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<T> CachedObject<T> {
    fn new(key: String, value: Arc<T>, state: EntryState) -> Self {
        let now = Instant::now();
        Self {
            key,
            slot: Mutex::new(Slot {
                value,
                state,
                generation: 0,
                failures: 0,
                last_error: None,
                last_access: now,
                last_write: now,
            }),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current value. Counts as an access for idle eviction.
    pub fn value(&self) -> Arc<T> {
        let mut slot = self.slot();
        slot.last_access = Instant::now();
        Arc::clone(&slot.value)
    }

    pub fn state(&self) -> EntryState {
        self.slot().state
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state(), EntryState::Dirty | EntryState::Error)
    }

    /// Number of application writes since the entry was created.
    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    /// Consecutive failed writes since the last success or application write.
    pub fn failures(&self) -> u32 {
        self.slot().failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.slot().last_error.clone()
    }

    pub fn last_access(&self) -> Instant {
        self.slot().last_access
    }

    pub fn last_write(&self) -> Instant {
        self.slot().last_write
    }

    /// Replace the value and mark the entry dirty.
    pub fn set(&self, value: impl Into<Arc<T>>) {
        let mut slot = self.slot();
        slot.value = value.into();
        Self::written(&mut slot);
    }

    /// Edit a copy of the value and swap it in. Readers holding the old
    /// `Arc` keep seeing the old value.
    pub fn modify<F>(&self, edit: F)
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let mut slot = self.slot();
        let mut next = T::clone(&slot.value);
        edit(&mut next);
        slot.value = Arc::new(next);
        Self::written(&mut slot);
    }

    /// Flag the entry for the next flush without changing the value.
    pub fn mark_dirty(&self) {
        Self::written(&mut self.slot());
    }

    fn written(slot: &mut Slot<T>) {
        let now = Instant::now();
        slot.generation += 1;
        slot.failures = 0;
        slot.last_error = None;
        slot.last_write = now;
        slot.last_access = now;
        match slot.state {
            // The in-flight write sees the new generation and re-dirties.
            EntryState::Flushing | EntryState::Removed => {}
            _ => slot.state = EntryState::Dirty,
        }
    }

    fn touch(&self) {
        self.slot().last_access = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.slot().last_access.elapsed()
    }
}

impl<T> fmt::Debug for CachedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("CachedObject")
            .field("key", &self.key)
            .field("state", &slot.state)
            .field("generation", &slot.generation)
            .field("failures", &slot.failures)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Flush reporting
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Dirty entries the cycle tried to write.
    pub attempted: usize,
    pub flushed: usize,
    pub failed: usize,
    /// Clean entries dropped for being idle.
    pub evicted: usize,
    /// The cycle stopped early because its task was asked to stop.
    pub cancelled: bool,
}

impl FlushReport {
    fn tally(&mut self, outcome: Option<StorageResult<()>>) {
        match outcome {
            Some(Ok(())) => {
                self.attempted += 1;
                self.flushed += 1;
            }
            Some(Err(_)) => {
                self.attempted += 1;
                self.failed += 1;
            }
            None => {}
        }
    }
}

impl fmt::Display for FlushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} flushed={} failed={} evicted={}{}",
            self.attempted,
            self.flushed,
            self.failed,
            self.evicted,
            if self.cancelled { " (cancelled)" } else { "" },
        )
    }
}

/// Handle to a running background flush cycle.
///
/// Dropping the handle signals the task to stop; [`stop`](Self::stop) also
/// waits for it. A store already in flight always completes.
pub struct FlushTask {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTask {
    /// Signal the cycle to stop and wait for it to exit.
    pub async fn stop(mut self) -> StorageResult<()> {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Cache
// ═══════════════════════════════════════════════════════════════════════

struct CacheInner<T> {
    name: String,
    container: Arc<dyn StorageContainer>,
    settings: Arc<StorageSettings>,
    hooks: Arc<HookRegistry>,
    decomposer: Arc<Decomposer>,
    entries: DashMap<String, Arc<CachedObject<T>>>,
    key_locks: KeyLocks,
    stats: CacheStats,
    cycle_lock: tokio::sync::Mutex<()>,
}

type KeyLocks = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Holds the per-key lock that orders a backend load against a remove of
/// the same key. The map slot is dropped with the last holder.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> KeyGuard<'a> {
    async fn acquire(locks: &'a KeyLocks, key: &str) -> Self {
        let lock = Arc::clone(&*locks.entry(key.to_string()).or_default());
        Self {
            locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// A typed write-behind cache over one storage container.
///
/// Clones share the same entries.
///
/// # Example
///
/// ```ignore
/// let cache: Cache<Player> = Cache::builder(container)
///     .name("players")
///     .settings(settings)
///     .build();
/// let flusher = cache.start_flush_task();
///
/// cache.put("player:1", Player { name: "Alice".into(), score: 0 }).await?;
/// if let Some(entry) = cache.get("player:1").await? {
///     entry.modify(|p| p.score += 10);
/// }
/// ```
pub struct Cache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Stored> Cache<T> {
    /// Start building a cache over `container`.
    pub fn builder(container: Arc<dyn StorageContainer>) -> CacheBuilder<T> {
        CacheBuilder {
            name: "cache".to_string(),
            container,
            settings: None,
            hooks: None,
            decomposer: None,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn container(&self) -> &Arc<dyn StorageContainer> {
        &self.inner.container
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether `key` is held in memory. Never touches the backend.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// The in-memory entry for `key`, without loading it.
    pub fn entry(&self, key: &str) -> Option<Arc<CachedObject<T>>> {
        self.inner.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Keys held in memory, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Look up `key`, loading it from the backend on a miss.
    ///
    /// Returns `None` when the backend has no object under `key`; no entry
    /// is created in that case.
    #[instrument(skip(self), fields(cache = %self.inner.name))]
    pub async fn get(&self, key: &str) -> StorageResult<Option<Arc<CachedObject<T>>>> {
        let inner = &self.inner;
        if let Some(entry) = self.entry(key) {
            CacheStats::record(&inner.stats.hits, 1);
            entry.touch();
            return Ok(Some(entry));
        }
        CacheStats::record(&inner.stats.misses, 1);

        inner.hooks.run_before(Operation::Retrieve, key, None)?;
        let _key = KeyGuard::acquire(&inner.key_locks, key).await;
        // Filled by a put or another load while we waited.
        if let Some(entry) = self.entry(key) {
            entry.touch();
            return Ok(Some(entry));
        }
        let object = match inner.container.retrieve(key).await {
            Ok(object) => object,
            Err(StorageError::NotFound { .. }) => {
                debug!(key, "not in backend");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        inner.hooks.run_after(Operation::Retrieve, key, Some(&object));

        let value = inner.decomposer.recompose::<T>(&object)?;
        let loaded = Arc::new(CachedObject::new(
            key.to_string(),
            Arc::new(value),
            EntryState::Clean,
        ));
        if !inner.settings.cache_on_retrieve() {
            return Ok(Some(loaded));
        }
        // A put that raced the load wins.
        let entry = Arc::clone(&*inner.entries.entry(key.to_string()).or_insert(loaded));
        Ok(Some(entry))
    }

    /// The value under `key`, or `fallback` when the backend has none.
    pub async fn get_or(&self, key: &str, fallback: T) -> StorageResult<Arc<T>> {
        Ok(match self.get(key).await? {
            Some(entry) => entry.value(),
            None => Arc::new(fallback),
        })
    }

    /// Insert or replace the value under `key` and mark it dirty.
    ///
    /// In synchronous mode the value is written before this returns, and a
    /// failed write is returned as the error. A failed write stays cached
    /// for the next cycle. With `cacheOnStore` off, an entry leaves memory
    /// as soon as its write succeeds.
    #[instrument(skip(self, value), fields(cache = %self.inner.name))]
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Arc<T>>,
    ) -> StorageResult<Arc<CachedObject<T>>> {
        let value = value.into();
        let entry = match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                drop(occupied);
                entry.set(value);
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CachedObject::new(key.to_string(), value, EntryState::Dirty));
                vacant.insert(Arc::clone(&entry));
                entry
            }
        };
        self.write_through(&entry).await?;
        Ok(entry)
    }

    /// [`put`](Self::put) each pair in order, stopping at the first failed
    /// synchronous write.
    pub async fn put_all<I>(&self, values: I) -> StorageResult<Vec<Arc<CachedObject<T>>>>
    where
        I: IntoIterator<Item = (String, T)>,
    {
        let mut entries = Vec::new();
        for (key, value) in values {
            entries.push(self.put(&key, value).await?);
        }
        Ok(entries)
    }

    /// Edit the value under `key` in place, loading it first if needed.
    ///
    /// Returns `None` without calling `edit` when `key` does not exist.
    pub async fn update<F>(&self, key: &str, edit: F) -> StorageResult<Option<Arc<CachedObject<T>>>>
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let Some(entry) = self.get(key).await? else {
            return Ok(None);
        };
        entry.modify(edit);
        self.write_through(&entry).await?;
        Ok(Some(entry))
    }

    async fn write_through(&self, entry: &CachedObject<T>) -> StorageResult<()> {
        if self.inner.settings.write_mode() == WriteMode::Synchronous {
            if let Some(Err(e)) = self.flush_entry(entry).await {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Delete `key` from the backend and drop it from memory.
    ///
    /// The entry is dropped even if the backend delete fails; that failure
    /// is still returned. A `before-delete` veto leaves both untouched.
    #[instrument(skip(self), fields(cache = %self.inner.name))]
    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        let inner = &self.inner;
        inner.hooks.run_before(Operation::Delete, key, None)?;

        // A load of `key` already in flight finishes before the delete starts.
        let _key = KeyGuard::acquire(&inner.key_locks, key).await;
        let removed = inner.entries.remove(key).map(|(_, entry)| entry);
        // Wait out an in-flight write so it cannot land after the delete.
        let _write = match &removed {
            Some(entry) => {
                entry.slot().state = EntryState::Removed;
                Some(entry.write_lock.lock().await)
            }
            None => None,
        };

        if let Err(e) = inner.container.delete(key).await {
            warn!(key, error = %e, "backend delete failed");
            return Err(e);
        }
        inner.hooks.run_after(Operation::Delete, key, None);
        Ok(())
    }

    /// [`remove`](Self::remove) each key in order, stopping at the first
    /// failure.
    pub async fn remove_all<I, K>(&self, keys: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.remove(key.as_ref()).await?;
        }
        Ok(())
    }

    /// Drop clean entries from memory without any I/O. Returns how many
    /// were dropped.
    pub fn clear(&self) -> usize {
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.state() != EntryState::Clean);
        before - self.inner.entries.len()
    }

    // ── flushing ─────────────────────────────────────────────────────

    /// Write one entry if it is dirty. `None` means there was nothing to do.
    async fn flush_entry(&self, entry: &CachedObject<T>) -> Option<StorageResult<()>> {
        let _write = entry.write_lock.lock().await;
        let (value, generation) = {
            let mut slot = entry.slot();
            if slot.state != EntryState::Dirty {
                return None;
            }
            slot.state = EntryState::Flushing;
            (Arc::clone(&slot.value), slot.generation)
        };

        let result = self.store(&entry.key, &value).await;

        let inner = &self.inner;
        let mut slot = entry.slot();
        let raced = slot.generation != generation;
        match &result {
            Ok(()) => {
                CacheStats::record(&inner.stats.flushes, 1);
                slot.failures = 0;
                slot.last_error = None;
                if slot.state == EntryState::Flushing {
                    slot.state = if raced { EntryState::Dirty } else { EntryState::Clean };
                }
            }
            Err(e) => {
                CacheStats::record(&inner.stats.flush_failures, 1);
                slot.failures += 1;
                slot.last_error = Some(e.to_string());
                if slot.state == EntryState::Flushing {
                    slot.state = if !raced && slot.failures >= inner.settings.max_flush_failures() {
                        EntryState::Error
                    } else {
                        EntryState::Dirty
                    };
                }
                warn!(
                    cache = %inner.name,
                    key = %entry.key,
                    failures = slot.failures,
                    state = %slot.state,
                    error = %e,
                    "flush failed"
                );
            }
        }
        let release = slot.state == EntryState::Clean && !inner.settings.cache_on_store();
        drop(slot);

        if release {
            let released = inner.entries.remove_if(&entry.key, |_, held| {
                std::ptr::eq(Arc::as_ptr(held), entry) && held.state() == EntryState::Clean
            });
            if released.is_some() {
                CacheStats::record(&inner.stats.evictions, 1);
            }
        }
        Some(result)
    }

    async fn store(&self, key: &str, value: &T) -> StorageResult<()> {
        let inner = &self.inner;
        let object = inner.decomposer.decompose(value);
        inner.hooks.run_before(Operation::Store, key, Some(&object))?;
        inner.container.store(key, &object).await?;
        inner.hooks.run_after(Operation::Store, key, Some(&object));
        Ok(())
    }

    /// Run one flush cycle now: write every dirty entry, then evict idle
    /// clean entries.
    pub async fn flush(&self) -> FlushReport {
        self.cycle(None).await
    }

    async fn cycle(&self, stop: Option<&watch::Receiver<bool>>) -> FlushReport {
        let inner = &self.inner;
        let _cycle = inner.cycle_lock.lock().await;
        let stopped = || stop.is_some_and(|rx| *rx.borrow());

        let mut dirty: Vec<Arc<CachedObject<T>>> = inner
            .entries
            .iter()
            .filter(|e| e.value().state() == EntryState::Dirty)
            .map(|e| Arc::clone(e.value()))
            .collect();
        dirty.sort_by(|a, b| a.key.cmp(&b.key));

        let mut report = FlushReport::default();

        match inner.settings.flush_mode() {
            FlushMode::Sequential => {
                for entry in &dirty {
                    if stopped() {
                        report.cancelled = true;
                        break;
                    }
                    report.tally(self.flush_entry(entry).await);
                }
            }
            FlushMode::Parallel => {
                if stopped() {
                    report.cancelled = true;
                } else {
                    let outcomes =
                        future::join_all(dirty.iter().map(|entry| self.flush_entry(entry))).await;
                    outcomes.into_iter().for_each(|o| report.tally(o));
                }
            }
        }

        if !report.cancelled {
            report.evicted = self.evict_idle();
        }
        debug!(cache = %inner.name, %report, "flush cycle finished");
        report
    }

    fn evict_idle(&self) -> usize {
        let Some(idle) = self.inner.settings.eviction_idle() else {
            return 0;
        };
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| {
            !(entry.state() == EntryState::Clean && entry.idle_for() >= idle)
        });
        let evicted = before - self.inner.entries.len();
        CacheStats::record(&self.inner.stats.evictions, evicted as u64);
        evicted
    }

    /// Spawn the periodic flush cycle on the current tokio runtime.
    ///
    /// Returns `None` when the settings disable the cycle.
    pub fn start_flush_task(&self) -> Option<FlushTask> {
        let period = self.inner.settings.flush_interval()?;
        let (stop, mut stop_rx) = watch::channel(false);
        let cycle_rx = stop_rx.clone();
        let cache = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if cache.cycle(Some(&cycle_rx)).await.cancelled {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(cache = %cache.inner.name, "flush task stopped");
        });

        info!(cache = %self.inner.name, ?period, "flush task started");
        Some(FlushTask {
            stop,
            handle: Some(handle),
        })
    }
}

impl<T> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("backend", &self.inner.container.backend())
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`Cache`].
pub struct CacheBuilder<T> {
    name: String,
    container: Arc<dyn StorageContainer>,
    settings: Option<Arc<StorageSettings>>,
    hooks: Option<Arc<HookRegistry>>,
    decomposer: Option<Arc<Decomposer>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Stored> CacheBuilder<T> {
    /// Name used in logs (default: `"cache"`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn settings(mut self, settings: impl Into<Arc<StorageSettings>>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    /// Hooks run around every backend operation the cache issues.
    pub fn hooks(mut self, hooks: impl Into<Arc<HookRegistry>>) -> Self {
        self.hooks = Some(hooks.into());
        self
    }

    /// Custom codecs consulted before `T`'s own [`Stored`] impl.
    pub fn decomposer(mut self, decomposer: impl Into<Arc<Decomposer>>) -> Self {
        self.decomposer = Some(decomposer.into());
        self
    }

    pub fn build(self) -> Cache<T> {
        Cache {
            inner: Arc::new(CacheInner {
                name: self.name,
                container: self.container,
                settings: self.settings.unwrap_or_default(),
                hooks: self.hooks.unwrap_or_default(),
                decomposer: self.decomposer.unwrap_or_default(),
                entries: DashMap::new(),
                key_locks: DashMap::new(),
                stats: CacheStats::default(),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::container::{EntryStream, MemoryContainer};
    use crate::decomposed::DecomposedObject;
    use crate::hooks::HookDecision;
    use crate::schema::Predicate;

    #[derive(Debug, Clone, PartialEq)]
    struct Player {
        name: String,
        score: i64,
    }

    crate::stored!(Player { name: String, score: i64 });

    fn player(name: &str, score: i64) -> Player {
        Player {
            name: name.to_string(),
            score,
        }
    }

    /// A memory container that can be told to fail or to hold stores.
    #[derive(Default)]
    struct Controlled {
        inner: MemoryContainer,
        failing: AtomicBool,
        hold: AtomicBool,
        hold_retrieve: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl StorageContainer for Controlled {
        fn backend(&self) -> &'static str {
            "controlled"
        }

        async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::BackendUnavailable {
                    backend: "controlled",
                    attempts: 1,
                    reason: "offline".into(),
                });
            }
            self.inner.store(key, object).await
        }

        async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
            if self.hold_retrieve.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.retrieve(key).await
        }

        fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
            self.inner.retrieve_all(predicate)
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::BackendUnavailable {
                    backend: "controlled",
                    attempts: 1,
                    reason: "offline".into(),
                });
            }
            self.inner.delete(key).await
        }

        async fn keys(&self) -> StorageResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    fn cache_over(container: Arc<dyn StorageContainer>, settings: StorageSettings) -> Cache<Player> {
        Cache::builder(container).name("players").settings(settings).build()
    }

    fn deferred() -> StorageSettings {
        StorageSettings::builder()
            .eviction_idle(None)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_the_same_instance() {
        let backend = Arc::new(MemoryContainer::new());
        let cache = cache_over(backend.clone(), deferred());

        let value = Arc::new(player("Alice", 1));
        cache.put("p:1", Arc::clone(&value)).await.unwrap();
        let entry = cache.get("p:1").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&entry.value(), &value));
        assert_eq!(entry.state(), EntryState::Dirty);
        assert!(backend.is_empty(), "deferred put must not write");
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn flush_writes_dirty_entries_once() {
        let backend = Arc::new(MemoryContainer::new());
        let cache = cache_over(backend.clone(), deferred());
        cache.put("p:1", player("Alice", 1)).await.unwrap();
        cache.put("p:2", player("Bob", 2)).await.unwrap();

        let report = cache.flush().await;
        assert_eq!((report.attempted, report.flushed, report.failed), (2, 2, 0));
        assert_eq!(cache.entry("p:1").unwrap().state(), EntryState::Clean);
        assert_eq!(
            backend.retrieve("p:2").await.unwrap(),
            DecomposedObject::new().with("name", "Bob").with("score", 2)
        );

        assert_eq!(cache.flush().await.attempted, 0);
    }

    #[tokio::test]
    async fn miss_loads_clean_and_unknown_key_creates_nothing() {
        let backend = Arc::new(MemoryContainer::new());
        backend
            .store("p:1", &DecomposedObject::new().with("name", "Alice").with("score", 7))
            .await
            .unwrap();
        let cache = cache_over(backend, deferred());

        let entry = cache.get("p:1").await.unwrap().unwrap();
        assert_eq!(*entry.value(), player("Alice", 7));
        assert_eq!(entry.state(), EntryState::Clean);

        assert!(cache.get("p:404").await.unwrap().is_none());
        assert!(!cache.contains("p:404"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().misses(), 2);
    }

    #[tokio::test]
    async fn cache_on_retrieve_off_keeps_loads_out() {
        let backend = Arc::new(MemoryContainer::new());
        backend
            .store("p:1", &DecomposedObject::new().with("name", "Alice").with("score", 7))
            .await
            .unwrap();
        let settings = StorageSettings::builder()
            .cache_on_retrieve(false)
            .build()
            .unwrap();
        let cache = cache_over(backend, settings);

        assert!(cache.get("p:1").await.unwrap().is_some());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn synchronous_put_writes_before_returning() {
        let backend = Arc::new(Controlled::default());
        let settings = StorageSettings::builder()
            .write_mode(WriteMode::Synchronous)
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);

        let entry = cache.put("p:1", player("Alice", 1)).await.unwrap();
        assert_eq!(entry.state(), EntryState::Clean);
        assert!(backend.inner.contains("p:1").await.unwrap());

        backend.failing.store(true, Ordering::SeqCst);
        let err = cache.put("p:1", player("Alice", 2)).await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable { .. }));
        let entry = cache.entry("p:1").unwrap();
        assert_eq!(entry.state(), EntryState::Dirty);
        assert_eq!(entry.value().score, 2);
    }

    #[tokio::test]
    async fn failures_retry_then_park_in_error() {
        let backend = Arc::new(Controlled::default());
        backend.failing.store(true, Ordering::SeqCst);
        let settings = StorageSettings::builder()
            .max_flush_failures(2)
            .eviction_idle(None)
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);
        cache.put("p:1", player("Alice", 1)).await.unwrap();

        let report = cache.flush().await;
        assert_eq!(report.failed, 1);
        let entry = cache.entry("p:1").unwrap();
        assert_eq!(entry.state(), EntryState::Dirty);
        assert_eq!(entry.failures(), 1);

        cache.flush().await;
        assert_eq!(entry.state(), EntryState::Error);
        assert!(entry.last_error().unwrap().contains("offline"));

        // Parked entries are skipped by the cycle.
        assert_eq!(cache.flush().await.attempted, 0);

        backend.failing.store(false, Ordering::SeqCst);
        entry.modify(|p| p.score = 5);
        assert_eq!(entry.state(), EntryState::Dirty);
        assert_eq!(cache.flush().await.flushed, 1);
        assert_eq!(entry.state(), EntryState::Clean);
        assert_eq!(cache.stats().flush_failures(), 2);
    }

    #[tokio::test]
    async fn put_during_flush_is_not_lost() {
        let backend = Arc::new(Controlled::default());
        let cache = cache_over(backend.clone(), deferred());
        cache.put("p:1", player("Alice", 1)).await.unwrap();

        backend.hold.store(true, Ordering::SeqCst);
        let flushing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.flush().await })
        };
        backend.entered.notified().await;
        assert_eq!(cache.entry("p:1").unwrap().state(), EntryState::Flushing);

        cache.put("p:1", player("Alice", 2)).await.unwrap();
        backend.hold.store(false, Ordering::SeqCst);
        backend.release.notify_one();
        assert_eq!(flushing.await.unwrap().flushed, 1);

        let entry = cache.entry("p:1").unwrap();
        assert_eq!(entry.state(), EntryState::Dirty);
        assert_eq!(backend.inner.retrieve("p:1").await.unwrap().get("score"), Some(&1.into()));

        cache.flush().await;
        assert_eq!(entry.state(), EntryState::Clean);
        assert_eq!(backend.inner.retrieve("p:1").await.unwrap().get("score"), Some(&2.into()));
    }

    #[tokio::test]
    async fn remove_drops_entry_even_when_delete_fails() {
        let backend = Arc::new(Controlled::default());
        let cache = cache_over(backend.clone(), deferred());
        let entry = cache.put("p:1", player("Alice", 1)).await.unwrap();
        cache.flush().await;

        backend.failing.store(true, Ordering::SeqCst);
        assert!(cache.remove("p:1").await.is_err());
        assert!(!cache.contains("p:1"));
        assert_eq!(entry.state(), EntryState::Removed);

        entry.set(player("Alice", 9));
        assert_eq!(entry.state(), EntryState::Removed);
        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.flush().await.attempted, 0);
    }

    #[tokio::test]
    async fn hooks_gate_cache_operations() {
        let backend = Arc::new(MemoryContainer::new());
        let mut hooks = HookRegistry::new();
        hooks
            .before(Operation::Store, |ctx| {
                match ctx.object.and_then(|o| o.get("score")) {
                    Some(crate::value::Value::Int(score)) if *score < 0 => {
                        HookDecision::veto("negative score")
                    }
                    _ => HookDecision::Proceed,
                }
            })
            .before(Operation::Delete, |_| HookDecision::veto("read only"));
        let cache: Cache<Player> = Cache::builder(backend.clone())
            .settings(deferred())
            .hooks(hooks)
            .build();

        cache.put("p:1", player("Alice", -1)).await.unwrap();
        let report = cache.flush().await;
        assert_eq!(report.failed, 1);
        assert!(backend.is_empty());
        assert_eq!(cache.entry("p:1").unwrap().state(), EntryState::Dirty);

        cache.put("p:1", player("Alice", 1)).await.unwrap();
        cache.flush().await;
        assert!(matches!(
            cache.remove("p:1").await,
            Err(StorageError::HookRejected { .. })
        ));
        assert!(cache.contains("p:1"));
        assert!(backend.contains("p:1").await.unwrap());
    }

    #[tokio::test]
    async fn update_loads_and_edits() {
        let backend = Arc::new(MemoryContainer::new());
        backend
            .store("p:1", &DecomposedObject::new().with("name", "Alice").with("score", 1))
            .await
            .unwrap();
        let cache = cache_over(backend, deferred());

        let entry = cache.update("p:1", |p| p.score += 10).await.unwrap().unwrap();
        assert_eq!(entry.value().score, 11);
        assert_eq!(entry.state(), EntryState::Dirty);
        assert!(cache.update("p:404", |p| p.score = 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_clean_entries_are_evicted_after_flush() {
        let backend = Arc::new(MemoryContainer::new());
        let settings = StorageSettings::builder()
            .eviction_idle(Some(Duration::from_millis(10)))
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);
        cache.put("p:1", player("Alice", 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = cache.flush().await;
        assert_eq!((report.flushed, report.evicted), (1, 1));
        assert!(cache.is_empty());
        assert!(backend.contains("p:1").await.unwrap());
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn clear_keeps_unwritten_entries() {
        let backend = Arc::new(MemoryContainer::new());
        let cache = cache_over(backend, deferred());
        cache.put("p:1", player("Alice", 1)).await.unwrap();
        cache.flush().await;
        cache.put("p:2", player("Bob", 2)).await.unwrap();

        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.keys(), vec!["p:2"]);
    }

    #[tokio::test]
    async fn parallel_flush_writes_everything() {
        let backend = Arc::new(MemoryContainer::new());
        let settings = StorageSettings::builder()
            .flush_mode(FlushMode::Parallel)
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);
        for i in 0..20 {
            cache.put(&format!("p:{i}"), player("P", i)).await.unwrap();
        }
        assert_eq!(cache.flush().await.flushed, 20);
        assert_eq!(backend.len(), 20);
    }

    #[tokio::test]
    async fn background_task_flushes_and_stops() {
        let backend = Arc::new(MemoryContainer::new());
        let settings = StorageSettings::builder()
            .flush_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);
        let task = cache.start_flush_task().unwrap();

        cache.put("p:1", player("Alice", 1)).await.unwrap();
        for _ in 0..100 {
            if backend.contains("p:1").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.contains("p:1").await.unwrap());
        task.stop().await.unwrap();

        let disabled = cache_over(
            Arc::new(MemoryContainer::new()),
            StorageSettings::builder()
                .flush_interval(Duration::ZERO)
                .build()
                .unwrap(),
        );
        assert!(disabled.start_flush_task().is_none());
    }

    #[tokio::test]
    async fn remove_during_load_does_not_resurrect_the_key() {
        let backend = Arc::new(Controlled::default());
        backend.inner.store("p:1", &player("Alice", 1).decompose()).await.unwrap();
        let cache = cache_over(backend.clone(), deferred());

        backend.hold_retrieve.store(true, Ordering::SeqCst);
        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("p:1").await })
        };
        backend.entered.notified().await;
        backend.hold_retrieve.store(false, Ordering::SeqCst);

        let removing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.remove("p:1").await })
        };
        // Let the remove run as far as it can while the load is held.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        backend.release.notify_one();

        let loaded = loading.await.unwrap().unwrap().unwrap();
        removing.await.unwrap().unwrap();

        assert_eq!(loaded.value().score, 1);
        assert!(!backend.inner.contains("p:1").await.unwrap());
        assert!(!cache.contains("p:1"));
        assert!(cache.update("p:1", |p| p.score = 9).await.unwrap().is_none());
        assert!(!backend.inner.contains("p:1").await.unwrap());
    }

    #[tokio::test]
    async fn get_or_falls_back_without_caching() {
        let backend = Arc::new(MemoryContainer::new());
        let cache = cache_over(backend.clone(), deferred());

        let value = cache.get_or("p:1", player("Nobody", 0)).await.unwrap();
        assert_eq!(*value, player("Nobody", 0));
        assert!(cache.is_empty());

        cache.put("p:1", player("Alice", 3)).await.unwrap();
        let value = cache.get_or("p:1", player("Nobody", 0)).await.unwrap();
        assert_eq!(value.score, 3);
    }

    #[tokio::test]
    async fn put_all_and_remove_all() {
        let backend = Arc::new(MemoryContainer::new());
        let cache = cache_over(backend.clone(), deferred());

        let entries = cache
            .put_all(vec![
                ("p:1".to_string(), player("Alice", 1)),
                ("p:2".to_string(), player("Bob", 2)),
            ])
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(cache.flush().await.flushed, 2);
        assert_eq!(backend.keys().await.unwrap(), vec!["p:1", "p:2"]);

        cache.remove_all(["p:1", "p:2"]).await.unwrap();
        assert!(cache.is_empty());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn cache_on_store_off_releases_written_entries() {
        let backend = Arc::new(Controlled::default());
        let settings = StorageSettings::builder()
            .cache_on_store(false)
            .eviction_idle(None)
            .build()
            .unwrap();
        let cache = cache_over(backend.clone(), settings);

        let entry = cache.put("p:1", player("Alice", 1)).await.unwrap();
        assert!(cache.contains("p:1"));

        backend.failing.store(true, Ordering::SeqCst);
        assert_eq!(cache.flush().await.failed, 1);
        assert!(cache.contains("p:1"));

        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.flush().await.flushed, 1);
        assert_eq!(entry.state(), EntryState::Clean);
        assert!(!cache.contains("p:1"));
        assert!(backend.inner.contains("p:1").await.unwrap());

        // Loads are still cached.
        cache.get("p:1").await.unwrap().unwrap();
        assert!(cache.contains("p:1"));
    }

    #[tokio::test]
    async fn cache_disabled_writes_inline_and_keeps_nothing() {
        let backend = Arc::new(MemoryContainer::new());
        let settings = StorageSettings::builder().uses_cache(false).build().unwrap();
        let cache = cache_over(backend.clone(), settings);

        cache.put("p:1", player("Alice", 1)).await.unwrap();
        assert!(backend.contains("p:1").await.unwrap());
        assert!(cache.is_empty());

        let loaded = cache.get("p:1").await.unwrap().unwrap();
        assert_eq!(loaded.value().name, "Alice");
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats::default();
        CacheStats::record(&stats.hits, 3);
        CacheStats::record(&stats.misses, 1);
        assert_eq!(
            stats.to_string(),
            "hits=3 misses=1 rate=75.00% flushes=0 failures=0 evictions=0"
        );
        stats.reset();
        assert_eq!(stats.hits(), 0);
    }
}
