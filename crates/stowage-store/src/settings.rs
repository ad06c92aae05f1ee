//! Cache settings.
//!
//! [`StorageSettings`] is immutable once built and shared by reference
//! (`Arc<StorageSettings>`) between every cache that uses it. It can be
//! built in code through [`StorageSettings::builder`] or parsed from TOML
//! using the camelCase keys below (all optional):
//!
//! ```toml
//! flushIntervalMillis = 300000   # 0 disables the background flush cycle
//! writeMode = "deferred"         # or "synchronous"
//! evictionIdleMillis = 60000     # 0 disables idle eviction
//! flushMode = "sequential"       # or "parallel"
//! maxFlushFailures = 5
//! usesCache = true               # false writes every put inline and keeps nothing
//! cacheOnRetrieve = true
//! cacheOnStore = true            # false drops an entry once its write lands
//! lockTimeoutMillis = 5000
//! retryAttempts = 3
//! retryBaseDelayMillis = 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::retry::RetryPolicy;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_EVICTION_IDLE: Duration = Duration::from_secs(60);
const DEFAULT_MAX_FLUSH_FAILURES: u32 = 5;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// When a `put` reaches the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Writes are persisted by the next flush cycle.
    #[default]
    Deferred,
    /// Writes are persisted inline; `put` returns after the backend confirms.
    Synchronous,
}

/// How a flush cycle walks the dirty entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    #[default]
    Sequential,
    /// All dirty entries are written concurrently.
    Parallel,
}

/// Immutable cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawSettings")]
pub struct StorageSettings {
    flush_interval: Option<Duration>,
    write_mode: WriteMode,
    eviction_idle: Option<Duration>,
    flush_mode: FlushMode,
    max_flush_failures: u32,
    uses_cache: bool,
    cache_on_retrieve: bool,
    cache_on_store: bool,
    lock_timeout: Duration,
    retry: RetryPolicy,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            write_mode: WriteMode::Deferred,
            eviction_idle: Some(DEFAULT_EVICTION_IDLE),
            flush_mode: FlushMode::Sequential,
            max_flush_failures: DEFAULT_MAX_FLUSH_FAILURES,
            uses_cache: true,
            cache_on_retrieve: true,
            cache_on_store: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl StorageSettings {
    pub fn builder() -> StorageSettingsBuilder {
        StorageSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> StorageResult<Self> {
        toml::from_str(text).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "storage settings loaded");
        Ok(settings)
    }

    /// Period of the background flush cycle; `None` means never.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    /// Effective write mode. A cache that keeps nothing writes inline.
    pub fn write_mode(&self) -> WriteMode {
        if self.uses_cache {
            self.write_mode
        } else {
            WriteMode::Synchronous
        }
    }

    /// Idle time after which a clean entry is evicted; `None` disables eviction.
    pub fn eviction_idle(&self) -> Option<Duration> {
        self.eviction_idle
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    /// Consecutive flush failures after which an entry enters the error state.
    pub fn max_flush_failures(&self) -> u32 {
        self.max_flush_failures
    }

    /// Whether caches retain objects at all. When off, `cacheOnRetrieve`
    /// and `cacheOnStore` are ignored and every write goes through inline.
    pub fn uses_cache(&self) -> bool {
        self.uses_cache
    }

    /// Whether values loaded on a miss are kept in the cache.
    pub fn cache_on_retrieve(&self) -> bool {
        self.uses_cache && self.cache_on_retrieve
    }

    /// Whether a written entry stays in memory after its write succeeds.
    pub fn cache_on_store(&self) -> bool {
        self.uses_cache && self.cache_on_store
    }

    /// Bound on the wait for a document lock.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Backoff policy for transient backend failures.
    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

/// Builder for [`StorageSettings`].
#[derive(Debug, Clone)]
pub struct StorageSettingsBuilder {
    settings: StorageSettings,
}

impl StorageSettingsBuilder {
    /// `Duration::ZERO` disables the background flush cycle.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.settings.flush_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.settings.write_mode = mode;
        self
    }

    /// `None` or `Duration::ZERO` disables idle eviction.
    pub fn eviction_idle(mut self, idle: Option<Duration>) -> Self {
        self.settings.eviction_idle = idle.filter(|d| !d.is_zero());
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.settings.flush_mode = mode;
        self
    }

    pub fn max_flush_failures(mut self, failures: u32) -> Self {
        self.settings.max_flush_failures = failures;
        self
    }

    pub fn uses_cache(mut self, yes: bool) -> Self {
        self.settings.uses_cache = yes;
        self
    }

    pub fn cache_on_retrieve(mut self, yes: bool) -> Self {
        self.settings.cache_on_retrieve = yes;
        self
    }

    pub fn cache_on_store(mut self, yes: bool) -> Self {
        self.settings.cache_on_store = yes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.settings.lock_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry = policy;
        self
    }

    pub fn build(self) -> StorageResult<StorageSettings> {
        let s = self.settings;
        if s.max_flush_failures == 0 {
            return Err(StorageError::Config("maxFlushFailures must be at least 1".into()));
        }
        if s.lock_timeout.is_zero() {
            return Err(StorageError::Config("lockTimeoutMillis must be positive".into()));
        }
        if s.retry.attempts() == 0 {
            return Err(StorageError::Config("retryAttempts must be at least 1".into()));
        }
        Ok(s)
    }
}

/// On-disk shape of [`StorageSettings`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSettings {
    flush_interval_millis: Option<u64>,
    write_mode: Option<WriteMode>,
    eviction_idle_millis: Option<u64>,
    flush_mode: Option<FlushMode>,
    max_flush_failures: Option<u32>,
    uses_cache: Option<bool>,
    cache_on_retrieve: Option<bool>,
    cache_on_store: Option<bool>,
    lock_timeout_millis: Option<u64>,
    retry_attempts: Option<u32>,
    retry_base_delay_millis: Option<u64>,
}

impl TryFrom<RawSettings> for StorageSettings {
    type Error = StorageError;

    fn try_from(raw: RawSettings) -> StorageResult<Self> {
        let defaults = Self::default();
        let mut builder = Self::builder();
        if let Some(ms) = raw.flush_interval_millis {
            builder = builder.flush_interval(Duration::from_millis(ms));
        }
        if let Some(mode) = raw.write_mode {
            builder = builder.write_mode(mode);
        }
        if let Some(ms) = raw.eviction_idle_millis {
            builder = builder.eviction_idle(Some(Duration::from_millis(ms)));
        }
        if let Some(mode) = raw.flush_mode {
            builder = builder.flush_mode(mode);
        }
        if let Some(n) = raw.max_flush_failures {
            builder = builder.max_flush_failures(n);
        }
        if let Some(yes) = raw.uses_cache {
            builder = builder.uses_cache(yes);
        }
        if let Some(yes) = raw.cache_on_retrieve {
            builder = builder.cache_on_retrieve(yes);
        }
        if let Some(yes) = raw.cache_on_store {
            builder = builder.cache_on_store(yes);
        }
        if let Some(ms) = raw.lock_timeout_millis {
            builder = builder.lock_timeout(Duration::from_millis(ms));
        }
        let retry = RetryPolicy::new(
            raw.retry_attempts.unwrap_or(defaults.retry.attempts()),
            raw.retry_base_delay_millis
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay()),
        );
        builder.retry(retry).build()
    }
}

// ── tests ────────────────────────────────────────────────────────────
