//! Lazily hydrated caches over the durable key-value store.
//!
//! Every durable value lives in its own cache slot and under its own top-level
//! key. A slot starts [`Slot::Unloaded`] and is read from the store on first
//! use; "never read" and "read, and empty" stay distinguishable.
//!
//! Mutations only touch memory and call [`StorageManager::schedule_write`].
//! Writes are coalesced: the first request arms a timer, later requests within
//! the interval are absorbed, and on expiry every loaded slot is written in a
//! single batch. Requests that arrive while a batch is in flight set a pending
//! flag and the flush loop goes around again instead of waiting for a new
//! timer.
//!
//! ```text
//! schedule_write ──► timer armed ──interval──► [write_lock] loop { write all } while pending
//!                                                   │ error
//!                                                   └──► re-arm after backoff
//! ```

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::history::NavigationHistory;
use crate::host::KeyValueStore;
use crate::pinned::PinnedTabs;
use crate::relations::RelationLog;
use crate::settings::Settings;
use crate::signature::normalize_url;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Keys
// =============================================================================

pub const RELATIONS_KEY: &str = "persistentTabTree";
pub const SCROLL_POSITIONS_KEY: &str = "scrollPositions";
pub const PINNED_TABS_KEY: &str = "pinnedTabs";
pub const HISTORY_KEY: &str = "globalTabHistory";
pub const SETTINGS_KEY: &str = "extensionSettings";
pub const DEFAULT_RECENT_FILTER_KEY: &str = "defaultRecentFilter";

// =============================================================================
// Slot
// =============================================================================

/// A cache that is either not yet read or holds a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    Unloaded,
    Loaded(T),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::Unloaded
    }
}

impl<T> Slot<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn as_ref(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            Self::Unloaded => None,
        }
    }

    pub fn as_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Loaded(value) => Some(value),
            Self::Unloaded => None,
        }
    }

    pub fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Self::Loaded(value) => Some(value),
            Self::Unloaded => None,
        }
    }
}

// =============================================================================
// Scroll positions
// =============================================================================

/// Scroll offsets of a page, keyed by normalized URL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPosition {
    pub scroll_top: f64,
    pub scroll_left: f64,
    /// Epoch milliseconds of the last save
    #[serde(default)]
    pub timestamp: u64,
}

pub type ScrollPositions = BTreeMap<String, ScrollPosition>;

// =============================================================================
// Cache plumbing
// =============================================================================

#[derive(Debug, Default)]
struct Caches {
    relations: Slot<RelationLog>,
    scroll_positions: Slot<ScrollPositions>,
    pinned: Slot<PinnedTabs>,
    history: Slot<NavigationHistory>,
}

trait Cached: Serialize + DeserializeOwned + Default + Send + 'static {
    const KEY: &'static str;
    fn slot(caches: &mut Caches) -> &mut Slot<Self>;
}

impl Cached for RelationLog {
    const KEY: &'static str = RELATIONS_KEY;
    fn slot(caches: &mut Caches) -> &mut Slot<Self> {
        &mut caches.relations
    }
}

impl Cached for ScrollPositions {
    const KEY: &'static str = SCROLL_POSITIONS_KEY;
    fn slot(caches: &mut Caches) -> &mut Slot<Self> {
        &mut caches.scroll_positions
    }
}

impl Cached for PinnedTabs {
    const KEY: &'static str = PINNED_TABS_KEY;
    fn slot(caches: &mut Caches) -> &mut Slot<Self> {
        &mut caches.pinned
    }
}

impl Cached for NavigationHistory {
    const KEY: &'static str = HISTORY_KEY;
    fn slot(caches: &mut Caches) -> &mut Slot<Self> {
        &mut caches.history
    }
}

struct StorageInner {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
    caches: Mutex<Caches>,
    default_recent_filter: Mutex<Option<bool>>,
    writing: AtomicBool,
    pending: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// Durable state caches with coalesced batched writes. Clones share state.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<StorageInner>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("caches", &*self.inner.caches.lock())
            .field("writing", &self.inner.writing.load(Ordering::SeqCst))
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                store,
                config,
                caches: Mutex::new(Caches::default()),
                default_recent_filter: Mutex::new(None),
                writing: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                timer: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    // -------------------------------------------------------------------------
    // Hydration
    // -------------------------------------------------------------------------

    async fn hydrate<T: Cached>(&self) -> Result<(), StorageError> {
        if T::slot(&mut self.inner.caches.lock()).is_loaded() {
            return Ok(());
        }
        let mut repaired = false;
        let stored = match self.inner.store.get(&[T::KEY]).await {
            Ok(mut found) => found.remove(T::KEY),
            Err(StorageError::Read { reason, .. }) => {
                warn!(key = T::KEY, error = %reason, "stored value is unreadable, starting empty");
                repaired = true;
                None
            }
            Err(err) => return Err(err),
        };
        let value = match stored {
            Some(Value::Null) | None => T::default(),
            Some(raw) => serde_json::from_value(raw).unwrap_or_else(|err| {
                warn!(key = T::KEY, error = %err, "stored value is malformed, starting empty");
                repaired = true;
                T::default()
            }),
        };
        let hydrated = {
            let mut caches = self.inner.caches.lock();
            let slot = T::slot(&mut caches);
            // A concurrent hydration or a reset may have won the race.
            if slot.is_loaded() {
                false
            } else {
                *slot = Slot::Loaded(value);
                true
            }
        };
        if hydrated {
            debug!(key = T::KEY, repaired, "cache hydrated");
            if repaired {
                // Overwrite the bad value on the next flush.
                self.schedule_write();
            }
        }
        Ok(())
    }

    async fn view<T: Cached, R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if let Err(err) = self.hydrate::<T>().await {
            warn!(key = T::KEY, error = %err, "failed to read from store");
            return f(&T::default());
        }
        let mut caches = self.inner.caches.lock();
        match T::slot(&mut caches).as_ref() {
            Some(value) => f(value),
            None => f(&T::default()),
        }
    }

    async fn update<T: Cached, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if let Err(err) = self.hydrate::<T>().await {
            warn!(key = T::KEY, error = %err, "failed to read from store, change not persisted");
            return f(&mut T::default());
        }
        let result = {
            let mut caches = self.inner.caches.lock();
            let slot = T::slot(&mut caches);
            if !slot.is_loaded() {
                *slot = Slot::Loaded(T::default());
            }
            match slot.as_mut() {
                Some(value) => f(value),
                None => f(&mut T::default()),
            }
        };
        self.schedule_write();
        result
    }

    // -------------------------------------------------------------------------
    // Named caches
    // -------------------------------------------------------------------------

    pub async fn relation_log<R>(&self, f: impl FnOnce(&RelationLog) -> R) -> R {
        self.view(f).await
    }

    /// Mutate the relation log and schedule a write.
    pub async fn update_relation_log<R>(&self, f: impl FnOnce(&mut RelationLog) -> R) -> R {
        self.update(f).await
    }

    pub async fn pinned_tabs<R>(&self, f: impl FnOnce(&PinnedTabs) -> R) -> R {
        self.view(f).await
    }

    pub async fn update_pinned_tabs<R>(&self, f: impl FnOnce(&mut PinnedTabs) -> R) -> R {
        self.update(f).await
    }

    pub async fn history<R>(&self, f: impl FnOnce(&NavigationHistory) -> R) -> R {
        self.view(f).await
    }

    pub async fn update_history<R>(&self, f: impl FnOnce(&mut NavigationHistory) -> R) -> R {
        self.update(f).await
    }

    /// Start a fresh history; ids from a previous session are meaningless.
    pub fn reset_history(&self, history: NavigationHistory) {
        self.inner.caches.lock().history = Slot::Loaded(history);
    }

    /// Drop the cached pin registry so the next read goes to the store.
    pub fn invalidate_pinned_tabs(&self) {
        self.inner.caches.lock().pinned = Slot::Unloaded;
    }

    // -------------------------------------------------------------------------
    // Scroll positions
    // -------------------------------------------------------------------------

    pub async fn save_scroll_position(&self, url: &str, scroll_top: f64, scroll_left: f64) {
        let position = ScrollPosition {
            scroll_top,
            scroll_left,
            timestamp: crate::epoch_ms(),
        };
        let key = normalize_url(url);
        self.update(|positions: &mut ScrollPositions| {
            positions.insert(key, position);
        })
        .await;
    }

    pub async fn scroll_position(&self, url: &str) -> Option<ScrollPosition> {
        let key = normalize_url(url);
        self.view(|positions: &ScrollPositions| positions.get(&key).copied())
            .await
    }

    /// Answer from memory only. When the cache is cold a background load is
    /// started and `None` is returned.
    pub fn cached_scroll_position(&self, url: &str) -> Option<ScrollPosition> {
        let key = normalize_url(url);
        let cached = {
            let caches = self.inner.caches.lock();
            caches
                .scroll_positions
                .as_ref()
                .map(|positions| positions.get(&key).copied())
        };
        match cached {
            Some(position) => position,
            None => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.hydrate::<ScrollPositions>().await {
                            warn!(key = SCROLL_POSITIONS_KEY, error = %err, "background load failed");
                        }
                    });
                }
                None
            }
        }
    }

    pub async fn remove_scroll_position(&self, url: &str) -> bool {
        let key = normalize_url(url);
        self.update(|positions: &mut ScrollPositions| positions.remove(&key).is_some())
            .await
    }

    /// Drop scroll positions saved more than `retention_ms` ago.
    pub async fn cleanup_old_scroll_positions(&self, retention_ms: u64) -> usize {
        let cutoff = crate::epoch_ms().saturating_sub(retention_ms);
        let removed = self
            .update(|positions: &mut ScrollPositions| {
                let before = positions.len();
                positions.retain(|_, position| position.timestamp >= cutoff);
                before - positions.len()
            })
            .await;
        if removed > 0 {
            info!(removed, "cleaned up old scroll positions");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Directly written keys
    // -------------------------------------------------------------------------

    pub async fn load_settings(&self) -> Result<Settings, StorageError> {
        let mut found = self.inner.store.get(&[SETTINGS_KEY]).await?;
        match found.remove(SETTINGS_KEY) {
            Some(Value::Object(map)) => Ok(map),
            Some(Value::Null) | None => Ok(Settings::new()),
            Some(other) => Err(StorageError::Read {
                key: SETTINGS_KEY.to_string(),
                reason: format!("expected an object, found {other}"),
            }),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        let items = HashMap::from([(SETTINGS_KEY.to_string(), Value::Object(settings.clone()))]);
        self.inner.store.set(items).await
    }

    pub async fn default_recent_filter(&self) -> bool {
        if let Some(value) = *self.inner.default_recent_filter.lock() {
            return value;
        }
        let value = match self.inner.store.get(&[DEFAULT_RECENT_FILTER_KEY]).await {
            Ok(mut found) => found
                .remove(DEFAULT_RECENT_FILTER_KEY)
                .is_some_and(|v| truthy(&v)),
            Err(err) => {
                warn!(key = DEFAULT_RECENT_FILTER_KEY, error = %err, "failed to read preference");
                return false;
            }
        };
        *self.inner.default_recent_filter.lock() = Some(value);
        value
    }

    /// Persisted immediately, bypassing write coalescing.
    pub async fn set_default_recent_filter(&self, value: bool) -> Result<(), StorageError> {
        *self.inner.default_recent_filter.lock() = Some(value);
        let items = HashMap::from([(DEFAULT_RECENT_FILTER_KEY.to_string(), Value::Bool(value))]);
        self.inner.store.set(items).await
    }

    // -------------------------------------------------------------------------
    // Write coalescing
    // -------------------------------------------------------------------------

    /// Request a batched write of every loaded cache.
    pub fn schedule_write(&self) {
        if self.inner.writing.load(Ordering::SeqCst) {
            self.inner.pending.store(true, Ordering::SeqCst);
            return;
        }
        self.arm(self.inner.config.flush_interval());
    }

    fn arm(&self, delay: Duration) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let this = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_flush_cycle().await;
        }));
    }

    async fn run_flush_cycle(&self) {
        self.inner.timer.lock().take();
        let _guard = self.inner.write_lock.lock().await;
        loop {
            self.inner.pending.store(false, Ordering::SeqCst);
            self.inner.writing.store(true, Ordering::SeqCst);
            let result = self.write_loaded().await;
            self.inner.writing.store(false, Ordering::SeqCst);
            if let Err(err) = result {
                let backoff = self.inner.config.retry_backoff();
                warn!(
                    error = %err,
                    retry_in_ms = backoff.as_millis() as u64,
                    "batched write failed, retrying"
                );
                self.arm(backoff);
                return;
            }
            if !self.inner.pending.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Write every loaded cache now, cancelling any armed timer and waiting
    /// for an in-flight batch to finish first.
    pub async fn force_write(&self) -> Result<(), StorageError> {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        let _guard = self.inner.write_lock.lock().await;
        self.inner.pending.store(false, Ordering::SeqCst);
        self.write_loaded().await
    }

    /// Cancel the armed timer without writing.
    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
    }

    async fn write_loaded(&self) -> Result<(), StorageError> {
        let items = {
            let caches = self.inner.caches.lock();
            let mut items = HashMap::new();
            snapshot_into(&mut items, &caches.relations)?;
            snapshot_into(&mut items, &caches.scroll_positions)?;
            snapshot_into(&mut items, &caches.pinned)?;
            snapshot_into(&mut items, &caches.history)?;
            items
        };
        if items.is_empty() {
            return Ok(());
        }
        let keys = items.len();
        self.inner.store.set(items).await?;
        debug!(keys, "batched write complete");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn relations_loaded(&self) -> bool {
        self.inner.caches.lock().relations.is_loaded()
    }
}

fn snapshot_into<T: Cached>(
    items: &mut HashMap<String, Value>,
    slot: &Slot<T>,
) -> Result<(), StorageError> {
    if let Some(value) = slot.as_ref() {
        let json = serde_json::to_value(value).map_err(|e| StorageError::Write(e.to_string()))?;
        items.insert(T::KEY.to_string(), json);
    }
    Ok(())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
