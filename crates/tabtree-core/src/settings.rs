//! Time-boxed cache over the extension settings object.
//!
//! Feature flags default to enabled. Only a literal `false` turns a feature
//! off; a missing key, `null`, or any other value leaves it on.

use crate::storage::StorageManager;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The stored settings object.
pub type Settings = Map<String, Value>;

/// Flags consulted by the background service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Rebuild tab relations from the durable log
    AutoRestore,
    /// Activate a sibling when the active tab is closed
    SmartSwitch,
}

impl Feature {
    pub const ALL: [Self; 2] = [Self::AutoRestore, Self::SmartSwitch];

    pub fn key(self) -> &'static str {
        match self {
            Self::AutoRestore => "autoRestore",
            Self::SmartSwitch => "smartSwitch",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }
}

/// Settings used when nothing has been read yet.
pub fn default_settings() -> Settings {
    Feature::ALL
        .into_iter()
        .map(|f| (f.key().to_string(), Value::Bool(true)))
        .collect()
}

/// Whether `name` is enabled in `settings`.
pub fn flag_enabled(settings: &Settings, name: &str) -> bool {
    !matches!(settings.get(name), Some(Value::Bool(false)))
}

#[derive(Debug)]
struct CachedSettings {
    settings: Settings,
    fetched_at: Instant,
}

struct SettingsInner {
    storage: StorageManager,
    ttl: Duration,
    cached: Mutex<Option<CachedSettings>>,
    refresh: tokio::sync::Mutex<()>,
}

/// Settings cache. Clones share one cache and one in-flight refresh.
#[derive(Clone)]
pub struct SettingsCache {
    inner: Arc<SettingsInner>,
}

impl std::fmt::Debug for SettingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsCache")
            .field("ttl", &self.inner.ttl)
            .field("cached", &*self.inner.cached.lock())
            .finish_non_exhaustive()
    }
}

impl SettingsCache {
    pub fn new(storage: StorageManager, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(SettingsInner {
                storage,
                ttl,
                cached: Mutex::new(None),
                refresh: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn fresh(&self) -> Option<Settings> {
        let cached = self.inner.cached.lock();
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.inner.ttl)
            .map(|c| c.settings.clone())
    }

    fn best_available(&self) -> Settings {
        self.inner
            .cached
            .lock()
            .as_ref()
            .map_or_else(default_settings, |c| c.settings.clone())
    }

    /// Current settings, reading the store at most once per TTL.
    ///
    /// Concurrent callers during a read share its result. A failed read
    /// answers with the best value available.
    pub async fn settings(&self) -> Settings {
        if let Some(settings) = self.fresh() {
            return settings;
        }
        let _refresh = self.inner.refresh.lock().await;
        if let Some(settings) = self.fresh() {
            return settings;
        }
        match self.inner.storage.load_settings().await {
            Ok(settings) => {
                *self.inner.cached.lock() = Some(CachedSettings {
                    settings: settings.clone(),
                    fetched_at: Instant::now(),
                });
                debug!(keys = settings.len(), "settings refreshed");
                settings
            }
            Err(err) => {
                warn!(error = %err, "failed to load settings, using cached or default values");
                self.best_available()
            }
        }
    }

    /// Non-blocking flag check. A stale cache triggers a background refresh
    /// and the answer comes from whatever is available now.
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        if let Some(settings) = self.fresh() {
            return flag_enabled(&settings, name);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            let this = self.clone();
            tokio::spawn(async move {
                this.settings().await;
            });
        }
        flag_enabled(&self.best_available(), name)
    }

    /// Flag check that waits for a refresh when the cache is stale.
    pub async fn is_feature_enabled_sync(&self, name: &str) -> bool {
        flag_enabled(&self.settings().await, name)
    }

    pub async fn feature(&self, feature: Feature) -> bool {
        self.is_feature_enabled_sync(feature.key()).await
    }

    /// Forget the cached copy; the next check reads the store.
    pub fn invalidate(&self) {
        *self.inner.cached.lock() = None;
        debug!("settings cache invalidated");
    }

    /// Replace the cached copy with a known-current value.
    pub fn update(&self, settings: Settings) {
        *self.inner.cached.lock() = Some(CachedSettings {
            settings,
            fetched_at: Instant::now(),
        });
    }
}
