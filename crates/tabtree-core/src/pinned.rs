//! URL-keyed registry of tabs pinned to the top of the tree.
//!
//! Pins are stored by normalized URL so they survive restarts. A derived
//! `tab id -> pin` view is rebuilt lazily against the live tab list and is
//! dropped whenever pins or tabs change.

use crate::config::PinnedConfig;
use crate::host::{TabHost, TabQuery};
use crate::model::TabId;
use crate::signature::{is_pinnable_url, normalize_url};
use crate::storage::{Slot, StorageManager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A stored pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedEntry {
    /// URL as given when pinned
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Epoch milliseconds when pinned
    pub timestamp: u64,
}

/// Durable pins keyed by normalized URL.
pub type PinnedTabs = BTreeMap<String, PinnedEntry>;

/// Live tabs that match a pin.
pub type PinnedTabIds = BTreeMap<TabId, PinnedEntry>;

/// What a UI surface sends when pinning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

struct PinnedInner {
    storage: StorageManager,
    host: Arc<dyn TabHost>,
    config: PinnedConfig,
    ids: Mutex<Slot<PinnedTabIds>>,
}

#[derive(Clone)]
pub struct PinnedRegistry {
    inner: Arc<PinnedInner>,
}

impl std::fmt::Debug for PinnedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedRegistry")
            .field("config", &self.inner.config)
            .field("ids", &*self.inner.ids.lock())
            .finish_non_exhaustive()
    }
}

impl PinnedRegistry {
    pub fn new(storage: StorageManager, host: Arc<dyn TabHost>, config: PinnedConfig) -> Self {
        Self {
            inner: Arc::new(PinnedInner {
                storage,
                host,
                config,
                ids: Mutex::new(Slot::Unloaded),
            }),
        }
    }

    /// Resolve the URL to pin: the request's URL, else the tab's own.
    async fn resolve_url(&self, tab_id: TabId, requested: &str) -> Option<String> {
        if !requested.trim().is_empty() {
            return Some(requested.to_string());
        }
        match self.inner.host.get_tab(tab_id).await {
            Ok(tab) => Some(tab.effective_url().to_string()),
            Err(err) => {
                debug!(tab_id = %tab_id, error = %err, "cannot resolve tab url");
                None
            }
        }
    }

    pub async fn add_pinned_tab(&self, tab_id: TabId, request: &PinRequest) -> bool {
        let Some(url) = self.resolve_url(tab_id, &request.url).await else {
            return false;
        };
        let key = normalize_url(&url);
        if !is_pinnable_url(&key) {
            debug!(tab_id = %tab_id, url = %key, "url cannot be pinned");
            return false;
        }
        let entry = PinnedEntry {
            url,
            title: request.title.clone(),
            timestamp: crate::epoch_ms(),
        };
        self.inner
            .storage
            .update_pinned_tabs(|pins| {
                pins.insert(key.clone(), entry);
            })
            .await;
        self.invalidate();
        info!(tab_id = %tab_id, url = %key, "tab pinned");
        true
    }

    pub async fn remove_pinned_tab(&self, tab_id: TabId) -> bool {
        let Some(url) = self.resolve_url(tab_id, "").await else {
            return false;
        };
        let key = normalize_url(&url);
        let removed = self
            .inner
            .storage
            .update_pinned_tabs(|pins| pins.remove(&key).is_some())
            .await;
        if removed {
            self.invalidate();
            info!(tab_id = %tab_id, url = %key, "tab unpinned");
        }
        removed
    }

    pub async fn is_pinned_tab(&self, tab_id: TabId) -> bool {
        let Ok(tab) = self.inner.host.get_tab(tab_id).await else {
            return false;
        };
        let key = normalize_url(tab.effective_url());
        self.inner
            .storage
            .pinned_tabs(|pins| pins.contains_key(&key))
            .await
    }

    pub async fn pinned_tabs(&self) -> PinnedTabs {
        self.inner.storage.pinned_tabs(|pins| pins.clone()).await
    }

    pub async fn pinned_urls(&self) -> Vec<String> {
        self.inner
            .storage
            .pinned_tabs(|pins| pins.keys().cloned().collect())
            .await
    }

    /// Live tabs matching a pin, rebuilt when invalidated.
    pub async fn pinned_tab_ids(&self) -> PinnedTabIds {
        if let Some(ids) = self.inner.ids.lock().as_ref() {
            return ids.clone();
        }
        let pins = self.pinned_tabs().await;
        let mut ids = PinnedTabIds::new();
        if !pins.is_empty() {
            match self.inner.host.query_tabs(TabQuery::all()).await {
                Ok(tabs) => {
                    for tab in tabs {
                        if let Some(entry) = pins.get(&normalize_url(tab.effective_url())) {
                            ids.insert(tab.id, entry.clone());
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "cannot enumerate tabs for pin view");
                    return ids;
                }
            }
        }
        *self.inner.ids.lock() = Slot::Loaded(ids.clone());
        debug!(tabs = ids.len(), "pinned tab view rebuilt");
        ids
    }

    /// Drop the derived `tab id -> pin` view.
    pub fn invalidate(&self) {
        *self.inner.ids.lock() = Slot::Unloaded;
    }

    /// Remove pins whose URL matches no open tab.
    pub async fn cleanup_invalid_pinned_tabs(&self) -> usize {
        let tabs = match self.inner.host.query_tabs(TabQuery::all()).await {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(error = %err, "cannot enumerate tabs, pin cleanup skipped");
                return 0;
            }
        };
        let open: HashSet<String> = tabs
            .iter()
            .map(|t| normalize_url(t.effective_url()))
            .collect();
        let removed = self
            .inner
            .storage
            .update_pinned_tabs(|pins| {
                let before = pins.len();
                pins.retain(|url, _| open.contains(url));
                before - pins.len()
            })
            .await;
        if removed > 0 {
            self.invalidate();
            info!(removed, "pins without open tabs removed");
        }
        removed
    }

    /// Remove pins older than the retention window.
    pub async fn cleanup_expired_pinned_tabs(&self) -> usize {
        let cutoff = crate::epoch_ms().saturating_sub(self.inner.config.retention_ms());
        let removed = self
            .inner
            .storage
            .update_pinned_tabs(|pins| {
                let before = pins.len();
                pins.retain(|_, entry| entry.timestamp >= cutoff);
                before - pins.len()
            })
            .await;
        if removed > 0 {
            self.invalidate();
            info!(removed, "expired pins removed");
        }
        removed
    }
}
