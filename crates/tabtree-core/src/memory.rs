//! In-memory host and store, used by tests and `tt replay`.

use crate::error::{HostError, StorageError};
use crate::events::BrowserEvent;
use crate::host::{KeyValueStore, TabHost, TabQuery};
use crate::model::{TabId, TabInfo, WindowId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A browser with windows of ordered tabs.
///
/// Indices are kept dense per window: inserting or removing a tab shifts its
/// neighbours the way a real browser does.
#[derive(Debug, Default)]
pub struct MemoryTabHost {
    tabs: Mutex<Vec<TabInfo>>,
    activations: Mutex<Vec<TabId>>,
    unavailable: AtomicBool,
}

impl MemoryTabHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tabs(tabs: impl IntoIterator<Item = TabInfo>) -> Self {
        let host = Self::new();
        for tab in tabs {
            host.insert_tab(tab);
        }
        host
    }

    /// Insert (or replace) a tab at its `index`, shifting later tabs right.
    pub fn insert_tab(&self, tab: TabInfo) {
        let mut tabs = self.tabs.lock();
        tabs.retain(|t| t.id != tab.id);
        let count = tabs.iter().filter(|t| t.window_id == tab.window_id).count();
        let index = tab.index.min(count);
        for other in tabs.iter_mut().filter(|t| t.window_id == tab.window_id) {
            if other.index >= index {
                other.index += 1;
            }
        }
        if tab.active {
            for other in tabs.iter_mut().filter(|t| t.window_id == tab.window_id) {
                other.active = false;
            }
        }
        tabs.push(TabInfo { index, ..tab });
    }

    /// Remove a tab and close the gap it leaves. Returns the removed tab.
    pub fn detach_tab(&self, id: TabId) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let pos = tabs.iter().position(|t| t.id == id)?;
        let removed = tabs.remove(pos);
        for other in tabs.iter_mut().filter(|t| t.window_id == removed.window_id) {
            if other.index > removed.index {
                other.index -= 1;
            }
        }
        Some(removed)
    }

    /// Remove every tab of a window.
    pub fn close_window(&self, window_id: WindowId) -> Vec<TabInfo> {
        let mut tabs = self.tabs.lock();
        let (closed, kept): (Vec<_>, Vec<_>) =
            tabs.drain(..).partition(|t| t.window_id == window_id);
        *tabs = kept;
        closed
    }

    /// Apply a URL change to a live tab.
    pub fn set_url(&self, id: TabId, url: &str) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let tab = tabs.iter_mut().find(|t| t.id == id)?;
        tab.url = url.to_string();
        tab.pending_url = None;
        Some(tab.clone())
    }

    pub fn snapshot(&self) -> Vec<TabInfo> {
        let mut tabs = self.tabs.lock().clone();
        tabs.sort_by_key(|t| (t.window_id, t.index));
        tabs
    }

    /// Tabs activated through [`TabHost::activate_tab`], in order.
    pub fn activations(&self) -> Vec<TabId> {
        self.activations.lock().clone()
    }

    pub fn active_tab(&self, window_id: WindowId) -> Option<TabId> {
        self.tabs
            .lock()
            .iter()
            .find(|t| t.window_id == window_id && t.active)
            .map(|t| t.id)
    }

    /// Apply an event's effect to this browser, the way the real browser
    /// would have before notifying listeners.
    pub fn apply(&self, event: &BrowserEvent) {
        match event {
            BrowserEvent::TabCreated { tab } => self.insert_tab(tab.clone()),
            BrowserEvent::TabUpdated { tab_id, change, tab } => {
                if let Some(tab) = tab {
                    self.insert_tab(tab.clone());
                } else if let Some(url) = &change.url {
                    self.set_url(*tab_id, url);
                }
            }
            BrowserEvent::TabRemoved { tab_id, .. } => {
                self.detach_tab(*tab_id);
            }
            BrowserEvent::TabMoved {
                tab_id, to_index, ..
            } => {
                if let Some(tab) = self.detach_tab(*tab_id) {
                    self.insert_tab(TabInfo {
                        index: *to_index,
                        ..tab
                    });
                }
            }
            BrowserEvent::TabActivated { tab_id, .. } => {
                if let Some(tab) = self.detach_tab(*tab_id) {
                    self.insert_tab(TabInfo { active: true, ..tab });
                }
            }
            BrowserEvent::Startup
            | BrowserEvent::Installed
            | BrowserEvent::WindowCreated { .. }
            | BrowserEvent::WindowRemoved { .. }
            | BrowserEvent::WindowFocusChanged { .. }
            | BrowserEvent::StorageChanged { .. } => {}
        }
    }

    /// Make every host call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), HostError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(HostError::Unavailable("host marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TabHost for MemoryTabHost {
    async fn query_tabs(&self, query: TabQuery) -> Result<Vec<TabInfo>, HostError> {
        self.check()?;
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|tab| query.matches(tab))
            .collect())
    }

    async fn get_tab(&self, id: TabId) -> Result<TabInfo, HostError> {
        self.check()?;
        self.tabs
            .lock()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(HostError::TabNotFound(id))
    }

    async fn activate_tab(&self, id: TabId) -> Result<(), HostError> {
        self.check()?;
        {
            let mut tabs = self.tabs.lock();
            let window_id = tabs
                .iter()
                .find(|t| t.id == id)
                .map(|t| t.window_id)
                .ok_or(HostError::TabNotFound(id))?;
            for tab in tabs.iter_mut().filter(|t| t.window_id == window_id) {
                tab.active = tab.id == id;
            }
        }
        self.activations.lock().push(id);
        Ok(())
    }

    async fn move_tab(&self, id: TabId, index: usize) -> Result<(), HostError> {
        self.check()?;
        let tab = self.detach_tab(id).ok_or(HostError::TabNotFound(id))?;
        self.insert_tab(TabInfo { index, ..tab });
        Ok(())
    }

    async fn remove_tabs(&self, ids: &[TabId]) -> Result<(), HostError> {
        self.check()?;
        for id in ids {
            self.detach_tab(*id);
        }
        Ok(())
    }
}

/// Key-value store backed by a map, with write counting and failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    writes: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key without counting it as a write.
    pub fn insert(&self, key: &str, value: Value) {
        self.data.lock().insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let data = self.data.lock();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(*key).map(|v| ((*key).to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StorageError::Write("injected failure".to_string()));
        }
        self.data.lock().extend(items);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
