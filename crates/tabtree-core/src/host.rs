//! Seams to the host browser: tab enumeration/mutation and durable storage.

use crate::error::{HostError, StorageError};
use crate::model::{TabId, TabInfo, WindowId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Filter for [`TabHost::query_tabs`]. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabQuery {
    pub window_id: Option<WindowId>,
    pub active: Option<bool>,
}

impl TabQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active_in(window_id: WindowId) -> Self {
        Self {
            window_id: Some(window_id),
            active: Some(true),
        }
    }

    pub fn matches(&self, tab: &TabInfo) -> bool {
        self.window_id.is_none_or(|w| tab.window_id == w)
            && self.active.is_none_or(|a| tab.active == a)
    }
}

/// Tab and window operations provided by the browser.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn query_tabs(&self, query: TabQuery) -> Result<Vec<TabInfo>, HostError>;

    /// Fails with [`HostError::TabNotFound`] once the tab is gone.
    async fn get_tab(&self, id: TabId) -> Result<TabInfo, HostError>;

    async fn activate_tab(&self, id: TabId) -> Result<(), HostError>;

    async fn move_tab(&self, id: TabId, index: usize) -> Result<(), HostError>;

    async fn remove_tabs(&self, ids: &[TabId]) -> Result<(), HostError>;
}

/// Asynchronous get/set over named top-level keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns only the keys that are present.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError>;

    /// Writes every entry; each key is replaced independently.
    async fn set(&self, items: HashMap<String, Value>) -> Result<(), StorageError>;
}
