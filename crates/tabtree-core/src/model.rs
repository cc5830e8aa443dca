//! Host browser data model: ids, tab payloads, window kinds

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Runtime tab id. Only meaningful within one browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl Display for TabId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl Display for WindowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutedInfo {
    pub muted: bool,
}

/// Loading state reported by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Unloaded,
    Loading,
    #[default]
    Complete,
}

/// A tab as enumerated by the host browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub url: String,
    /// URL the tab is navigating to before it commits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    pub window_id: WindowId,
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<TabId>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub discarded: bool,
    #[serde(default)]
    pub status: TabStatus,
    #[serde(default)]
    pub audible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_info: Option<MutedInfo>,
}

impl TabInfo {
    /// Minimal tab used by tests and replay scripts.
    pub fn new(id: u64, window: u64, index: usize, url: impl Into<String>) -> Self {
        Self {
            id: TabId(id),
            url: url.into(),
            pending_url: None,
            title: String::new(),
            fav_icon_url: None,
            window_id: WindowId(window),
            index,
            opener_tab_id: None,
            active: false,
            discarded: false,
            status: TabStatus::Complete,
            audible: false,
            muted_info: None,
        }
    }

    #[must_use]
    pub fn with_opener(mut self, opener: u64) -> Self {
        self.opener_tab_id = Some(TabId(opener));
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    /// Committed URL, or the pending one while navigation is in flight.
    pub fn effective_url(&self) -> &str {
        if self.url.is_empty() {
            self.pending_url.as_deref().unwrap_or("")
        } else {
            &self.url
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted_info.is_some_and(|info| info.muted)
    }
}

/// Fields that changed in a tab update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TabStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Normal,
    Popup,
    Panel,
    App,
    Devtools,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_info_parses_host_payload() {
        let tab: TabInfo = serde_json::from_value(serde_json::json!({
            "id": 42,
            "url": "",
            "pendingUrl": "https://example.com/next",
            "title": "Loading",
            "windowId": 1,
            "index": 3,
            "openerTabId": 7,
            "active": true,
            "status": "loading",
            "mutedInfo": { "muted": true }
        }))
        .unwrap();

        assert_eq!(tab.id, TabId(42));
        assert_eq!(tab.opener_tab_id, Some(TabId(7)));
        assert_eq!(tab.effective_url(), "https://example.com/next");
        assert_eq!(tab.status, TabStatus::Loading);
        assert!(tab.is_muted());
        assert!(!tab.discarded);
    }

    #[test]
    fn committed_url_wins_over_pending() {
        let mut tab = TabInfo::new(1, 1, 0, "https://a.test/");
        tab.pending_url = Some("https://b.test/".to_string());
        assert_eq!(tab.effective_url(), "https://a.test/");
    }
}
