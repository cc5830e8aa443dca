//! Request/response channel used by UI surfaces (popup, content scripts).
//!
//! Requests are JSON objects tagged by `action`. Responses keep the shapes UI
//! code already expects: bare maps for relation and pin queries, `null` while
//! the live relation map is not rebuilt yet, and `{ "success": ... }`
//! acknowledgements for commands.

use crate::history::NavigationHistory;
use crate::model::{TabId, WindowId};
use crate::pinned::{PinRequest, PinnedTabIds, PinnedTabs};
use crate::relations::RelationMap;
use crate::storage::ScrollPosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scroll offsets sent by a content script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollOffsets {
    #[serde(default)]
    pub scroll_top: f64,
    #[serde(default)]
    pub scroll_left: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// A link in `sender_tab_id` was clicked; the tab it opens becomes its
    /// child once it is active
    LinkClicked {
        sender_tab_id: TabId,
        sender_window_id: WindowId,
    },
    /// These tabs are about to be closed from the UI; their removal must not
    /// trigger smart switching
    MarkPluginClosed {
        #[serde(default)]
        tab_ids: Vec<TabId>,
    },
    RestoreRelations,
    GetTabRelations,
    SetTabParent {
        tab_id: TabId,
        parent_id: TabId,
    },
    RemoveTabRelationsFor {
        tab_id: TabId,
    },
    AddPinnedTab {
        tab_id: TabId,
        #[serde(default)]
        tab_info: PinRequest,
    },
    RemovePinnedTab {
        tab_id: TabId,
    },
    GetPinnedTabs,
    GetPinnedTabIdsCache,
    IsPinnedTab {
        tab_id: TabId,
    },
    GetHistoryData,
    SaveHistoryData {
        #[serde(default)]
        history_data: Option<NavigationHistory>,
    },
    IsFeatureEnabled {
        #[serde(default)]
        feature: Option<String>,
    },
    GetDefaultRecentFilter,
    SetDefaultRecentFilter {
        #[serde(default)]
        value: bool,
    },
    SaveScrollPosition {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        position: Option<ScrollOffsets>,
    },
    GetScrollPosition {
        #[serde(default)]
        url: Option<String>,
    },
    RemoveScrollPosition {
        #[serde(default)]
        url: Option<String>,
    },
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::LinkClicked { .. } => "linkClicked",
            Self::MarkPluginClosed { .. } => "markPluginClosed",
            Self::RestoreRelations => "restoreRelations",
            Self::GetTabRelations => "getTabRelations",
            Self::SetTabParent { .. } => "setTabParent",
            Self::RemoveTabRelationsFor { .. } => "removeTabRelationsFor",
            Self::AddPinnedTab { .. } => "addPinnedTab",
            Self::RemovePinnedTab { .. } => "removePinnedTab",
            Self::GetPinnedTabs => "getPinnedTabs",
            Self::GetPinnedTabIdsCache => "getPinnedTabIdsCache",
            Self::IsPinnedTab { .. } => "isPinnedTab",
            Self::GetHistoryData => "getHistoryData",
            Self::SaveHistoryData { .. } => "saveHistoryData",
            Self::IsFeatureEnabled { .. } => "isFeatureEnabled",
            Self::GetDefaultRecentFilter => "getDefaultRecentFilter",
            Self::SetDefaultRecentFilter { .. } => "setDefaultRecentFilter",
            Self::SaveScrollPosition { .. } => "saveScrollPosition",
            Self::GetScrollPosition { .. } => "getScrollPosition",
            Self::RemoveScrollPosition { .. } => "removeScrollPosition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Response {
    Ack {
        success: bool,
    },
    Failure {
        success: bool,
        error: String,
    },
    /// `None` serializes as `null`: the live map is not rebuilt yet
    Relations(Option<RelationMap>),
    PinnedTabs(PinnedTabs),
    PinnedTabIds(PinnedTabIds),
    Pinned {
        is_pinned: bool,
    },
    History(NavigationHistory),
    Enabled {
        enabled: bool,
    },
    Value {
        value: bool,
    },
    ScrollPosition(Option<ScrollPosition>),
}

impl Response {
    pub fn ack() -> Self {
        Self::Ack { success: true }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            serde_json::json!({ "success": false, "error": err.to_string() })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_decode_from_ui_payloads() {
        let request = Request::from_value(json!({
            "action": "addPinnedTab",
            "tabId": 9,
            "tabInfo": { "url": "https://docs.test/", "title": "Docs" }
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::AddPinnedTab {
                tab_id: TabId(9),
                tab_info: PinRequest {
                    url: "https://docs.test/".to_string(),
                    title: "Docs".to_string(),
                },
            }
        );

        let request = Request::from_value(json!({ "action": "getTabRelations" })).unwrap();
        assert_eq!(request.action(), "getTabRelations");

        let request = Request::from_value(json!({ "action": "markPluginClosed" })).unwrap();
        assert_eq!(request, Request::MarkPluginClosed { tab_ids: vec![] });
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(Request::from_value(json!({ "action": "formatDisk" })).is_err());
        assert!(Request::from_value(json!({ "tabId": 1 })).is_err());
    }

    #[test]
    fn responses_keep_ui_shapes() {
        assert_eq!(Response::ack().to_value(), json!({ "success": true }));
        assert_eq!(
            Response::failure("boom").to_value(),
            json!({ "success": false, "error": "boom" })
        );
        assert_eq!(Response::Relations(None).to_value(), Value::Null);

        let map = RelationMap::from([(TabId(2), TabId(1))]);
        assert_eq!(Response::Relations(Some(map)).to_value(), json!({ "2": 1 }));
        assert_eq!(
            Response::Pinned { is_pinned: true }.to_value(),
            json!({ "isPinned": true })
        );
        assert_eq!(Response::Value { value: false }.to_value(), json!({ "value": false }));
    }
}
