//! Typed browser events and the channel that carries them to the service.

use crate::error::{Error, Result};
use crate::model::{TabChange, TabId, TabInfo, WindowId, WindowKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Browser notifications consumed by [`crate::service::TabTreeService`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    /// Background process started with the browser
    Startup,

    /// Extension installed or updated
    Installed,

    TabCreated { tab: TabInfo },

    /// A tab changed; `tab` is its state after the change when the host
    /// provides it
    TabUpdated {
        tab_id: TabId,
        change: TabChange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab: Option<TabInfo>,
    },

    /// A tab is gone. `window_closing` is set when its window is being torn
    /// down.
    TabRemoved {
        tab_id: TabId,
        window_id: WindowId,
        #[serde(default)]
        window_closing: bool,
    },

    TabMoved {
        tab_id: TabId,
        window_id: WindowId,
        from_index: usize,
        to_index: usize,
    },

    TabActivated { tab_id: TabId, window_id: WindowId },

    WindowCreated {
        window_id: WindowId,
        #[serde(default)]
        kind: WindowKind,
    },

    WindowRemoved { window_id: WindowId },

    /// `None` when focus left every browser window
    WindowFocusChanged {
        #[serde(default)]
        window_id: Option<WindowId>,
    },

    /// Durable keys modified outside this process
    StorageChanged { keys: Vec<String> },
}

impl BrowserEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Installed => "installed",
            Self::TabCreated { .. } => "tab_created",
            Self::TabUpdated { .. } => "tab_updated",
            Self::TabRemoved { .. } => "tab_removed",
            Self::TabMoved { .. } => "tab_moved",
            Self::TabActivated { .. } => "tab_activated",
            Self::WindowCreated { .. } => "window_created",
            Self::WindowRemoved { .. } => "window_removed",
            Self::WindowFocusChanged { .. } => "window_focus_changed",
            Self::StorageChanged { .. } => "storage_changed",
        }
    }
}

/// Producer side of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<BrowserEvent>,
}

impl EventSender {
    /// Queue an event, waiting while the channel is full.
    pub async fn publish(&self, event: BrowserEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| Error::Runtime(format!("event channel closed: {}", e.0.kind())))
    }
}

/// Bounded event channel between host listeners and the service loop
#[derive(Debug, Clone, Copy)]
pub struct EventBus {
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel(&self) -> (EventSender, mpsc::Receiver<BrowserEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        (EventSender { tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse_from_script_lines() {
        let event: BrowserEvent = serde_json::from_str(
            r#"{"type":"tab_removed","tab_id":4,"window_id":1,"window_closing":true}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BrowserEvent::TabRemoved {
                tab_id: TabId(4),
                window_id: WindowId(1),
                window_closing: true
            }
        );

        let event: BrowserEvent =
            serde_json::from_str(r#"{"type":"window_focus_changed"}"#).unwrap();
        assert_eq!(event, BrowserEvent::WindowFocusChanged { window_id: None });
        assert_eq!(event.kind(), "window_focus_changed");
    }

    #[tokio::test]
    async fn closed_channel_reports_runtime_error() {
        let (tx, rx) = EventBus::new(4).channel();
        drop(rx);
        let err = tx.publish(BrowserEvent::Startup).await.unwrap_err();
        assert!(err.to_string().contains("event channel closed"));
    }
}
