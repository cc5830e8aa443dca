//! Composition root: owns every component and routes browser events and UI
//! requests to them.
//!
//! Events are handled one at a time by [`TabTreeService::run`]. Handlers never
//! fail: host and storage problems are logged and the event is treated as
//! having had no effect.

use crate::close_direction::{CloseTracker, find_next_tab_to_activate};
use crate::config::TabTreeConfig;
use crate::events::BrowserEvent;
use crate::history::NavigationHistory;
use crate::host::{KeyValueStore, TabHost, TabQuery};
use crate::messages::{Request, Response};
use crate::model::{TabChange, TabId, TabInfo, WindowId, WindowKind};
use crate::pinned::PinnedRegistry;
use crate::relations::RelationEngine;
use crate::scheduler::CoalescingExecutor;
use crate::settings::{Feature, SettingsCache};
use crate::storage::{PINNED_TABS_KEY, SETTINGS_KEY, StorageManager};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SNAPSHOT_TASK_KEY: &str = "snapshot";

/// A spawned timer that is replaced (and cancelled) by the next one.
#[derive(Debug, Default)]
struct TimerSlot(Mutex<Option<JoinHandle<()>>>);

impl TimerSlot {
    fn replace(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.0.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel(&self) {
        if let Some(handle) = self.0.lock().take() {
            handle.abort();
        }
    }
}

struct ServiceInner {
    config: TabTreeConfig,
    host: Arc<dyn TabHost>,
    storage: StorageManager,
    settings: SettingsCache,
    relations: RelationEngine,
    pinned: PinnedRegistry,
    close: Arc<CloseTracker>,
    snapshot: CoalescingExecutor,
    /// Parent assignment is suppressed until this instant
    restore_guard: Arc<Mutex<Option<Instant>>>,
    guard_timer: TimerSlot,
    focus_timer: TimerSlot,
    plugin_closed: Mutex<HashSet<TabId>>,
}

/// The tab tree background service.
#[derive(Clone)]
pub struct TabTreeService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for TabTreeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabTreeService")
            .field("relations", &self.inner.relations)
            .field("snapshot", &self.inner.snapshot)
            .field("guard_active", &self.guard_active())
            .finish_non_exhaustive()
    }
}

impl TabTreeService {
    pub fn new(
        config: TabTreeConfig,
        host: Arc<dyn TabHost>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let storage = StorageManager::new(store, config.storage.clone());
        storage.reset_history(NavigationHistory::new(config.history.max_entries));
        let settings = SettingsCache::new(storage.clone(), config.settings.cache_ttl());
        let relations = RelationEngine::new(
            storage.clone(),
            settings.clone(),
            Arc::clone(&host),
            config.relations.clone(),
        );
        let pinned = PinnedRegistry::new(storage.clone(), Arc::clone(&host), config.pinned.clone());
        let snapshot = CoalescingExecutor::new(
            "tab-snapshot",
            Duration::from_millis(config.scheduler.snapshot_delay_ms),
        );

        Self {
            inner: Arc::new(ServiceInner {
                config,
                host,
                storage,
                settings,
                relations,
                pinned,
                close: Arc::new(CloseTracker::new()),
                snapshot,
                restore_guard: Arc::new(Mutex::new(None)),
                guard_timer: TimerSlot::default(),
                focus_timer: TimerSlot::default(),
                plugin_closed: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &TabTreeConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.inner.storage
    }

    pub fn settings(&self) -> &SettingsCache {
        &self.inner.settings
    }

    pub fn relations(&self) -> &RelationEngine {
        &self.inner.relations
    }

    pub fn pinned(&self) -> &PinnedRegistry {
        &self.inner.pinned
    }

    pub fn close_tracker(&self) -> &CloseTracker {
        &self.inner.close
    }

    /// Whether a recently opened window still suppresses parent assignment.
    pub fn guard_active(&self) -> bool {
        self.inner
            .restore_guard
            .lock()
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Handle events until every sender is dropped, then shut down.
    pub async fn run(&self, mut events: mpsc::Receiver<BrowserEvent>) {
        info!("tab tree service started");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        self.shutdown().await;
        info!("tab tree service stopped");
    }

    pub async fn handle_event(&self, event: BrowserEvent) {
        debug!(event = event.kind(), "handling browser event");
        match event {
            BrowserEvent::Startup | BrowserEvent::Installed => self.startup().await,
            BrowserEvent::TabCreated { tab } => self.on_tab_created(tab).await,
            BrowserEvent::TabUpdated {
                tab_id,
                change,
                tab,
            } => self.on_tab_updated(tab_id, &change, tab).await,
            BrowserEvent::TabRemoved {
                tab_id,
                window_id,
                window_closing,
            } => self.on_tab_removed(tab_id, window_id, window_closing).await,
            BrowserEvent::TabMoved { .. } => self.schedule_snapshot(),
            BrowserEvent::TabActivated { tab_id, .. } => self.on_tab_activated(tab_id).await,
            BrowserEvent::WindowCreated { window_id, kind } => {
                if kind == WindowKind::Normal {
                    self.start_restore_guard(window_id);
                }
            }
            BrowserEvent::WindowRemoved { window_id } => {
                self.inner.relations.clear_live();
                debug!(window_id = %window_id, "live relations cleared");
            }
            BrowserEvent::WindowFocusChanged { window_id } => {
                if let Some(window_id) = window_id {
                    self.schedule_focus_restore(window_id);
                }
            }
            BrowserEvent::StorageChanged { keys } => self.on_storage_changed(&keys),
        }
    }

    /// Restore relations, purge expired data, warm caches and take the first
    /// index snapshot.
    pub async fn startup(&self) {
        let inner = &self.inner;
        let restored = inner.relations.restore_relations().await.len();
        let purged = inner.relations.cleanup().await;
        let expired_pins = inner.pinned.cleanup_expired_pinned_tabs().await;
        let scroll = inner
            .storage
            .cleanup_old_scroll_positions(inner.config.scroll.retention_ms())
            .await;
        inner.settings.settings().await;
        if let Err(err) = refresh_snapshot(inner.host.as_ref(), &inner.close).await {
            warn!(error = %err, "initial tab snapshot failed");
        }
        info!(
            restored,
            purged,
            expired_pins,
            scroll,
            snapshot = inner.close.snapshot_len(),
            "startup complete"
        );
    }

    /// Cancel timers and persist every loaded cache.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.snapshot.clear();
        inner.guard_timer.cancel();
        inner.focus_timer.cancel();
        if let Err(err) = inner.storage.force_write().await {
            warn!(error = %err, "final write failed");
        }
        inner.storage.shutdown();
    }

    // -------------------------------------------------------------------------
    // Tab events
    // -------------------------------------------------------------------------

    async fn on_tab_created(&self, tab: TabInfo) {
        let inner = &self.inner;
        self.schedule_snapshot();
        inner.pinned.invalidate();

        if self.guard_active() {
            debug!(tab_id = %tab.id, "window restoring, parent not assigned");
            return;
        }

        let mut parent = None;
        if let Some(opener) = tab.opener_tab_id.filter(|o| *o != tab.id) {
            match inner.host.get_tab(opener).await {
                Ok(opener_tab) => parent = Some(opener_tab),
                Err(err) => debug!(tab_id = %tab.id, opener = %opener, error = %err, "opener gone, using active tab"),
            }
        }
        if parent.is_none() {
            match inner.host.query_tabs(TabQuery::active_in(tab.window_id)).await {
                Ok(active) => parent = active.into_iter().find(|t| t.id != tab.id),
                Err(err) => warn!(tab_id = %tab.id, error = %err, "cannot query active tab"),
            }
        }
        let Some(parent) = parent else {
            return;
        };

        if inner.relations.attach_live(tab.id, parent.id).await {
            inner.relations.record_relation(&tab, &parent).await;
        }
    }

    /// A URL arrived: mirror the tab's relation now that it can be keyed, and
    /// re-key the relations of its children.
    async fn on_tab_updated(&self, tab_id: TabId, change: &TabChange, tab: Option<TabInfo>) {
        let inner = &self.inner;
        if change.url.is_none() {
            return;
        }
        inner.pinned.invalidate();
        if self.guard_active() || !inner.settings.feature(Feature::AutoRestore).await {
            return;
        }

        let tab = match tab {
            Some(tab) => tab,
            None => match inner.host.get_tab(tab_id).await {
                Ok(tab) => tab,
                Err(err) => {
                    debug!(tab_id = %tab_id, error = %err, "updated tab vanished");
                    return;
                }
            },
        };

        let parent_id = tab.opener_tab_id.or_else(|| inner.relations.parent_of(tab_id));
        if let Some(parent_id) = parent_id.filter(|p| *p != tab_id) {
            match inner.host.get_tab(parent_id).await {
                Ok(parent) => {
                    inner.relations.record_relation(&tab, &parent).await;
                }
                Err(err) => debug!(tab_id = %tab_id, parent_id = %parent_id, error = %err, "parent gone"),
            }
        }
        inner
            .relations
            .update_child_relations_for_updated_parent(tab_id, &tab)
            .await;
    }

    async fn on_tab_removed(&self, tab_id: TabId, window_id: WindowId, window_closing: bool) {
        let inner = &self.inner;
        let plugin_closed = inner.plugin_closed.lock().remove(&tab_id);

        if window_closing || plugin_closed {
            debug!(tab_id = %tab_id, window_closing, plugin_closed, "removal needs no switch");
        } else if inner.settings.feature(Feature::SmartSwitch).await {
            self.activate_next(tab_id, window_id).await;
        }

        inner.relations.remove_tab_relations(tab_id);
        inner.close.forget(tab_id);
        if !window_closing {
            if let Err(err) = refresh_snapshot(inner.host.as_ref(), &inner.close).await {
                warn!(error = %err, "tab snapshot refresh failed");
            }
        }
    }

    async fn activate_next(&self, closed: TabId, window_id: WindowId) {
        let inner = &self.inner;
        let Some(closed_at) = inner.close.record_close(closed) else {
            debug!(tab_id = %closed, "closed tab missing from snapshot");
            return;
        };
        let relations = inner.relations.tab_relations().unwrap_or_default();
        let tabs = match inner.host.query_tabs(TabQuery::all()).await {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(tab_id = %closed, error = %err, "cannot enumerate tabs for switch");
                return;
            }
        };
        let direction = inner.close.direction();
        let Some(next) = find_next_tab_to_activate(closed, closed_at, &relations, &tabs, direction)
        else {
            return;
        };
        match inner.host.activate_tab(next).await {
            Ok(()) => info!(
                tab_id = %closed,
                next = %next,
                window_id = %window_id,
                direction = ?direction,
                "activated next tab"
            ),
            Err(err) => warn!(tab_id = %next, error = %err, "activation failed"),
        }
    }

    async fn on_tab_activated(&self, tab_id: TabId) {
        let now = crate::epoch_ms();
        let timeout = self.inner.config.history.navigation_timeout_ms;
        let recorded = self
            .inner
            .storage
            .update_history(|history| {
                history.expire_navigation(now, timeout);
                if history.is_navigating(now, timeout) {
                    false
                } else {
                    history.add_tab(tab_id)
                }
            })
            .await;
        if recorded {
            debug!(tab_id = %tab_id, "history entry added");
        }
    }

    // -------------------------------------------------------------------------
    // Window and storage events
    // -------------------------------------------------------------------------

    fn start_restore_guard(&self, window_id: WindowId) {
        let delay = Duration::from_millis(self.inner.config.window.restore_guard_ms);
        let deadline = Instant::now() + delay;
        *self.inner.restore_guard.lock() = Some(deadline);
        info!(window_id = %window_id, delay_ms = delay.as_millis() as u64, "window restoring");

        let guard = Arc::clone(&self.inner.restore_guard);
        let relations = self.inner.relations.clone();
        self.inner.guard_timer.replace(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            relations.restore_relations().await;
            let mut deadline_slot = guard.lock();
            if deadline_slot.is_some_and(|d| d <= Instant::now()) {
                *deadline_slot = None;
            }
        }));
    }

    fn schedule_focus_restore(&self, window_id: WindowId) {
        let delay = Duration::from_millis(self.inner.config.window.focus_restore_delay_ms);
        let relations = self.inner.relations.clone();
        self.inner.focus_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(window_id = %window_id, "focus settled, restoring relations");
            relations.restore_relations().await;
        }));
    }

    fn on_storage_changed(&self, keys: &[String]) {
        for key in keys {
            match key.as_str() {
                SETTINGS_KEY => self.inner.settings.invalidate(),
                PINNED_TABS_KEY => {
                    self.inner.storage.invalidate_pinned_tabs();
                    self.inner.pinned.invalidate();
                }
                _ => {}
            }
        }
    }

    fn schedule_snapshot(&self) {
        let host = Arc::clone(&self.inner.host);
        let close = Arc::clone(&self.inner.close);
        self.inner
            .snapshot
            .schedule(Some(SNAPSHOT_TASK_KEY), move || async move {
                refresh_snapshot(host.as_ref(), &close).await
            });
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Decode a JSON request, dispatch it and encode the response.
    pub async fn handle_message(&self, message: Value) -> Value {
        match Request::from_value(message) {
            Ok(request) => self.handle_request(request).await.to_value(),
            Err(err) => {
                debug!(error = %err, "malformed request");
                Response::failure(format!("invalid request: {err}")).to_value()
            }
        }
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        let inner = &self.inner;
        debug!(action = request.action(), "handling request");
        match request {
            Request::LinkClicked {
                sender_tab_id,
                sender_window_id,
            } => {
                self.link_clicked(sender_tab_id, sender_window_id).await;
                Response::ack()
            }
            Request::MarkPluginClosed { tab_ids } => {
                inner.plugin_closed.lock().extend(tab_ids);
                Response::ack()
            }
            Request::RestoreRelations => {
                inner.relations.restore_relations().await;
                Response::ack()
            }
            Request::GetTabRelations => {
                let relations = inner.relations.tab_relations();
                if relations.is_none() {
                    let engine = inner.relations.clone();
                    tokio::spawn(async move {
                        engine.restore_relations().await;
                    });
                }
                Response::Relations(relations)
            }
            Request::SetTabParent { tab_id, parent_id } => {
                if inner.relations.set_tab_parent(tab_id, parent_id).await {
                    Response::ack()
                } else {
                    Response::failure(format!("cannot make {parent_id} the parent of {tab_id}"))
                }
            }
            Request::RemoveTabRelationsFor { tab_id } => {
                let url = inner
                    .host
                    .get_tab(tab_id)
                    .await
                    .ok()
                    .map(|tab| tab.effective_url().to_string());
                inner.relations.remove_tab_relations(tab_id);
                if let Some(url) = url {
                    inner.relations.remove_relation(&url).await;
                }
                Response::ack()
            }
            Request::AddPinnedTab { tab_id, tab_info } => {
                if inner.pinned.add_pinned_tab(tab_id, &tab_info).await {
                    Response::ack()
                } else {
                    Response::failure(format!("tab {tab_id} cannot be pinned"))
                }
            }
            Request::RemovePinnedTab { tab_id } => Response::Ack {
                success: inner.pinned.remove_pinned_tab(tab_id).await,
            },
            Request::GetPinnedTabs => Response::PinnedTabs(inner.pinned.pinned_tabs().await),
            Request::GetPinnedTabIdsCache => {
                Response::PinnedTabIds(inner.pinned.pinned_tab_ids().await)
            }
            Request::IsPinnedTab { tab_id } => Response::Pinned {
                is_pinned: inner.pinned.is_pinned_tab(tab_id).await,
            },
            Request::GetHistoryData => {
                let now = crate::epoch_ms();
                let timeout = inner.config.history.navigation_timeout_ms;
                let history = inner
                    .storage
                    .update_history(|history| {
                        history.expire_navigation(now, timeout);
                        history.clone()
                    })
                    .await;
                Response::History(history)
            }
            Request::SaveHistoryData { history_data } => {
                if let Some(history_data) = history_data {
                    inner
                        .storage
                        .update_history(|history| history.replace_with(history_data))
                        .await;
                }
                Response::ack()
            }
            Request::IsFeatureEnabled { feature } => Response::Enabled {
                enabled: feature.is_some_and(|name| inner.settings.is_feature_enabled(&name)),
            },
            Request::GetDefaultRecentFilter => Response::Value {
                value: inner.storage.default_recent_filter().await,
            },
            Request::SetDefaultRecentFilter { value } => {
                match inner.storage.set_default_recent_filter(value).await {
                    Ok(()) => Response::ack(),
                    Err(err) => Response::failure(err.to_string()),
                }
            }
            Request::SaveScrollPosition { url, position } => {
                if let (Some(url), Some(position)) = (url, position) {
                    inner
                        .storage
                        .save_scroll_position(&url, position.scroll_top, position.scroll_left)
                        .await;
                }
                Response::ack()
            }
            Request::GetScrollPosition { url } => Response::ScrollPosition(
                url.and_then(|url| inner.storage.cached_scroll_position(&url)),
            ),
            Request::RemoveScrollPosition { url } => {
                if let Some(url) = url {
                    inner.storage.remove_scroll_position(&url).await;
                }
                Response::ack()
            }
        }
    }

    /// Parent the tab a link click opened once it has become active.
    async fn link_clicked(&self, sender: TabId, window_id: WindowId) {
        let settle = Duration::from_millis(self.inner.config.window.link_click_settle_ms);
        tokio::time::sleep(settle).await;
        let active = match self
            .inner
            .host
            .query_tabs(TabQuery::active_in(window_id))
            .await
        {
            Ok(active) => active,
            Err(err) => {
                warn!(tab_id = %sender, error = %err, "cannot query tab opened by link");
                return;
            }
        };
        if let Some(child) = active.first().filter(|t| t.id != sender) {
            self.inner.relations.set_tab_parent(child.id, sender).await;
        }
    }
}

async fn refresh_snapshot(host: &dyn TabHost, close: &CloseTracker) -> crate::Result<()> {
    let tabs = host.query_tabs(TabQuery::all()).await?;
    close.refresh(&tabs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, MemoryTabHost};
    use crate::relations::{RelationMap, RelationMethod};
    use crate::storage::RELATIONS_KEY;
    use serde_json::json;

    struct Harness {
        host: Arc<MemoryTabHost>,
        store: Arc<MemoryStore>,
        service: TabTreeService,
    }

    impl Harness {
        fn new(tabs: Vec<TabInfo>) -> Self {
            let host = Arc::new(MemoryTabHost::with_tabs(tabs));
            let store = Arc::new(MemoryStore::new());
            let service = TabTreeService::new(
                TabTreeConfig::default(),
                Arc::clone(&host) as Arc<dyn TabHost>,
                Arc::clone(&store) as Arc<dyn KeyValueStore>,
            );
            Self {
                host,
                store,
                service,
            }
        }

        async fn emit(&self, event: BrowserEvent) {
            self.host.apply(&event);
            self.service.handle_event(event).await;
        }

        async fn close(&self, tab: u64, window: u64) {
            self.emit(BrowserEvent::TabRemoved {
                tab_id: TabId(tab),
                window_id: WindowId(window),
                window_closing: false,
            })
            .await;
        }
    }

    fn url_change(url: &str) -> TabChange {
        TabChange {
            url: Some(url.to_string()),
            ..TabChange::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opener_relation_is_logged_once_the_url_arrives() {
        let h = Harness::new(vec![TabInfo::new(1, 1, 0, "https://news.test/").active()]);
        h.service.startup().await;

        h.emit(BrowserEvent::TabCreated {
            tab: TabInfo::new(2, 1, 1, "").with_opener(1),
        })
        .await;
        assert_eq!(h.service.relations().parent_of(TabId(2)), Some(TabId(1)));
        assert!(h.service.relations().durable_records().await.is_empty());

        let updated = TabInfo::new(2, 1, 1, "https://news.test/story").with_opener(1);
        h.emit(BrowserEvent::TabUpdated {
            tab_id: TabId(2),
            change: url_change("https://news.test/story"),
            tab: Some(updated),
        })
        .await;

        let records = h.service.relations().durable_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].child.url, "https://news.test/story");
        assert_eq!(records[0].parent.url, "https://news.test/");
        assert_eq!(records[0].method, RelationMethod::Opener);
    }

    #[tokio::test(start_paused = true)]
    async fn active_tab_is_the_fallback_parent() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/").active(),
        ]);
        h.service.startup().await;

        h.emit(BrowserEvent::TabCreated {
            tab: TabInfo::new(3, 1, 2, "https://c.test/"),
        })
        .await;

        assert_eq!(h.service.relations().parent_of(TabId(3)), Some(TabId(2)));
        let records = h.service.relations().durable_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, RelationMethod::Manual);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_guard_suppresses_parenting_until_it_expires() {
        let h = Harness::new(vec![TabInfo::new(1, 1, 0, "https://a.test/").active()]);
        h.service.startup().await;

        h.emit(BrowserEvent::WindowCreated {
            window_id: WindowId(2),
            kind: WindowKind::Normal,
        })
        .await;
        assert!(h.service.guard_active());

        h.emit(BrowserEvent::TabCreated {
            tab: TabInfo::new(2, 1, 1, "https://b.test/").with_opener(1),
        })
        .await;
        assert_eq!(h.service.relations().parent_of(TabId(2)), None);

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert!(!h.service.guard_active());

        h.emit(BrowserEvent::TabCreated {
            tab: TabInfo::new(3, 1, 2, "https://c.test/").with_opener(1),
        })
        .await;
        assert_eq!(h.service.relations().parent_of(TabId(3)), Some(TabId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn popup_windows_do_not_start_the_guard() {
        let h = Harness::new(vec![]);
        h.emit(BrowserEvent::WindowCreated {
            window_id: WindowId(5),
            kind: WindowKind::Popup,
        })
        .await;
        assert!(!h.service.guard_active());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_last_sibling_activates_previous() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/"),
            TabInfo::new(3, 1, 2, "https://c.test/").active(),
        ]);
        h.service.startup().await;

        h.close(3, 1).await;

        assert_eq!(h.host.activations(), vec![TabId(2)]);
        assert_eq!(h.service.close_tracker().entry(TabId(3)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_child_prefers_its_siblings_then_its_parent() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://root.test/"),
            TabInfo::new(2, 1, 1, "https://root.test/a"),
            TabInfo::new(3, 1, 2, "https://other.test/"),
        ]);
        h.service.startup().await;
        assert!(h.service.relations().set_tab_parent(TabId(2), TabId(1)).await);

        h.close(2, 1).await;

        // No sibling under tab 1, so the parent is the last resort.
        assert_eq!(h.host.activations(), vec![TabId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_and_window_closes_do_not_switch() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/"),
            TabInfo::new(3, 1, 2, "https://c.test/"),
        ]);
        h.service.startup().await;
        assert!(h.service.relations().set_tab_parent(TabId(3), TabId(1)).await);

        let ack = h
            .service
            .handle_message(json!({ "action": "markPluginClosed", "tabIds": [2] }))
            .await;
        assert_eq!(ack, json!({ "success": true }));
        h.close(2, 1).await;

        h.emit(BrowserEvent::TabRemoved {
            tab_id: TabId(1),
            window_id: WindowId(1),
            window_closing: true,
        })
        .await;

        assert!(h.host.activations().is_empty());
        assert_eq!(h.service.relations().tab_relations(), Some(RelationMap::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn smart_switch_follows_settings_changes() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/"),
        ]);
        h.service.startup().await;

        h.store
            .insert(SETTINGS_KEY, json!({ "smartSwitch": false, "autoRestore": true }));
        h.emit(BrowserEvent::StorageChanged {
            keys: vec![SETTINGS_KEY.to_string()],
        })
        .await;
        h.close(2, 1).await;

        assert!(h.host.activations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_removal_clears_live_map_and_focus_rebuilds_it() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/").with_opener(1),
        ]);
        h.service.startup().await;
        assert_eq!(h.service.relations().parent_of(TabId(2)), Some(TabId(1)));

        h.emit(BrowserEvent::WindowRemoved {
            window_id: WindowId(9),
        })
        .await;
        assert!(!h.service.relations().is_initialized());

        h.emit(BrowserEvent::WindowFocusChanged {
            window_id: Some(WindowId(1)),
        })
        .await;
        h.emit(BrowserEvent::WindowFocusChanged {
            window_id: Some(WindowId(1)),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(h.service.relations().parent_of(TabId(2)), Some(TabId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn tab_relations_request_returns_null_until_restored() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/").with_opener(1),
        ]);

        let first = h
            .service
            .handle_message(json!({ "action": "getTabRelations" }))
            .await;
        assert_eq!(first, Value::Null);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = h
            .service
            .handle_message(json!({ "action": "getTabRelations" }))
            .await;
        assert_eq!(second, json!({ "2": 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn set_parent_and_remove_relations_requests() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/"),
        ]);
        h.service.startup().await;

        let ok = h
            .service
            .handle_message(json!({ "action": "setTabParent", "tabId": 2, "parentId": 1 }))
            .await;
        assert_eq!(ok, json!({ "success": true }));
        assert_eq!(h.service.relations().durable_records().await.len(), 1);

        let refused = h
            .service
            .handle_message(json!({ "action": "setTabParent", "tabId": 1, "parentId": 2 }))
            .await;
        assert_eq!(refused["success"], json!(false));

        h.service
            .handle_message(json!({ "action": "removeTabRelationsFor", "tabId": 2 }))
            .await;
        assert_eq!(h.service.relations().parent_of(TabId(2)), None);
        assert!(h.service.relations().durable_records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn link_click_parents_the_newly_active_tab() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/").active(),
        ]);
        h.service.startup().await;

        let response = h
            .service
            .handle_message(json!({
                "action": "linkClicked",
                "senderTabId": 1,
                "senderWindowId": 1
            }))
            .await;

        assert_eq!(response, json!({ "success": true }));
        assert_eq!(h.service.relations().parent_of(TabId(2)), Some(TabId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn activations_build_history_unless_navigating() {
        let h = Harness::new(vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://b.test/"),
        ]);
        for id in [1, 2] {
            h.emit(BrowserEvent::TabActivated {
                tab_id: TabId(id),
                window_id: WindowId(1),
            })
            .await;
        }
        let history = h
            .service
            .handle_message(json!({ "action": "getHistoryData" }))
            .await;
        assert_eq!(history["history"], json!([1, 2]));
        assert_eq!(history["currentIndex"], json!(1));

        let now = crate::epoch_ms();
        h.service
            .handle_message(json!({
                "action": "saveHistoryData",
                "historyData": {
                    "history": [1, 2],
                    "currentIndex": 0,
                    "isNavigationAction": true,
                    "lastNavigationTime": now
                }
            }))
            .await;
        h.emit(BrowserEvent::TabActivated {
            tab_id: TabId(1),
            window_id: WindowId(1),
        })
        .await;

        let history = h
            .service
            .handle_message(json!({ "action": "getHistoryData" }))
            .await;
        assert_eq!(history["history"], json!([1, 2]));
        assert_eq!(history["currentIndex"], json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_get_a_failure_response() {
        let h = Harness::new(vec![]);
        let response = h.service.handle_message(json!({ "action": "nope" })).await;
        assert_eq!(response["success"], json!(false));
        assert!(response["error"].as_str().unwrap().starts_with("invalid request"));

        let response = h
            .service
            .handle_message(json!({ "action": "isFeatureEnabled" }))
            .await;
        assert_eq!(response, json!({ "enabled": false }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_events_and_persists_on_close() {
        let h = Harness::new(vec![TabInfo::new(1, 1, 0, "https://a.test/").active()]);
        let (tx, rx) = crate::events::EventBus::new(8).channel();
        let service = h.service.clone();
        let handle = tokio::spawn(async move { service.run(rx).await });

        tx.publish(BrowserEvent::Startup).await.unwrap();
        let tab = TabInfo::new(2, 1, 1, "https://a.test/next").with_opener(1);
        h.host.insert_tab(tab.clone());
        tx.publish(BrowserEvent::TabCreated { tab }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let stored = h.store.value(RELATIONS_KEY).unwrap();
        assert_eq!(stored["relations"].as_array().unwrap().len(), 1);
    }
}
