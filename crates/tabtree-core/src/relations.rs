//! Relation reconciliation between live tab ids and the durable URL log.
//!
//! Two stores describe the tab tree:
//!
//! - the **live map** (`child id -> parent id`), valid for this browser
//!   session only and never persisted directly;
//! - the **durable log** of [`RelationRecord`]s keyed by normalized URL,
//!   which survives restarts.
//!
//! Every live edge with usable URLs is mirrored into the log. After a restart
//! [`RelationEngine::restore_relations`] matches log URLs against the tabs
//! that came back and rebuilds the live map with the new ids.
//!
//! # Live map states
//!
//! The live map is a [`Slot`]: `Unloaded` means "not rebuilt yet", while
//! `Loaded(empty)` means "rebuilt, and there are no edges". Restoration only
//! runs from `Unloaded`, so repeated triggers are idempotent.
//!
//! Nothing here returns errors to event handlers. Host or storage failures
//! are logged and treated as "nothing recorded" or "nothing restored".

use crate::config::RelationsConfig;
use crate::host::{TabHost, TabQuery};
use crate::model::{TabId, TabInfo};
use crate::settings::{Feature, SettingsCache};
use crate::signature::{TabSignature, normalize_url};
use crate::storage::{Slot, StorageManager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Durable types
// =============================================================================

/// How a relation was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationMethod {
    /// The browser reported the parent as the child's opener
    Opener,
    /// Inferred from the active tab, or set explicitly
    Manual,
}

/// A directed parent -> child edge keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub child: TabSignature,
    pub parent: TabSignature,
    /// Epoch milliseconds of the last time this edge was observed
    pub timestamp: u64,
    pub method: RelationMethod,
}

impl RelationRecord {
    fn same_edge(&self, child_url: &str, parent_url: &str) -> bool {
        self.child.url == child_url && self.parent.url == parent_url
    }
}

/// Insertion-ordered durable log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationLog {
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

/// Live `child -> parent` map.
pub type RelationMap = BTreeMap<TabId, TabId>;

/// Result of [`RelationEngine::record_relation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Auto-restore is switched off
    Disabled,
    /// One of the URLs may not be recorded
    Rejected,
    /// The edge was already logged; its timestamp was bumped
    Refreshed,
    /// A new record was appended
    Inserted,
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    storage: StorageManager,
    settings: SettingsCache,
    host: Arc<dyn TabHost>,
    config: RelationsConfig,
    live: Mutex<Slot<RelationMap>>,
}

/// Owner of the live map and the only writer of the durable relation log.
#[derive(Clone)]
pub struct RelationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationEngine")
            .field("config", &self.inner.config)
            .field("live", &*self.inner.live.lock())
            .finish_non_exhaustive()
    }
}

impl RelationEngine {
    pub fn new(
        storage: StorageManager,
        settings: SettingsCache,
        host: Arc<dyn TabHost>,
        config: RelationsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                storage,
                settings,
                host,
                config,
                live: Mutex::new(Slot::Unloaded),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Durable log
    // -------------------------------------------------------------------------

    /// Mirror a `parent -> child` edge into the durable log.
    pub async fn record_relation(&self, child: &TabInfo, parent: &TabInfo) -> RecordOutcome {
        if !self.inner.settings.feature(Feature::AutoRestore).await {
            return RecordOutcome::Disabled;
        }

        let child_sig = TabSignature::from_tab(child);
        let parent_sig = TabSignature::from_tab(parent);
        if !child_sig.is_recordable() || !parent_sig.is_recordable() {
            debug!(
                tab_id = %child.id,
                parent_id = %parent.id,
                child_url = %child_sig.url,
                parent_url = %parent_sig.url,
                "relation not recordable"
            );
            return RecordOutcome::Rejected;
        }

        let method = if child.opener_tab_id == Some(parent.id) {
            RelationMethod::Opener
        } else {
            RelationMethod::Manual
        };
        let now = crate::epoch_ms();
        let max = self.inner.config.max_records;

        let outcome = self
            .inner
            .storage
            .update_relation_log(|log| {
                if let Some(existing) = log
                    .relations
                    .iter_mut()
                    .find(|r| r.same_edge(&child_sig.url, &parent_sig.url))
                {
                    existing.timestamp = now;
                    return RecordOutcome::Refreshed;
                }
                log.relations.push(RelationRecord {
                    child: child_sig.clone(),
                    parent: parent_sig.clone(),
                    timestamp: now,
                    method,
                });
                if log.relations.len() > max {
                    let excess = log.relations.len() - max;
                    log.relations.drain(..excess);
                }
                RecordOutcome::Inserted
            })
            .await;

        debug!(
            tab_id = %child.id,
            parent_id = %parent.id,
            url = %child_sig.url,
            method = ?method,
            outcome = ?outcome,
            "relation recorded"
        );
        outcome
    }

    /// Drop every durable record whose child is `url`.
    pub async fn remove_relation(&self, url: &str) -> usize {
        let url = normalize_url(url);
        let removed = self
            .inner
            .storage
            .update_relation_log(|log| {
                let before = log.relations.len();
                log.relations.retain(|r| r.child.url != url);
                before - log.relations.len()
            })
            .await;
        if removed > 0 {
            debug!(url = %url, removed, "durable relations removed");
        }
        removed
    }

    /// Purge records not observed within the retention window.
    pub async fn cleanup(&self) -> usize {
        let cutoff = crate::epoch_ms().saturating_sub(self.inner.config.retention_ms());
        let removed = self
            .inner
            .storage
            .update_relation_log(|log| {
                let before = log.relations.len();
                log.relations.retain(|r| r.timestamp >= cutoff);
                before - log.relations.len()
            })
            .await;
        if removed > 0 {
            info!(removed, "expired relations purged");
        }
        removed
    }

    pub async fn durable_records(&self) -> Vec<RelationRecord> {
        self.inner
            .storage
            .relation_log(|log| log.relations.clone())
            .await
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Rebuild the live map from the durable log and the tabs that are open.
    ///
    /// Does nothing when auto-restore is off or the map is already loaded.
    pub async fn restore_relations(&self) -> RelationMap {
        if let Some(map) = self.tab_relations() {
            return map;
        }
        if !self.inner.settings.feature(Feature::AutoRestore).await {
            return RelationMap::new();
        }

        let tabs = match self.inner.host.query_tabs(TabQuery::all()).await {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(error = %err, "cannot enumerate tabs, restore skipped");
                return RelationMap::new();
            }
        };
        let mut records = self.durable_records().await;

        let mut by_url: HashMap<String, TabId> = HashMap::new();
        for tab in &tabs {
            by_url.insert(normalize_url(tab.effective_url()), tab.id);
        }
        let live_ids: HashSet<TabId> = tabs.iter().map(|t| t.id).collect();

        // Newest first, so the latest owner of a URL pair wins.
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut restored = RelationMap::new();
        for record in &records {
            let (Some(&child), Some(&parent)) =
                (by_url.get(&record.child.url), by_url.get(&record.parent.url))
            else {
                continue;
            };
            if child != parent && !restored.contains_key(&child) {
                restored.insert(child, parent);
            }
        }
        let from_log = restored.len();

        for tab in &tabs {
            if let Some(opener) = tab.opener_tab_id {
                if opener != tab.id && live_ids.contains(&opener) && !restored.contains_key(&tab.id)
                {
                    restored.insert(tab.id, opener);
                }
            }
        }

        let map = {
            let mut live = self.inner.live.lock();
            if let Some(existing) = live.as_mut() {
                // Loaded while we were reading; edges already present win.
                for (child, parent) in restored {
                    existing.entry(child).or_insert(parent);
                }
                existing.clone()
            } else {
                *live = Slot::Loaded(restored.clone());
                restored
            }
        };
        info!(
            restored = map.len(),
            from_log,
            records = records.len(),
            tabs = tabs.len(),
            "tab relations restored"
        );
        map
    }

    // -------------------------------------------------------------------------
    // Live map
    // -------------------------------------------------------------------------

    /// The live map, or `None` while it has not been rebuilt.
    pub fn tab_relations(&self) -> Option<RelationMap> {
        self.inner.live.lock().as_ref().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.live.lock().is_loaded()
    }

    /// The live map, restoring it first when needed.
    pub async fn tab_relations_or_restore(&self) -> RelationMap {
        match self.tab_relations() {
            Some(map) => map,
            None => self.restore_relations().await,
        }
    }

    pub fn parent_of(&self, child: TabId) -> Option<TabId> {
        self.inner
            .live
            .lock()
            .as_ref()
            .and_then(|map| map.get(&child).copied())
    }

    pub fn children_of(&self, parent: TabId) -> Vec<TabId> {
        self.inner.live.lock().as_ref().map_or_else(Vec::new, |map| {
            map.iter()
                .filter(|(_, p)| **p == parent)
                .map(|(c, _)| *c)
                .collect()
        })
    }

    /// Set `parent` as the live parent of `child` and, unless the browser
    /// already reports that opener, log it as a manual relation.
    ///
    /// Self edges and edges that would close a cycle are refused.
    pub async fn set_tab_parent(&self, child: TabId, parent: TabId) -> bool {
        if !self.attach_live(child, parent).await {
            return false;
        }

        let lookup = tokio::try_join!(
            self.inner.host.get_tab(child),
            self.inner.host.get_tab(parent)
        );
        match lookup {
            Ok((child_tab, parent_tab)) => {
                if child_tab.opener_tab_id != Some(parent) {
                    self.record_relation(&child_tab, &parent_tab).await;
                }
            }
            Err(err) => {
                debug!(tab_id = %child, parent_id = %parent, error = %err, "manual relation not logged");
            }
        }
        true
    }

    /// Insert a live edge only, restoring the map first when needed.
    pub async fn attach_live(&self, child: TabId, parent: TabId) -> bool {
        if child == parent {
            return false;
        }
        if !self.is_initialized() {
            self.restore_relations().await;
        }
        {
            let mut live = self.inner.live.lock();
            if !live.is_loaded() {
                *live = Slot::Loaded(RelationMap::new());
            }
            let Some(map) = live.as_mut() else {
                return false;
            };
            if creates_cycle(map, child, parent) {
                warn!(tab_id = %child, parent_id = %parent, "refusing relation that would form a cycle");
                return false;
            }
            map.insert(child, parent);
        }
        debug!(tab_id = %child, parent_id = %parent, "live parent set");
        true
    }

    /// Remove `tab` as a child and detach all of its children.
    ///
    /// Children become roots; they are not handed to their grandparent.
    pub fn remove_tab_relations(&self, tab: TabId) -> usize {
        let mut live = self.inner.live.lock();
        let Some(map) = live.as_mut() else {
            return 0;
        };
        let before = map.len();
        map.remove(&tab);
        map.retain(|_, parent| *parent != tab);
        before - map.len()
    }

    /// Re-log every live child of `parent_id` against its current identity.
    pub async fn update_child_relations_for_updated_parent(
        &self,
        parent_id: TabId,
        parent: &TabInfo,
    ) -> usize {
        let mut updated = 0;
        for child_id in self.children_of(parent_id) {
            match self.inner.host.get_tab(child_id).await {
                Ok(child) => {
                    if matches!(
                        self.record_relation(&child, parent).await,
                        RecordOutcome::Inserted | RecordOutcome::Refreshed
                    ) {
                        updated += 1;
                    }
                }
                Err(err) => debug!(tab_id = %child_id, error = %err, "child vanished, skipped"),
            }
        }
        updated
    }

    /// Forget the live map; the next restore trigger rebuilds it.
    pub fn clear_live(&self) {
        *self.inner.live.lock() = Slot::Unloaded;
    }
}

/// Whether adding `child -> parent` would close a loop, i.e. `child` is
/// already an ancestor of (or equal to) `parent`.
///
/// A map that already contains a loop above `parent` also counts.
pub fn creates_cycle(map: &RelationMap, child: TabId, parent: TabId) -> bool {
    let mut visited = HashSet::new();
    let mut cursor = Some(parent);
    while let Some(current) = cursor {
        if current == child || !visited.insert(current) {
            return true;
        }
        cursor = map.get(&current).copied();
    }
    false
}
