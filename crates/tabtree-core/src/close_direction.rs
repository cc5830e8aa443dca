//! Picks which tab to activate when the user closes the active tab.
//!
//! The choice follows the direction the user has been closing tabs in: two
//! consecutive closes moving left mean "keep going left", anything else means
//! "go right". Candidates are the closed tab's siblings in the tab tree,
//! falling back to its parent.
//!
//! By the time the host reports a removal it has already re-indexed the
//! surviving tabs, so positions come from a [`TabIndexSnapshot`] taken before
//! the removal, and the pre-removal order is reconstructed from it.

use crate::model::{TabId, TabInfo, WindowId};
use crate::relations::RelationMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseDirection {
    Left,
    #[default]
    Right,
}

/// The last two close positions and the direction they imply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseDirectionState {
    pub last_closed_index: Option<usize>,
    pub before_last_closed_index: Option<usize>,
    pub current_direction: CloseDirection,
}

impl CloseDirectionState {
    /// Record a close at `index` and re-derive the direction.
    ///
    /// With fewer than two observations the previous direction stands.
    pub fn observe(&mut self, index: usize) -> CloseDirection {
        self.before_last_closed_index = self.last_closed_index;
        self.last_closed_index = Some(index);
        if let (Some(last), Some(before)) = (self.last_closed_index, self.before_last_closed_index) {
            self.current_direction = if last < before {
                CloseDirection::Left
            } else {
                CloseDirection::Right
            };
        }
        self.current_direction
    }
}

/// Where a tab sat the last time the snapshot was refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub index: usize,
    pub window_id: WindowId,
}

pub type TabIndexSnapshot = HashMap<TabId, IndexEntry>;

/// Pre-removal order of `siblings` with the closed tab put back at
/// `closed_index`. Returns `(tab, original index)` sorted by original index.
pub fn reconstruct_order(
    closed: TabId,
    closed_index: usize,
    siblings: &[(TabId, usize)],
) -> Vec<(TabId, usize)> {
    let mut order: Vec<(TabId, usize)> = siblings
        .iter()
        .map(|&(id, index)| {
            let original = if index < closed_index { index } else { index + 1 };
            (id, original)
        })
        .collect();
    order.push((closed, closed_index));
    order.sort_by_key(|&(_, original)| original);
    order
}

/// Choose the tab to activate after `closed` was removed.
///
/// `live_tabs` is the post-removal tab list. When the closed tab's parent is
/// still open, siblings are the parent's other children and the parent is the
/// last resort. Otherwise siblings are the root tabs of the same window and
/// there is no last resort.
pub fn find_next_tab_to_activate(
    closed: TabId,
    closed_at: IndexEntry,
    relations: &RelationMap,
    live_tabs: &[TabInfo],
    direction: CloseDirection,
) -> Option<TabId> {
    let parent = relations
        .get(&closed)
        .copied()
        .filter(|p| live_tabs.iter().any(|t| t.id == *p));

    let siblings: Vec<(TabId, usize)> = live_tabs
        .iter()
        .filter(|t| t.id != closed && t.window_id == closed_at.window_id)
        .filter(|t| relations.get(&t.id).copied() == parent)
        .map(|t| (t.id, t.index))
        .collect();

    let order = reconstruct_order(closed, closed_at.index, &siblings);
    let position = order.iter().position(|&(id, _)| id == closed)?;
    let previous = position.checked_sub(1).map(|i| order[i].0);
    let next = order.get(position + 1).map(|&(id, _)| id);

    match direction {
        CloseDirection::Right => next.or(previous).or(parent),
        CloseDirection::Left => previous.or(next).or(parent),
    }
}

/// Close-direction state plus the index snapshot it reads from.
#[derive(Debug, Default)]
pub struct CloseTracker {
    state: Mutex<CloseDirectionState>,
    snapshot: Mutex<TabIndexSnapshot>,
}

impl CloseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(&self) -> CloseDirection {
        self.state.lock().current_direction
    }

    pub fn state(&self) -> CloseDirectionState {
        *self.state.lock()
    }

    pub fn entry(&self, tab: TabId) -> Option<IndexEntry> {
        self.snapshot.lock().get(&tab).copied()
    }

    /// Feed the snapshot position of a just-closed tab into the direction
    /// state. Must run before the snapshot is refreshed.
    pub fn record_close(&self, tab: TabId) -> Option<IndexEntry> {
        let entry = self.entry(tab)?;
        self.state.lock().observe(entry.index);
        Some(entry)
    }

    /// Overwrite snapshot entries with the current positions.
    pub fn refresh(&self, tabs: &[TabInfo]) {
        let mut snapshot = self.snapshot.lock();
        for tab in tabs {
            snapshot.insert(
                tab.id,
                IndexEntry {
                    index: tab.index,
                    window_id: tab.window_id,
                },
            );
        }
    }

    pub fn forget(&self, tab: TabId) {
        self.snapshot.lock().remove(&tab);
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot.lock().len()
    }
}
