//! Back/forward navigation over runtime tab ids.
//!
//! The history is a bounded list of tab ids with a cursor. Ids are only valid
//! for the current browser session, so stale entries are pruned lazily when a
//! traversal walks over them.
//!
//! On the wire the cursor is an integer where `-1` means "no current entry".

use serde::{Deserialize, Serialize};

use crate::model::TabId;

pub const DEFAULT_MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredHistory")]
pub struct NavigationHistory {
    history: Vec<TabId>,
    #[serde(with = "cursor")]
    current_index: Option<usize>,
    /// Set while a back/forward traversal is activating a tab
    is_navigation_action: bool,
    #[serde(rename = "lastNavigationTime")]
    last_navigation_ms: u64,
    #[serde(skip)]
    max_entries: usize,
}

/// Wire form; the cursor is only trusted after [`NavigationHistory::clamp`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredHistory {
    #[serde(default)]
    history: Vec<TabId>,
    #[serde(default, with = "cursor")]
    current_index: Option<usize>,
    #[serde(default)]
    is_navigation_action: bool,
    #[serde(default)]
    last_navigation_time: u64,
}

impl From<StoredHistory> for NavigationHistory {
    fn from(stored: StoredHistory) -> Self {
        let mut history = Self {
            history: stored.history,
            current_index: stored.current_index,
            is_navigation_action: stored.is_navigation_action,
            last_navigation_ms: stored.last_navigation_time,
            max_entries: DEFAULT_MAX_ENTRIES,
        };
        history.clamp();
        history
    }
}

impl Default for NavigationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl NavigationHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            history: Vec::new(),
            current_index: None,
            is_navigation_action: false,
            last_navigation_ms: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Adopt a history received from a UI surface, keeping our own bound.
    pub fn replace_with(&mut self, mut other: Self) {
        other.max_entries = self.max_entries;
        other.clamp();
        *self = other;
    }

    pub fn entries(&self) -> &[TabId] {
        &self.history
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Append `id` as the new current entry, discarding forward entries.
    ///
    /// Returns `false` when `id` is already current.
    pub fn add_tab(&mut self, id: TabId) -> bool {
        if self.current_tab() == Some(id) {
            return false;
        }
        let keep = self.current_index.map_or(0, |i| i + 1);
        self.history.truncate(keep);
        self.history.push(id);
        self.current_index = Some(self.history.len() - 1);

        while self.history.len() > self.max_entries {
            self.history.remove(0);
            self.current_index = self.current_index.and_then(|i| i.checked_sub(1));
        }
        true
    }

    /// Step back to the nearest entry that is still live.
    ///
    /// Dead entries passed on the way are removed.
    pub fn previous_tab(&mut self, is_live: impl Fn(TabId) -> bool) -> Option<TabId> {
        let current = self.current_index?;
        let mut i = current;
        let mut cursor = current;
        while i > 0 {
            i -= 1;
            let id = self.history[i];
            if is_live(id) {
                self.current_index = Some(i);
                return Some(id);
            }
            self.history.remove(i);
            cursor -= 1;
        }
        self.current_index = Some(cursor);
        None
    }

    /// Step forward to the nearest entry that is still live.
    pub fn next_tab(&mut self, is_live: impl Fn(TabId) -> bool) -> Option<TabId> {
        let i = self.current_index.map_or(0, |i| i + 1);
        while i < self.history.len() {
            let id = self.history[i];
            if is_live(id) {
                self.current_index = Some(i);
                return Some(id);
            }
            self.history.remove(i);
        }
        None
    }

    /// Drop every occurrence of `id`, keeping the cursor on the same entry
    /// where possible.
    pub fn remove_tab(&mut self, id: TabId) -> bool {
        let before = self.history.len();
        let mut i = 0;
        while i < self.history.len() {
            if self.history[i] == id {
                self.history.remove(i);
                if let Some(current) = self.current_index {
                    if i <= current {
                        self.current_index = current.checked_sub(1);
                    }
                }
            } else {
                i += 1;
            }
        }
        if self.current_index.is_none() && !self.history.is_empty() {
            self.current_index = Some(0);
        }
        self.history.len() != before
    }

    pub fn can_go_back(&self) -> bool {
        self.current_index.is_some_and(|i| i > 0)
    }

    pub fn can_go_forward(&self) -> bool {
        match self.current_index {
            Some(i) => i + 1 < self.history.len(),
            None => !self.history.is_empty(),
        }
    }

    pub fn current_tab(&self) -> Option<TabId> {
        self.current_index.and_then(|i| self.history.get(i).copied())
    }

    /// Move the cursor to `id` if it is in the history.
    pub fn set_current_tab(&mut self, id: TabId) -> bool {
        match self.history.iter().position(|t| *t == id) {
            Some(index) => {
                self.current_index = Some(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.current_index = None;
        self.is_navigation_action = false;
        self.last_navigation_ms = 0;
    }

    /// Mark that a traversal is about to activate a tab.
    pub fn begin_navigation(&mut self, now_ms: u64) {
        self.is_navigation_action = true;
        self.last_navigation_ms = now_ms;
    }

    /// Whether a traversal started within `timeout_ms` is still in flight.
    pub fn is_navigating(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.is_navigation_action && now_ms.saturating_sub(self.last_navigation_ms) <= timeout_ms
    }

    /// Reset the navigation flag once it is older than `timeout_ms`.
    pub fn expire_navigation(&mut self, now_ms: u64, timeout_ms: u64) -> bool {
        if self.is_navigation_action
            && self.last_navigation_ms > 0
            && now_ms.saturating_sub(self.last_navigation_ms) > timeout_ms
        {
            self.is_navigation_action = false;
            self.last_navigation_ms = 0;
            return true;
        }
        false
    }

    fn clamp(&mut self) {
        while self.history.len() > self.max_entries {
            self.history.remove(0);
            self.current_index = self.current_index.and_then(|i| i.checked_sub(1));
        }
        if let Some(i) = self.current_index {
            if i >= self.history.len() {
                self.current_index = self.history.len().checked_sub(1);
            }
        }
    }
}

mod cursor {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<usize>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(i) => serializer.serialize_i64(*i as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(usize::try_from(raw).ok())
    }
}
