//! tabtree-core: persistent parent/child tab trees for browser extensions
//!
//! Browsers hand out tab ids that are only valid for one session. This crate
//! keeps a live `child id -> parent id` map for the running session, mirrors
//! every edge into a URL-keyed durable log, and rebuilds the live map from that
//! log whenever the browser comes back with a fresh set of ids.
//!
//! # Architecture
//!
//! ```text
//! BrowserEvent ──► TabTreeService ──► RelationEngine ──► StorageManager ──► KeyValueStore
//!      │                 │                  │
//!   Request              ├─► CloseTracker   └─► TabHost (query/get/activate)
//!      │                 ├─► PinnedRegistry
//!   Response             └─► NavigationHistory, SettingsCache
//! ```
//!
//! # Modules
//!
//! - `scheduler`: delay-coalescing task executor
//! - `storage`: lazily hydrated caches with coalesced durable writes
//! - `settings`: time-boxed feature flag cache
//! - `relations`: live/durable relation reconciliation
//! - `close_direction`: sibling selection when the active tab closes
//! - `pinned`: URL-keyed pin registry
//! - `history`: back/forward navigation over tab ids
//! - `service`: composition root and event loop
//! - `messages`: request/response channel for UI surfaces
//! - `host`, `memory`, `file_store`: host browser and storage seams
//! - `config`, `logging`, `error`: ambient plumbing

#![forbid(unsafe_code)]

pub mod close_direction;
pub mod config;
pub mod error;
pub mod events;
pub mod file_store;
pub mod history;
pub mod host;
pub mod logging;
pub mod memory;
pub mod messages;
pub mod model;
pub mod pinned;
pub mod relations;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod signature;
pub mod storage;

pub use error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
