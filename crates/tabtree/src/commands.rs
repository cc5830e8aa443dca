//! Subcommand implementations.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::DateTime;
use serde_json::{Value, json};
use tabtree_core::Error;
use tabtree_core::config::TabTreeConfig;
use tabtree_core::events::BrowserEvent;
use tabtree_core::file_store::JsonFileStore;
use tabtree_core::host::{KeyValueStore, TabHost};
use tabtree_core::memory::{MemoryStore, MemoryTabHost};
use tabtree_core::model::{TabId, TabInfo, WindowId};
use tabtree_core::relations::{RelationLog, RelationMap, RelationMethod};
use tabtree_core::service::TabTreeService;
use tabtree_core::storage::RELATIONS_KEY;

fn format_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn method_label(method: RelationMethod) -> &'static str {
    match method {
        RelationMethod::Opener => "opener",
        RelationMethod::Manual => "manual",
    }
}

/// Print the durable relation log, oldest first.
pub async fn log(store_dir: &Path, json: bool) -> anyhow::Result<()> {
    let store = JsonFileStore::new(store_dir);
    let mut found = store.get(&[RELATIONS_KEY]).await.map_err(Error::from)?;
    let log: RelationLog = match found.remove(RELATIONS_KEY) {
        Some(value) => serde_json::from_value(value)
            .map_err(Error::from)
            .with_context(|| format!("{RELATIONS_KEY}.json is malformed"))?,
        None => RelationLog::default(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&log.relations)?);
        return Ok(());
    }
    if log.relations.is_empty() {
        println!("no relations recorded in {}", store_dir.display());
        return Ok(());
    }
    for record in &log.relations {
        println!(
            "{}  {:<6}  {} -> {}",
            format_timestamp(record.timestamp),
            method_label(record.method),
            record.parent.url,
            record.child.url
        );
    }
    Ok(())
}

/// Purge expired durable state and write the result back.
pub async fn cleanup(config: TabTreeConfig, store_dir: &Path) -> anyhow::Result<()> {
    let scroll_retention = config.scroll.retention_ms();
    let store = Arc::new(JsonFileStore::new(store_dir));
    let host = Arc::new(MemoryTabHost::new());
    let service = TabTreeService::new(config, host, store);

    let relations = service.relations().cleanup().await;
    let pins = service.pinned().cleanup_expired_pinned_tabs().await;
    let scroll = service
        .storage()
        .cleanup_old_scroll_positions(scroll_retention)
        .await;
    service
        .storage()
        .force_write()
        .await
        .map_err(Error::from)
        .context("failed to write cleaned state")?;

    println!("removed {relations} relations, {pins} pins, {scroll} scroll positions");
    Ok(())
}

/// Feed a JSONL script to a service backed by an in-memory browser.
pub async fn replay(
    config: TabTreeConfig,
    script: &Path,
    store_dir: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(script)
        .await
        .map_err(Error::from)
        .with_context(|| format!("failed to read {}", script.display()))?;

    let host = Arc::new(MemoryTabHost::new());
    let store: Arc<dyn KeyValueStore> = match store_dir {
        Some(dir) => Arc::new(JsonFileStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };
    let service = TabTreeService::new(config, Arc::clone(&host) as Arc<dyn TabHost>, store);

    let mut responses = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        let line_no = n + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(Error::from)
            .with_context(|| format!("line {line_no}: not valid JSON"))?;

        if value.get("action").is_some() {
            let response = service.handle_message(value).await;
            responses.push(json!({ "line": line_no, "response": response }));
        } else {
            let event: BrowserEvent = serde_json::from_value(value)
                .map_err(Error::from)
                .with_context(|| format!("line {line_no}: not a browser event"))?;
            host.apply(&event);
            service.handle_event(event).await;
        }
    }

    let relations = service.relations().tab_relations_or_restore().await;
    service.shutdown().await;
    let tabs = host.snapshot();

    if json {
        let output = json!({
            "relations": relations,
            "tabs": tabs,
            "responses": responses,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for line in render_tree(&tabs, &relations) {
        println!("{line}");
    }
    for response in &responses {
        println!("line {}: {}", response["line"], response["response"]);
    }
    Ok(())
}

/// Indented tree per window. Tabs whose parent is gone are roots.
fn render_tree(tabs: &[TabInfo], relations: &RelationMap) -> Vec<String> {
    let live: HashSet<TabId> = tabs.iter().map(|t| t.id).collect();
    let mut children: BTreeMap<TabId, Vec<&TabInfo>> = BTreeMap::new();
    let mut windows: BTreeMap<WindowId, Vec<&TabInfo>> = BTreeMap::new();
    for tab in tabs {
        match relations.get(&tab.id).filter(|p| live.contains(*p)) {
            Some(parent) => children.entry(*parent).or_default().push(tab),
            None => windows.entry(tab.window_id).or_default().push(tab),
        }
    }

    let mut lines = Vec::new();
    if tabs.is_empty() {
        lines.push("no open tabs".to_string());
        return lines;
    }
    let mut seen = HashSet::new();
    for (window, roots) in &windows {
        lines.push(format!("window {window}"));
        for root in roots {
            push_subtree(root, 1, &children, &mut seen, &mut lines);
        }
    }
    lines
}

fn push_subtree(
    tab: &TabInfo,
    depth: usize,
    children: &BTreeMap<TabId, Vec<&TabInfo>>,
    seen: &mut HashSet<TabId>,
    lines: &mut Vec<String>,
) {
    if !seen.insert(tab.id) {
        return;
    }
    lines.push(format!("{}[{}] {}", "  ".repeat(depth), tab.id, tab.effective_url()));
    for child in children.get(&tab.id).into_iter().flatten() {
        push_subtree(child, depth + 1, children, seen, lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_nests_children_under_live_parents() {
        let tabs = vec![
            TabInfo::new(1, 1, 0, "https://a.test/"),
            TabInfo::new(2, 1, 1, "https://a.test/b"),
            TabInfo::new(3, 1, 2, "https://c.test/"),
        ];
        let relations = RelationMap::from([(TabId(2), TabId(1)), (TabId(3), TabId(99))]);

        assert_eq!(
            render_tree(&tabs, &relations),
            vec![
                "window 1",
                "  [1] https://a.test/",
                "    [2] https://a.test/b",
                "  [3] https://c.test/",
            ]
        );
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
