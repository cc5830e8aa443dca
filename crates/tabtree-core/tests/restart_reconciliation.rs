//! End-to-end scenarios across a browser restart and across tab closes.

use std::sync::Arc;

use tabtree_core::config::TabTreeConfig;
use tabtree_core::events::BrowserEvent;
use tabtree_core::file_store::JsonFileStore;
use tabtree_core::host::{KeyValueStore, TabHost};
use tabtree_core::memory::{MemoryStore, MemoryTabHost};
use tabtree_core::model::{TabChange, TabId, TabInfo, WindowId};
use tabtree_core::relations::RelationMethod;
use tabtree_core::service::TabTreeService;
use tabtree_core::storage::RELATIONS_KEY;

fn service(host: &Arc<MemoryTabHost>, store: Arc<dyn KeyValueStore>) -> TabTreeService {
    TabTreeService::new(
        TabTreeConfig::default(),
        Arc::clone(host) as Arc<dyn TabHost>,
        store,
    )
}

async fn emit(service: &TabTreeService, host: &MemoryTabHost, event: BrowserEvent) {
    host.apply(&event);
    service.handle_event(event).await;
}

#[tokio::test]
async fn opener_relation_survives_restart_with_new_ids() {
    let dir = tempfile::tempdir().unwrap();

    // Session 1: A opens B through the native opener link.
    {
        let host = Arc::new(MemoryTabHost::with_tabs([
            TabInfo::new(1, 1, 0, "https://x.com/").active()
        ]));
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let service = service(&host, store);
        service.handle_event(BrowserEvent::Startup).await;

        emit(
            &service,
            &host,
            BrowserEvent::TabCreated {
                tab: TabInfo::new(2, 1, 1, "").with_opener(1),
            },
        )
        .await;
        emit(
            &service,
            &host,
            BrowserEvent::TabUpdated {
                tab_id: TabId(2),
                change: TabChange {
                    url: Some("https://x.com/b".to_string()),
                    ..TabChange::default()
                },
                tab: None,
            },
        )
        .await;

        let records = service.relations().durable_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, RelationMethod::Opener);
        service.shutdown().await;
    }

    assert!(dir.path().join(format!("{RELATIONS_KEY}.json")).exists());

    // Session 2: same URLs, fresh ids, no opener information.
    let host = Arc::new(MemoryTabHost::with_tabs([
        TabInfo::new(10, 7, 0, "https://x.com/"),
        TabInfo::new(11, 7, 1, "https://x.com/b"),
    ]));
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let service = service(&host, store);
    service.handle_event(BrowserEvent::Startup).await;

    assert_eq!(service.relations().parent_of(TabId(11)), Some(TabId(10)));

    let first = service.relations().tab_relations().unwrap();
    let second = service.relations().restore_relations().await;
    assert_eq!(first, second);
    assert_eq!(service.relations().durable_records().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn closing_last_of_three_siblings_activates_previous() {
    let host = Arc::new(MemoryTabHost::with_tabs([
        TabInfo::new(1, 2, 0, "https://hub.test/"),
        TabInfo::new(11, 1, 0, "https://hub.test/one"),
        TabInfo::new(12, 1, 1, "https://hub.test/two"),
        TabInfo::new(13, 1, 2, "https://hub.test/three").active(),
    ]));
    let store = Arc::new(MemoryStore::new());
    let service = service(&host, store);
    service.startup().await;
    for child in [11, 12, 13] {
        assert!(service.relations().set_tab_parent(TabId(child), TabId(1)).await);
    }

    emit(
        &service,
        &host,
        BrowserEvent::TabRemoved {
            tab_id: TabId(13),
            window_id: WindowId(1),
            window_closing: false,
        },
    )
    .await;

    assert_eq!(host.activations(), vec![TabId(12)]);
    assert_eq!(service.relations().children_of(TabId(1)), vec![TabId(11), TabId(12)]);
}

#[tokio::test(start_paused = true)]
async fn closing_leftwards_keeps_moving_left() {
    let host = Arc::new(MemoryTabHost::with_tabs(
        (0..5).map(|i| TabInfo::new(i + 1, 1, i as usize, format!("https://t.test/{i}"))),
    ));
    let store = Arc::new(MemoryStore::new());
    let service = service(&host, store);
    service.startup().await;

    for closed in [4, 3] {
        emit(
            &service,
            &host,
            BrowserEvent::TabRemoved {
                tab_id: TabId(closed),
                window_id: WindowId(1),
                window_closing: false,
            },
        )
        .await;
    }

    // Closing index 3 then index 2 turns the direction left, so tab 2
    // (left of tab 3) is chosen over tab 5.
    assert_eq!(host.activations(), vec![TabId(5), TabId(2)]);
}

#[tokio::test(start_paused = true)]
async fn bursts_of_changes_become_one_write() {
    let host = Arc::new(MemoryTabHost::with_tabs([
        TabInfo::new(1, 1, 0, "https://a.test/").active()
    ]));
    let store = Arc::new(MemoryStore::new());
    let service = service(&host, Arc::clone(&store) as Arc<dyn KeyValueStore>);
    service.startup().await;
    let baseline = store.write_count();

    for i in 0..10u64 {
        emit(
            &service,
            &host,
            BrowserEvent::TabCreated {
                tab: TabInfo::new(100 + i, 1, 1, format!("https://a.test/{i}")),
            },
        )
        .await;
    }
    assert_eq!(store.write_count(), baseline);

    tokio::time::sleep(std::time::Duration::from_millis(5_100)).await;
    assert_eq!(store.write_count(), baseline + 1);
    let stored = store.value(RELATIONS_KEY).unwrap();
    assert_eq!(stored["relations"].as_array().unwrap().len(), 10);
}
