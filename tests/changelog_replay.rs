//! Integration tests for replaying persisted change logs on restart

use flowgate::changelog::{ChangeLog, Command, Resource};
use flowgate::config::InitResources;
use flowgate::resources::{Collection, Document, Namespace, Route, Service};
use flowgate::state::StateManager;
use flowgate::state::{GatewayState, StateOptions};
use flowgate::storage::FileStorage;
use flowgate::store::Store;
use std::path::Path;
use std::sync::Arc;

async fn open(dir: &Path, options: StateOptions) -> Arc<GatewayState> {
    let store = Store::new(Arc::new(FileStorage::new(dir)));
    let state = GatewayState::new(Arc::new(store), options);
    state.start().await.unwrap();
    state
}

fn add<T: serde::Serialize>(resource: Resource, namespace: &str, name: &str, item: &T) -> ChangeLog {
    ChangeLog::new(Command::add(resource), namespace, name, item).unwrap()
}

fn delete<T: serde::Serialize>(resource: Resource, namespace: &str, name: &str, item: &T) -> ChangeLog {
    ChangeLog::new(Command::delete(resource), namespace, name, item).unwrap()
}

#[tokio::test]
async fn test_restart_restores_resource_graph() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::new("billing", "default", vec!["http://billing:8080".to_string()]);
    let mut route = Route::new("billing", "default");
    route.paths = vec!["/billing/*".to_string()];
    route.service = Some("billing".to_string());

    {
        let state = open(dir.path(), StateOptions::default()).await;
        state.apply_change_log(add(Resource::Service, "default", "billing", &service)).await.unwrap();
        state.apply_change_log(add(Resource::Route, "default", "billing", &route)).await.unwrap();
        state.shutdown().await.unwrap();
    }

    let state = open(dir.path(), StateOptions::default()).await;
    {
        let resources = state.resources().await;
        let restored = resources.get_route("default", "billing").expect("route restored");
        assert_eq!(resources.route_service(restored).map(|s| s.name.as_str()), Some("billing"));
    }
    assert!(*state.subscribe_revision().borrow() > 0);
    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_compacts_cancelled_changes() {
    let dir = tempfile::tempdir().unwrap();
    let temp = Namespace::new("scratch");
    let service = Service::new("api", "default", vec!["http://api:8080".to_string()]);

    {
        let state = open(dir.path(), StateOptions::default()).await;
        state.apply_change_log(add(Resource::Namespace, "scratch", "scratch", &temp)).await.unwrap();
        state.apply_change_log(delete(Resource::Namespace, "scratch", "scratch", &temp)).await.unwrap();
        state.apply_change_log(add(Resource::Service, "default", "api", &service)).await.unwrap();
        state.apply_change_log(add(Resource::Service, "default", "api", &service)).await.unwrap();
        assert_eq!(state.store().fetch_change_logs().await.unwrap().len(), 4);
        state.shutdown().await.unwrap();
    }

    let state = open(dir.path(), StateOptions::default()).await;
    let remaining = state.store().fetch_change_logs().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].cmd, Command::add(Resource::Service));
    assert!(state.resources().await.get_namespace("scratch").is_none());
    assert!(state.resources().await.get_service("default", "api").is_some());
    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_init_resources_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let init = InitResources {
        namespaces: vec![Namespace::new("payments")],
        services: vec![Service::new("ledger", "payments", vec!["http://ledger:8080".to_string()])],
        ..Default::default()
    };

    {
        let state = open(dir.path(), StateOptions::default()).await;
        assert_eq!(state.apply_init_resources(&init).await.unwrap(), 2);
        state.shutdown().await.unwrap();
    }

    let state = open(dir.path(), StateOptions::default()).await;
    assert!(state.resources().await.get_service("payments", "ledger").is_some());
    // reapplying the same resources is an upsert
    assert_eq!(state.apply_init_resources(&init).await.unwrap(), 2);
    assert_eq!(state.resources().await.list_services(Some("payments")).len(), 1);
    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_debug_mode_skips_broken_change_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut orphan = Route::new("orphan", "default");
    orphan.service = Some("missing".to_string());
    let service = Service::new("ok", "default", vec!["http://ok:8080".to_string()]);

    {
        // written directly so the broken entry reaches storage
        let store = Store::new(Arc::new(FileStorage::new(dir.path())));
        store.connect().await.unwrap();
        store
            .persist_change_log(&add(Resource::Route, "default", "orphan", &orphan))
            .await
            .unwrap();
        store
            .persist_change_log(&add(Resource::Service, "default", "ok", &service))
            .await
            .unwrap();
        store.shutdown().await.unwrap();
    }

    {
        let store = Store::new(Arc::new(FileStorage::new(dir.path())));
        let strict = GatewayState::new(Arc::new(store), StateOptions::default());
        assert!(strict.start().await.is_err());
        strict.shutdown().await.unwrap();
    }

    let state = open(
        dir.path(),
        StateOptions {
            debug: true,
            ..Default::default()
        },
    )
    .await;
    assert!(state.resources().await.get_service("default", "ok").is_some());
    assert!(state.resources().await.get_route("default", "orphan").is_none());
    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deleted_service_stays_deleted_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = Service::new("s1", "default", vec!["http://s1-v1:8080".to_string()]);
    let v2 = Service::new("s1", "default", vec!["http://s1-v2:8080".to_string()]);
    let other = Namespace::new("other");

    {
        let state = open(dir.path(), StateOptions::default()).await;
        state.apply_change_log(add(Resource::Service, "default", "s1", &v1)).await.unwrap();
        state.apply_change_log(add(Resource::Namespace, "other", "other", &other)).await.unwrap();
        state.apply_change_log(add(Resource::Service, "default", "s1", &v2)).await.unwrap();
        state.apply_change_log(delete(Resource::Service, "default", "s1", &v2)).await.unwrap();
        state.shutdown().await.unwrap();
    }

    for _ in 0..2 {
        let state = open(dir.path(), StateOptions::default()).await;
        assert!(state.resources().await.get_service("default", "s1").is_none());
        assert!(state.resources().await.get_namespace("other").is_some());
        let remaining = state.store().fetch_change_logs().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "other");
        state.shutdown().await.unwrap();
    }
}

fn collection(name: &str) -> Collection {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "namespace": "default",
        "type": "document",
        "visibility": "private"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_names_with_slash_rejected_and_keys_escaped() {
    let dir = tempfile::tempdir().unwrap();
    let state = open(dir.path(), StateOptions::default()).await;

    let nested = Service::new("users/archive", "default", vec!["http://archive:8080".to_string()]);
    assert!(state
        .apply_change_log(add(Resource::Service, "default", "users/archive", &nested))
        .await
        .is_err());
    assert!(state
        .apply_change_log(add(Resource::Collection, "default", "a/b", &collection("a/b")))
        .await
        .is_err());
    assert!(state.store().fetch_change_logs().await.unwrap().is_empty());

    // `%2F` is the escaped form of `/`, so this collection must not alias `a/...`
    for name in ["a", "a%2Fb"] {
        state.apply_change_log(add(Resource::Collection, "default", name, &collection(name))).await.unwrap();
        let doc = Document::new("d1", "default", name, serde_json::json!({ "owner": name }));
        state.apply_change_log(add(Resource::Document, "default", "d1", &doc)).await.unwrap();
    }
    state.store().delete_documents("default", "a").await.unwrap();
    assert!(state.store().fetch_documents("default", "a", None, 0).await.unwrap().is_empty());
    let kept = state.store().fetch_documents("default", "a%2Fb", None, 0).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].data["owner"], "a%2Fb");
    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_restore_carries_documents_across_restart() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();

    let source = open(source_dir.path(), StateOptions::default()).await;
    source.apply_change_log(add(Resource::Collection, "default", "orders", &collection("orders"))).await.unwrap();
    let order = Document::new("o-1", "default", "orders", serde_json::json!({ "total": 12 }));
    source.apply_change_log(add(Resource::Document, "default", "o-1", &order)).await.unwrap();
    let snapshot = source.snapshot().await.unwrap();
    assert_eq!(snapshot.documents.len(), 1);
    source.shutdown().await.unwrap();

    {
        let target = open(target_dir.path(), StateOptions::default()).await;
        let stale = Service::new("stale", "default", vec!["http://stale:8080".to_string()]);
        target.apply_change_log(add(Resource::Service, "default", "stale", &stale)).await.unwrap();
        target.restore(&snapshot).await.unwrap();
        assert!(target.resources().await.get_service("default", "stale").is_none());
        target.shutdown().await.unwrap();
    }

    let target = open(target_dir.path(), StateOptions::default()).await;
    assert!(target.resources().await.get_service("default", "stale").is_none());
    assert!(target.resources().await.get_collection("default", "orders").is_some());
    let doc = target.store().fetch_document("default", "orders", "o-1").await.unwrap();
    assert_eq!(doc.data["total"], 12);
    target.shutdown().await.unwrap();
}
