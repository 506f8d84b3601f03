//! State reconciler against an in-memory container runtime.

mod common;

use chrono::{Duration, Utc};
use common::{container, reconciler_with, FakeRuntime};
use fleet_manager::state::{ContainerStatus, Host, HostStatus, ManagedContainer};
use fleet_manager::{Error, SyncOutcome};

fn synced(outcome: SyncOutcome) -> fleet_manager::reconciler::SyncReport {
    match outcome {
        SyncOutcome::Synced(report) => report,
        SyncOutcome::RuntimeUnavailable => panic!("expected a successful sync"),
    }
}

// =============================================================================
// Host registration
// =============================================================================

#[tokio::test]
async fn test_register_local_host_is_idempotent() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;

    let first = reconciler.register_local_host().await.unwrap();
    let second = reconciler.register_local_host().await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.ip, "127.0.0.1");
    assert_eq!(second.status, HostStatus::Online);
    assert_eq!(second.tags, vec!["local"]);
    assert!(second.last_seen >= first.last_seen);
    assert_eq!(reconciler.list_hosts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_adopts_row_added_under_loopback_alias() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;

    let added = reconciler
        .add_host("old-name", "localhost", vec!["gpu".to_string()])
        .await
        .unwrap();
    assert_eq!(added.ip, "127.0.0.1");

    let registered = reconciler.register_local_host().await.unwrap();
    assert_eq!(registered.id, added.id);
    assert_eq!(registered.name, "test-box");
    assert_eq!(registered.tags, vec!["gpu", "local"]);
    assert_eq!(registered.status, HostStatus::Online);
}

#[tokio::test]
async fn test_resources_kept_when_runtime_unavailable() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime.clone()).await;

    runtime.set_available(false);
    let host = reconciler.register_local_host().await.unwrap();
    assert!(host.resources.is_none());

    runtime.set_available(true);
    let host = reconciler.register_local_host().await.unwrap();
    let resources = host.resources.expect("snapshot taken");
    assert_eq!(resources.cpus, 8);

    runtime.set_available(false);
    let host = reconciler.register_local_host().await.unwrap();
    assert_eq!(host.resources.map(|r| r.cpus), Some(8));
}

#[tokio::test]
async fn test_add_host_adopts_by_normalized_ip() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;

    let a = reconciler
        .add_host("edge-1", "10.0.0.5", vec!["edge".to_string()])
        .await
        .unwrap();
    assert_eq!(a.status, HostStatus::Offline);
    assert!(a.last_seen.is_none());

    let b = reconciler
        .add_host("edge-1b", "::ffff:10.0.0.5", vec!["arm".to_string()])
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(b.name, "edge-1b");
    assert_eq!(b.tags, vec!["edge", "arm"]);
    assert_eq!(reconciler.list_hosts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_unknown_host_is_not_found() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;
    let err = reconciler.delete_host("missing").await.unwrap_err();
    assert!(matches!(err, Error::HostNotFound(_)));
}

// =============================================================================
// Container sync
// =============================================================================

#[tokio::test]
async fn test_sync_counts_running_and_exited() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![
        container("a", ContainerStatus::Running),
        container("b", ContainerStatus::Exited),
    ]);
    let (_store, reconciler) = reconciler_with(runtime).await;

    let report = synced(reconciler.sync_containers().await.unwrap());
    assert_eq!(report.inserted, 2);
    assert_eq!(report.system.total_containers, 2);
    assert_eq!(report.system.running_containers, 1);
    assert_eq!(report.system.total_hosts, 1);

    let status = reconciler.system_status().await.unwrap();
    assert_eq!(status.total_containers, 2);
    assert_eq!(status.running_containers, 1);

    let containers = reconciler.list_containers(None).await.unwrap();
    assert_eq!(containers.len(), 2);
    assert!(containers.iter().all(|c| c.host_id == report.host_id));
    assert_eq!(containers[0].name, "a-name");
}

#[tokio::test]
async fn test_sync_converges_on_runtime_listing() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![
        container("a", ContainerStatus::Running),
        container("b", ContainerStatus::Exited),
    ]);
    let (_store, reconciler) = reconciler_with(runtime.clone()).await;
    synced(reconciler.sync_containers().await.unwrap());

    runtime.set_containers(vec![
        container("b", ContainerStatus::Running),
        container("c", ContainerStatus::Created),
    ]);
    let report = synced(reconciler.sync_containers().await.unwrap());
    assert_eq!((report.inserted, report.updated, report.deleted), (1, 1, 1));

    let rows: Vec<(String, ContainerStatus)> = reconciler
        .list_containers(None)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.status))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("b".to_string(), ContainerStatus::Running),
            ("c".to_string(), ContainerStatus::Created),
        ]
    );

    // Nothing left to do on a second pass
    let again = synced(reconciler.sync_containers().await.unwrap());
    assert_eq!((again.inserted, again.updated, again.deleted), (0, 0, 0));
    assert_eq!(again.system.running_containers, 1);
}

#[tokio::test]
async fn test_sync_with_runtime_down_is_a_noop() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![container("a", ContainerStatus::Running)]);
    let (_store, reconciler) = reconciler_with(runtime.clone()).await;
    synced(reconciler.sync_containers().await.unwrap());

    runtime.set_available(false);
    runtime.set_containers(Vec::new());
    let outcome = reconciler.sync_containers().await.unwrap();
    assert_eq!(outcome, SyncOutcome::RuntimeUnavailable);
    assert_eq!(reconciler.list_containers(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_before_registration_registers_host() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;
    assert!(reconciler.list_hosts().await.unwrap().is_empty());

    synced(reconciler.sync_containers().await.unwrap());
    assert_eq!(reconciler.list_hosts().await.unwrap().len(), 1);
}

// =============================================================================
// Container operations
// =============================================================================

#[tokio::test]
async fn test_remove_container_from_runtime_and_catalog() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![
        container("a", ContainerStatus::Running),
        container("b", ContainerStatus::Exited),
    ]);
    let (_store, reconciler) = reconciler_with(runtime.clone()).await;
    synced(reconciler.sync_containers().await.unwrap());

    reconciler.remove_container("a").await.unwrap();
    assert_eq!(runtime.ids(), vec!["b"]);
    assert!(reconciler.catalog().get_container("a").await.unwrap().is_none());
    assert_eq!(reconciler.system_status().await.unwrap().total_containers, 1);

    // Already gone from the runtime: catalog row still dropped
    runtime.set_containers(Vec::new());
    reconciler.remove_container("b").await.unwrap();
    assert!(reconciler.list_containers(None).await.unwrap().is_empty());

    let err = reconciler.remove_container("zzz").await.unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound(_)));
}

#[tokio::test]
async fn test_start_and_stop_container_refresh_catalog() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![container("a", ContainerStatus::Exited)]);
    let (_store, reconciler) = reconciler_with(runtime).await;
    synced(reconciler.sync_containers().await.unwrap());

    synced(reconciler.start_container("a").await.unwrap());
    let row = reconciler.catalog().get_container("a").await.unwrap().unwrap();
    assert_eq!(row.status, ContainerStatus::Running);

    synced(reconciler.stop_container("a").await.unwrap());
    let row = reconciler.catalog().get_container("a").await.unwrap().unwrap();
    assert_eq!(row.status, ContainerStatus::Exited);
}

#[tokio::test]
async fn test_exec_and_logs() {
    let runtime = FakeRuntime::new();
    runtime.set_containers(vec![container("a", ContainerStatus::Running)]);
    let (_store, reconciler) = reconciler_with(runtime.clone()).await;
    synced(reconciler.sync_containers().await.unwrap());

    let output = reconciler
        .exec_in_container("a", &["echo".to_string(), "hi".to_string()])
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout, "echo hi");

    let logs = reconciler.get_container_logs("a", 5).await.unwrap();
    assert_eq!(logs, "last 5 lines of a");

    assert!(matches!(
        reconciler.exec_in_container("a", &[]).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        reconciler.get_container_logs("nope", 5).await,
        Err(Error::ContainerNotFound(_))
    ));

    // Runtime forgot the container but the catalog has not caught up yet
    runtime.set_containers(Vec::new());
    assert!(matches!(
        reconciler.get_container_logs("a", 5).await,
        Err(Error::ContainerNotFound(_))
    ));
}

// =============================================================================
// Duplicate hosts
// =============================================================================

fn raw_host(id: &str, ip: &str, last_seen_mins_ago: Option<i64>, created_mins_ago: i64) -> Host {
    let now = Utc::now();
    Host {
        id: id.to_string(),
        name: id.to_string(),
        ip: ip.to_string(),
        status: HostStatus::Online,
        last_seen: last_seen_mins_ago.map(|m| now - Duration::minutes(m)),
        tags: Vec::new(),
        resources: None,
        created_at: now - Duration::minutes(created_mins_ago),
        updated_at: now - Duration::minutes(created_mins_ago),
    }
}

fn raw_container(id: &str, host_id: &str) -> ManagedContainer {
    let now = Utc::now();
    ManagedContainer {
        id: id.to_string(),
        name: id.to_string(),
        image: "redis:7".to_string(),
        host_id: host_id.to_string(),
        status: ContainerStatus::Running,
        ports: Vec::new(),
        volumes: Vec::new(),
        environment: Default::default(),
        labels: Default::default(),
        created_at: now,
        updated_at: now,
        started_at: None,
        stopped_at: None,
        exit_code: None,
    }
}

#[tokio::test]
async fn test_dedupe_keeps_most_recent_and_repoints_containers() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;
    let catalog = reconciler.catalog();

    catalog.insert_host(raw_host("stale", "10.0.0.7", Some(60), 120)).await.unwrap();
    catalog.insert_host(raw_host("fresh", "10.0.0.7", Some(1), 90)).await.unwrap();
    catalog.insert_host(raw_host("never", "10.0.0.7", None, 10)).await.unwrap();
    catalog.insert_host(raw_host("other", "10.0.0.8", None, 10)).await.unwrap();

    for (id, host) in [("c1", "stale"), ("c2", "never"), ("c3", "fresh")] {
        catalog
            .apply_container_changes(fleet_manager::state::ContainerChanges {
                host_id: host.to_string(),
                inserts: vec![raw_container(id, host)],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let report = reconciler.dedupe_hosts().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.removed, 2);

    let ids: Vec<String> = reconciler
        .list_hosts()
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"fresh".to_string()));
    assert!(ids.contains(&"other".to_string()));

    let containers = reconciler.list_containers(Some("fresh")).await.unwrap();
    assert_eq!(containers.len(), 3);

    // Nothing left to merge
    let again = reconciler.dedupe_hosts().await.unwrap();
    assert_eq!(again.removed, 0);
}

#[tokio::test]
async fn test_dedupe_never_seen_rows_keep_oldest() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;
    let catalog = reconciler.catalog();

    catalog.insert_host(raw_host("younger", "10.0.0.9", None, 5)).await.unwrap();
    catalog.insert_host(raw_host("older", "10.0.0.9", None, 50)).await.unwrap();

    reconciler.dedupe_hosts().await.unwrap();
    let hosts = reconciler.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, "older");
}

#[tokio::test]
async fn test_dedupe_latest_last_seen_wins_over_creation_order() {
    let runtime = FakeRuntime::new();
    let (_store, reconciler) = reconciler_with(runtime).await;
    let catalog = reconciler.catalog();

    // last_seen t1 < t2 < t3; the t3 row is the oldest by created_at
    catalog.insert_host(raw_host("h-t1", "10.0.0.20", Some(30), 10)).await.unwrap();
    catalog.insert_host(raw_host("h-t3", "10.0.0.20", Some(1), 300)).await.unwrap();
    catalog.insert_host(raw_host("h-t2", "10.0.0.20", Some(20), 100)).await.unwrap();

    for (id, host) in [("c-a", "h-t1"), ("c-b", "h-t1"), ("c-c", "h-t2"), ("c-d", "h-t3")] {
        catalog
            .apply_container_changes(fleet_manager::state::ContainerChanges {
                host_id: host.to_string(),
                inserts: vec![raw_container(id, host)],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let report = reconciler.dedupe_hosts().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.removed, 2);

    let hosts = reconciler.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, "h-t3");

    let containers = reconciler.list_containers(None).await.unwrap();
    assert_eq!(containers.len(), 4);
    assert!(containers.iter().all(|c| c.host_id == "h-t3"));
    assert!(reconciler.list_containers(Some("h-t1")).await.unwrap().is_empty());
    assert!(reconciler.list_containers(Some("h-t2")).await.unwrap().is_empty());
}
