//! Tests for the status cache, the mock store and the store factory

use super::*;
use crate::models::NodeStatus;

fn status(id: &str, running: bool) -> WorkloadStatus {
    WorkloadStatus {
        id: id.to_string(),
        running,
        healthy: running,
        appname: "nerv".to_string(),
        entrypoint: id.to_lowercase(),
        nodename: "node-1".to_string(),
        ..Default::default()
    }
}

fn cached(cache_ttl: Duration) -> (Arc<MockStore>, CachedStore) {
    let mock = Arc::new(MockStore::new("node-1"));
    let store = CachedStore::new(mock.clone(), cache_ttl);
    (mock, store)
}

#[tokio::test]
async fn test_identical_zero_ttl_push_is_suppressed() {
    let (mock, store) = cached(Duration::from_secs(300));
    let s = status("Rei", true);

    store.set_workload_status(&s, 0).await.unwrap();
    store.set_workload_status(&s, 0).await.unwrap();

    assert_eq!(mock.writes_for("Rei").len(), 1);
    assert_eq!(store.cached_entries(), 1);
}

#[tokio::test]
async fn test_changed_status_is_pushed() {
    let (mock, store) = cached(Duration::from_secs(300));

    store.set_workload_status(&status("Rei", true), 0).await.unwrap();
    store.set_workload_status(&status("Rei", false), 0).await.unwrap();

    let writes = mock.writes_for("Rei");
    assert_eq!(writes.len(), 2);
    assert!(!writes[1].status.running);
}

#[tokio::test]
async fn test_zero_cache_ttl_disables_suppression() {
    let (mock, store) = cached(Duration::ZERO);
    let s = status("Shinji", true);

    store.set_workload_status(&s, 0).await.unwrap();
    store.set_workload_status(&s, 0).await.unwrap();

    assert_eq!(mock.writes_for("Shinji").len(), 2);
    assert_eq!(store.cached_entries(), 0);
}

#[tokio::test]
async fn test_failed_write_is_not_cached() {
    let (mock, store) = cached(Duration::from_secs(300));
    let s = status("Asuka", false);

    mock.fail_next(1);
    assert!(store.set_workload_status(&s, 0).await.is_err());
    assert_eq!(store.cached_entries(), 0);

    store.set_workload_status(&s, 0).await.unwrap();
    assert_eq!(mock.writes_for("Asuka").len(), 1);
}

#[tokio::test]
async fn test_cache_entry_expires() {
    let (mock, store) = cached(Duration::from_millis(20));
    let s = status("Rei", true);

    store.set_workload_status(&s, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    store.set_workload_status(&s, 0).await.unwrap();

    assert_eq!(mock.writes_for("Rei").len(), 2);
}

#[tokio::test]
async fn test_expired_entries_of_departed_workloads_are_pruned() {
    let (_mock, store) = cached(Duration::from_millis(10));
    for i in 0..1000 {
        store
            .set_workload_status(&status(&format!("Lilin{}", i), true), 0)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_workload_status(&status("Rei", true), 0).await.unwrap();

    assert_eq!(store.prune_expired(), 1000);
    assert_eq!(store.cached_entries(), 1);
    assert_eq!(store.prune_expired(), 0);
}

#[tokio::test]
async fn test_ttl_push_bypasses_and_invalidates_cache() {
    let (mock, store) = cached(Duration::from_secs(300));
    let s = status("Rei", true);

    store.set_workload_status(&s, 0).await.unwrap();
    store.set_workload_status(&s, 30).await.unwrap();
    store.set_workload_status(&s, 0).await.unwrap();

    let ttls: Vec<i64> = mock.writes_for("Rei").iter().map(|w| w.ttl).collect();
    assert_eq!(ttls, vec![0, 30, 0]);
}

#[tokio::test]
async fn test_mock_store_rejects_failing_workload() {
    let mock = MockStore::new("node-1");
    mock.fail_workload("Rei");

    assert!(matches!(
        mock.set_workload_status(&status("Rei", true), 0).await,
        Err(AgentError::Store(_))
    ));
    mock.set_workload_status(&status("Shinji", true), 0).await.unwrap();
    assert_eq!(mock.writes().len(), 1);
    assert_eq!(mock.last_status("Shinji").unwrap().appname, "nerv");
}

#[tokio::test]
async fn test_mock_store_nodes() {
    let mock = MockStore::new("node-1");
    mock.add_node(Node {
        name: "node-2".into(),
        podname: "default".into(),
        available: false,
        ..Default::default()
    });

    assert_eq!(mock.get_node("node-1").await.unwrap().podname, "default");
    assert!(matches!(
        mock.get_node("node-9").await,
        Err(AgentError::NotFound(_))
    ));

    assert_eq!(mock.list_pod_nodes("default", false).await.unwrap().len(), 1);
    assert_eq!(mock.list_pod_nodes("default", true).await.unwrap().len(), 2);

    mock.set_node_status(-1).await.unwrap();
    assert!(!mock.get_node("node-1").await.unwrap().available);
    assert_eq!(mock.node_ttls(), vec![-1]);
}

#[tokio::test]
async fn test_mock_node_status_stream() {
    let mock = MockStore::new("node-1");
    let mut stream = mock.node_status_stream(CancellationToken::new()).await.unwrap();

    mock.publish_node_status(NodeStatus {
        nodename: "node-1".into(),
        podname: "default".into(),
        alive: false,
        error: None,
    });
    let status = stream.statuses.recv().await.unwrap();
    assert!(!status.alive);

    mock.fail_watchers(|| AgentError::Store("watch broken".into()));
    assert!(matches!(stream.errors.await.unwrap(), AgentError::Store(_)));
    assert!(stream.statuses.recv().await.is_none());
}

#[tokio::test]
async fn test_unavailable_store() {
    let mock = MockStore::new("node-1");
    mock.set_unavailable(true);
    let err = mock.set_node_status(30).await.unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn test_create_store_mock() {
    let config = StoreConfig {
        kind: StoreKind::Mock,
        nodename: "node-1".into(),
        ..Default::default()
    };
    assert_eq!(create_store(&config).unwrap().identifier(), "mock://node-1");
}

#[test]
fn test_create_store_grpc_requires_endpoint() {
    let config = StoreConfig {
        endpoints: vec![],
        ..Default::default()
    };
    assert!(matches!(create_store(&config), Err(AgentError::Config(_))));

    let config = StoreConfig {
        endpoints: vec!["core:5001".into()],
        username: Some("eru".into()),
        password: Some("secret".into()),
        ..Default::default()
    };
    assert_eq!(create_store(&config).unwrap().identifier(), "http://core:5001");
}
