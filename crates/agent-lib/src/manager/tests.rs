//! Reconciliation tests against the in-memory runtime and store

use super::*;
use crate::health::ComponentStatus;
use crate::runtime::{MockRuntime, MockWorkload};
use crate::store::MockStore;
use crate::util::WorkerPool;
use std::time::Instant;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        first: Duration::from_millis(1),
        max: Duration::from_millis(5),
        factor: 2.0,
    }
}

fn config() -> ManagerConfig {
    ManagerConfig {
        nodename: "node-1".to_string(),
        check_interval: Duration::from_secs(3600),
        check_timeout: Duration::from_secs(2),
        runtime_timeout: Duration::from_secs(1),
        store_timeout: Duration::from_secs(1),
        cache_ttl: Duration::ZERO,
        push_retry: fast_retry(3),
        health_retry: fast_retry(3),
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

fn setup_with(runtime: MockRuntime) -> (WorkloadManager, Arc<MockRuntime>, Arc<MockStore>) {
    let runtime = Arc::new(runtime);
    let store = Arc::new(MockStore::new("node-1"));
    let manager = WorkloadManager::new(config(), runtime.clone(), store.clone()).unwrap();
    (manager, runtime, store)
}

fn setup() -> (WorkloadManager, Arc<MockRuntime>, Arc<MockStore>) {
    setup_with(MockRuntime::with_fixtures("node-1"))
}

fn event(id: &str, action: &str) -> WorkloadEventMessage {
    WorkloadEventMessage {
        id: id.into(),
        r#type: "container".into(),
        action: action.into(),
        time_nano: 0,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn events_subscribed(manager: &WorkloadManager) -> bool {
    manager
        .health_registry()
        .health()
        .components
        .get(components::EVENT_MONITOR)
        .map(|c| c.status == ComponentStatus::Healthy)
        .unwrap_or(false)
}

fn spawn_run(manager: &WorkloadManager) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let token = CancellationToken::new();
    let handle = {
        let (manager, token) = (manager.clone(), token.clone());
        tokio::spawn(async move { manager.run(token).await })
    };
    (token, handle)
}

#[tokio::test]
async fn test_initial_load_isolates_failures() {
    let (manager, runtime, store) = setup();
    runtime.fail_status("Rei");

    manager.initial_load().await;

    assert!(store.writes_for("Rei").is_empty());
    let shinji = store.last_status("Shinji").unwrap();
    assert!(shinji.running && shinji.healthy);
    assert_eq!(shinji.appname, "nerv");
    let asuka = store.last_status("Asuka").unwrap();
    assert!(!asuka.running && !asuka.healthy);
    // Bootstrap never probes.
    assert_eq!(runtime.probe_count(), 0);
}

#[tokio::test]
async fn test_start_and_die_events_push_status() {
    let (manager, runtime, store) = setup();
    runtime.insert(MockWorkload::new("Kaworu", "nerv_kaworu_0003", false, true));
    let (token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);
    assert!(manager.health_registry().readiness().ready);

    runtime.start("Kaworu");
    assert!(wait_for(|| store.last_status("Kaworu").map(|s| s.running).unwrap_or(false)).await);
    assert!(store.last_status("Kaworu").unwrap().healthy);

    runtime.die("Kaworu");
    assert!(wait_for(|| store.last_status("Kaworu").map(|s| !s.running).unwrap_or(false)).await);
    assert!(!store.last_status("Kaworu").unwrap().healthy);

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_fixture_lifecycle_end_to_end() {
    let (manager, runtime, store) = setup();
    let (token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);

    let rei = store.last_status("Rei").unwrap();
    assert!(rei.running && !rei.healthy);
    let shinji = store.last_status("Shinji").unwrap();
    assert!(shinji.running && shinji.healthy);
    assert!(!store.last_status("Asuka").unwrap().running);

    // Asuka has no health check configured and stays unhealthy, so the
    // re-check reports her running three times before giving up.
    runtime.start("Asuka");
    assert!(wait_for(|| store.last_status("Asuka").map(|s| s.running).unwrap_or(false)).await);
    assert!(wait_for(|| store.writes_for("Asuka").len() == 4).await);

    runtime.die("Asuka");
    assert!(wait_for(|| store.last_status("Asuka").map(|s| !s.running).unwrap_or(false)).await);

    runtime.die("Rei");
    assert!(wait_for(|| store.last_status("Rei").map(|s| !s.running).unwrap_or(false)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let asuka = store.last_status("Asuka").unwrap();
    assert!(!asuka.running && !asuka.healthy);
    let rei = store.last_status("Rei").unwrap();
    assert!(!rei.running && !rei.healthy);
    assert_eq!(store.writes_for("Shinji").len(), 1);
    assert_eq!(store.last_status("Shinji").unwrap(), shinji);

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_start_immediately_followed_by_die() {
    let (manager, runtime, store) = setup();
    runtime.insert(MockWorkload::new("Kaworu", "nerv_kaworu_0003", false, true));
    let (token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);
    let before = store.writes_for("Kaworu").len();

    runtime.start("Kaworu");
    runtime.die("Kaworu");

    assert!(wait_for(|| store.writes_for("Kaworu").len() > before).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let writes = store.writes_for("Kaworu");
    assert!(writes.iter().all(|w| !w.status.running && !w.status.healthy));
    assert!(!store.last_status("Kaworu").unwrap().running);

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unknown_actions_are_ignored() {
    let (manager, runtime, store) = setup();
    let (token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);
    let before = store.writes().len();

    runtime.emit("Shinji", "pause");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.writes().len(), before);

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_unhealthy_start_gives_up_after_retries() {
    let (manager, runtime, store) = setup();
    let (token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);
    runtime.insert(MockWorkload::new("Toji", "nerv_toji_0004", false, false));

    runtime.start("Toji");
    // One probe from the start handler, three from the re-check.
    assert!(wait_for(|| runtime.probe_count() >= 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(runtime.probe_count(), 4);
    // Every re-check reports the running but unhealthy snapshot.
    let writes = store.writes_for("Toji");
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w.status.running && !w.status.healthy));

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_health_recheck_stops_once_healthy() {
    let runtime = Arc::new(MockRuntime::with_fixtures("node-1"));
    let store = Arc::new(MockStore::new("node-1"));
    let config = ManagerConfig {
        health_retry: RetryPolicy::fixed(10, Duration::from_millis(50)),
        ..config()
    };
    let manager = WorkloadManager::new(config, runtime.clone(), store.clone()).unwrap();
    runtime.insert(MockWorkload::new("Toji", "nerv_toji_0004", true, false));

    manager.spawn_check_until_healthy("Toji");
    assert!(wait_for(|| runtime.probe_count() >= 1).await);
    runtime.insert(MockWorkload::new("Toji", "nerv_toji_0004", true, true));

    assert!(wait_for(|| store.last_status("Toji").map(|s| s.healthy).unwrap_or(false)).await);
    let probes = runtime.probe_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runtime.probe_count(), probes);

    let writes = store.writes_for("Toji");
    assert_eq!(writes.len(), 2);
    assert!(writes[0].status.running && !writes[0].status.healthy);
    assert!(writes[1].status.healthy);
}

#[tokio::test]
async fn test_sweep_prunes_expired_cache_entries() {
    let runtime = Arc::new(MockRuntime::with_fixtures("node-1"));
    let store = Arc::new(MockStore::new("node-1"));
    let config = ManagerConfig {
        cache_ttl: Duration::from_millis(200),
        ..config()
    };
    let manager = WorkloadManager::new(config, runtime, store).unwrap();
    let departed = WorkloadStatus {
        id: "Gendo".into(),
        running: true,
        healthy: true,
        appname: "nerv".into(),
        ..Default::default()
    };
    manager.push_status(departed).await.unwrap();
    assert_eq!(manager.store().cached_entries(), 1);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let token = CancellationToken::new();
    let pool = WorkerPool::new(2, 8, token.clone(), &manager.inner.tracker);
    manager.sweep(&pool).await;

    assert_eq!(manager.store().prune_expired(), 0);
    token.cancel();
}

#[tokio::test]
async fn test_sweep_probes_running_workloads() {
    let (manager, runtime, store) = setup();
    let token = CancellationToken::new();
    let pool = WorkerPool::new(2, 8, token.clone(), &manager.inner.tracker);

    manager.sweep(&pool).await;

    assert!(wait_for(|| store.writes().len() == 3).await);
    // Asuka is stopped, so only Rei and Shinji are probed.
    assert_eq!(runtime.probe_count(), 2);
    assert!(!store.last_status("Rei").unwrap().healthy);
    assert!(store.last_status("Shinji").unwrap().healthy);
    token.cancel();
}

#[tokio::test]
async fn test_periodic_sweep_runs() {
    let runtime = Arc::new(MockRuntime::with_fixtures("node-1"));
    let store = Arc::new(MockStore::new("node-1"));
    let config = ManagerConfig {
        check_interval: Duration::from_millis(20),
        ..config()
    };
    let manager = WorkloadManager::new(config, runtime.clone(), store.clone()).unwrap();
    let (token, handle) = spawn_run(&manager);

    assert!(wait_for(|| runtime.probe_count() >= 4).await);
    assert!(store.writes_for("Shinji").len() >= 2);

    token.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_check_is_skipped() {
    let (manager, runtime, store) = setup();
    runtime.set_probe_delay(Duration::from_millis(200));

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.check_one("Shinji").await })
    };
    assert!(wait_for(|| runtime.probe_count() == 1).await);

    assert!(!manager.check_one("Shinji").await.unwrap());
    assert!(store.writes_for("Shinji").is_empty());

    assert!(first.await.unwrap().unwrap());
    assert_eq!(store.writes_for("Shinji").len(), 1);
    assert_eq!(runtime.probe_count(), 1);
}

#[tokio::test]
async fn test_die_during_probe_reports_without_waiting() {
    let (manager, runtime, store) = setup();
    runtime.set_probe_delay(Duration::from_millis(300));
    let probe = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.check_one("Shinji").await })
    };
    assert!(wait_for(|| runtime.probe_count() == 1).await);

    runtime.insert(MockWorkload::new("Shinji", "nerv_shinji_0001", false, false));
    let started = Instant::now();
    manager.handle_die(event("Shinji", actions::DIE)).await;

    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(!store.last_status("Shinji").unwrap().running);
    let _ = probe.await;
}

#[tokio::test]
async fn test_run_returns_event_stream_error() {
    let (manager, runtime, _store) = setup();
    let (_token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);

    runtime.fail_events(|| AgentError::Runtime("daemon went away".to_string()));

    let result = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(AgentError::Runtime(_))));
    assert!(!events_subscribed(&manager));
}

#[tokio::test]
async fn test_run_reports_closed_event_stream() {
    let (manager, runtime, _store) = setup();
    let (_token, handle) = spawn_run(&manager);
    assert!(wait_for(|| events_subscribed(&manager)).await);

    runtime.close_events();

    let result = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(AgentError::EventStreamClosed)));
}

#[tokio::test]
async fn test_push_retries_transient_failures() {
    let (manager, _runtime, store) = setup();
    let status = WorkloadStatus {
        id: "Rei".into(),
        running: true,
        healthy: true,
        appname: "nerv".into(),
        nodename: "node-1".into(),
        ..Default::default()
    };

    store.fail_next(2);
    manager.push_status(status.clone()).await.unwrap();
    assert_eq!(store.writes_for("Rei").len(), 1);

    store.fail_next(5);
    assert!(manager.push_status(status).await.is_err());
    let health = manager.health_registry().health();
    assert_eq!(health.components[components::STORE].status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn test_rejected_write_does_not_affect_others() {
    let (manager, _runtime, store) = setup();
    store.fail_workload("Rei");
    let status = |id: &str| WorkloadStatus {
        id: id.into(),
        running: true,
        healthy: true,
        appname: "nerv".into(),
        ..Default::default()
    };

    assert!(manager.push_status(status("Rei")).await.is_err());
    manager.push_status(status("Shinji")).await.unwrap();
    assert!(store.writes_for("Rei").is_empty());
    assert_eq!(store.writes_for("Shinji").len(), 1);
}

#[tokio::test]
async fn test_push_normalizes_stopped_workloads() {
    let (manager, _runtime, store) = setup();
    let status = WorkloadStatus {
        id: "Asuka".into(),
        running: false,
        healthy: true,
        appname: "nerv".into(),
        ..Default::default()
    };

    manager.push_status(status).await.unwrap();
    assert!(!store.last_status("Asuka").unwrap().healthy);
}

#[tokio::test]
async fn test_metrics_collection_is_deduplicated() {
    let (manager, runtime, _store) = setup();

    manager.spawn_metrics("Shinji");
    manager.spawn_metrics("Shinji");
    assert!(wait_for(|| runtime.metric_samples() >= 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(runtime.metric_samples(), 1);
    assert!(manager.inner.collecting.is_held("Shinji"));

    manager.inner.shutdown.cancel();
    assert!(wait_for(|| !manager.inner.collecting.is_held("Shinji")).await);
}

#[tokio::test]
async fn test_invalid_forward_address_is_config_error() {
    let runtime = Arc::new(MockRuntime::new("node-1"));
    let store = Arc::new(MockStore::new("node-1"));
    let config = ManagerConfig {
        log_forwards: "ftp://logs".to_string(),
        ..config()
    };

    let result = WorkloadManager::new(config, runtime, store);
    assert!(matches!(result, Err(AgentError::Config(_))));
}

#[test]
fn test_lifecycle_handlers_registered() {
    let (manager, _runtime, _store) = setup();
    assert_eq!(manager.handlers().actions(), vec![actions::DIE, actions::START]);
}
