//! Run lifecycle against the in-memory backend, pool and archive store.

mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::*;
use provision_backend::fakes::MemoryArchiveStore;
use provision_backend::{BackendError, BackendErrorKind, ExecOutput, PoolSettings};
use sbx_broker_core::{
    BrokerError, Category, DeployMode, JournalLevel, RunEvent, RunStatus, StreamItem,
};

// ===========================================================================
// Happy paths
// ===========================================================================

#[tokio::test]
async fn cold_clone_reaches_ready() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    assert_eq!(
        launched.stream_path,
        format!("/api/stream/{}", launched.run_id)
    );

    let events = until_finished(&mut launched.events).await;
    let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
    assert_eq!(kinds[0], "log");
    assert_eq!(kinds[1], "status");
    assert!(kinds.contains(&"ready"));

    let lines = messages(&events);
    assert_eq!(lines[0], "Creating cold sandbox...");
    assert!(position(&lines, "Sandbox ready in") < position(&lines, "Cloning from"));
    assert!(position(&lines, "Repository cloned") < position(&lines, "Dependencies installed"));
    assert!(lines.iter().any(|l| l == "App ID: cold-0001"));

    let info = h.broker.get(&launched.run_id).unwrap();
    assert_eq!(info.status, RunStatus::Ready);
    assert_eq!(
        info.ingress_url.as_deref(),
        Some(format!("/api/game/{}", launched.run_id).as_str())
    );
    assert!(info.acquire_ms.is_some() && info.deploy_ms.is_some() && info.total_ms.is_some());
    assert_eq!(info.app_id.as_deref(), Some("cold-0001"));

    let lifetime = info.expires_at.unwrap() - info.created_at;
    assert!(lifetime >= ChronoDuration::minutes(3) && lifetime <= ChronoDuration::minutes(6));

    let commands = h.backend.commands();
    assert!(commands[0].starts_with("git clone --depth 1 https://github.com/"));
    assert!(commands[0].ends_with("/workspace/source"));
    assert_eq!(commands[1], "mv /workspace/source/snake /workspace/snake");
    assert_eq!(commands[2], "cd /workspace/snake && pip install -r requirements.txt");

    let detached = h.backend.detached();
    assert_eq!(detached.len(), 1);
    assert!(detached[0].0.starts_with("cd /workspace/snake && "));
    assert!(detached[0].0.contains("port=5000"));
    assert_eq!(detached[0].1, "/workspace");
    assert_eq!(h.broker.metrics().runs_ready, 1);
}

#[tokio::test]
async fn archive_restore_skips_clone() {
    let store = MemoryArchiveStore::new().with_archive("tictactoe-python", 3 * 1024 * 1024);
    let h = harness(config(), Some(store));
    let mut launched = h
        .broker
        .launch(Category::Cold, "tic-tac-toe", DeployMode::Restore)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);

    assert!(lines.iter().any(|l| l == "Found archive tictactoe-python (3.0 MB)"));
    assert!(lines.iter().any(|l| l == "Archive restored"));
    let commands = h.backend.commands();
    assert_eq!(
        commands[0],
        "wget -q -O /tmp/snapshot.tar.gz https://archives.local/snapshots/tictactoe-python.tar.gz"
    );
    assert_eq!(commands[1], "cd /workspace && tar -xzf /tmp/snapshot.tar.gz");
    assert!(!commands.iter().any(|c| c.starts_with("git clone")));
    assert_eq!(
        h.broker.get(&launched.run_id).unwrap().status,
        RunStatus::Ready
    );
}

#[tokio::test]
async fn pool_hit_uses_warm_sandbox() {
    let h = harness(pooled_config(), None);
    assert!(h.broker.start_pool().await.unwrap());
    h.pool.set_ready("python", 2);

    let mut launched = h
        .broker
        .launch(Category::Warm, "memory", DeployMode::Clone)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);

    assert_eq!(lines[0], "Acquiring sandbox from warm pool...");
    assert!(lines.iter().any(|l| l == "App ID: warm-0001"));
    assert!(!lines.iter().any(|l| l.contains("Pool miss")));
    assert!(h.backend.live().is_empty());

    let status = h.broker.status();
    assert!(status.pool.enabled && status.pool.started);
    assert_eq!(status.pool.ready, 1);
    assert_eq!(status.pool.in_use, 1);
    assert!(h.broker.get(&launched.run_id).unwrap().pooled);
    assert_eq!(h.broker.metrics().pool_hits, 1);
}

#[tokio::test]
async fn cold_category_never_touches_pool() {
    let h = harness(pooled_config(), None);
    h.broker.start_pool().await.unwrap();
    h.pool.set_ready("python", 2);

    let mut launched = h
        .broker
        .launch(Category::Cold, "memory", DeployMode::Clone)
        .await
        .unwrap();
    until_settled(&mut launched.events).await;
    assert!(h.pool.acquired().is_empty());
}

// ===========================================================================
// Fallbacks
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn pool_error_falls_back_to_cold_create() {
    let h = harness(pooled_config(), None);
    h.broker.start_pool().await.unwrap();
    h.pool.fail_next_acquire(BackendError::pool_exhausted("python"));
    h.backend.set_create_delay(Duration::from_secs(2));

    let mut launched = h
        .broker
        .launch(Category::Warm, "snake", DeployMode::Clone)
        .await
        .unwrap();
    let events = until_finished(&mut launched.events).await;
    let lines = messages(&events);

    let miss = position(&lines, "Pool miss, falling back to cold start...");
    let ready = position(&lines, "Sandbox ready in");
    assert!(miss < ready);
    assert!(lines.iter().any(|l| l == "App ID: cold-0001"));

    let info = h.broker.get(&launched.run_id).unwrap();
    assert_eq!(info.status, RunStatus::Ready);
    assert!(info.acquire_ms.unwrap() >= 2000);
    assert!(!info.pooled);
    assert_eq!(h.broker.status().pool.in_use, 0);

    let metrics = h.broker.metrics();
    assert_eq!(metrics.pool_misses, 1);
    assert_eq!(metrics.pool_hits, 0);
    assert!(h
        .broker
        .journal(100)
        .iter()
        .any(|e| e.message.starts_with("Pool miss for run")));
}

#[tokio::test]
async fn missing_archive_falls_back_to_clone() {
    let h = harness(config(), Some(MemoryArchiveStore::new()));
    let mut launched = h
        .broker
        .launch(Category::Snapshot, "snake", DeployMode::Restore)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);

    assert!(position(&lines, "Archive snake-python not found") < position(&lines, "Cloning from"));
    assert!(lines.iter().any(|l| l == "Falling back to source clone..."));
    assert!(!h.backend.commands().iter().any(|c| c.starts_with("wget")));
    assert_eq!(
        h.broker.get(&launched.run_id).unwrap().status,
        RunStatus::Ready
    );
}

#[tokio::test]
async fn unconfigured_archive_store_falls_back_to_clone() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "memory", DeployMode::Restore)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);
    assert!(lines.iter().any(|l| l == "Archive storage not configured"));
    assert!(lines.iter().any(|l| l == "Repository cloned"));
}

#[tokio::test]
async fn failed_extract_falls_back_to_clone() {
    let store = MemoryArchiveStore::new().with_archive("memory-python", 1024);
    let h = harness(config(), Some(store));
    h.backend
        .on_exec("tar -xzf", ExecOutput::failed("gzip: stdin: not in gzip format"));

    let mut launched = h
        .broker
        .launch(Category::Cold, "memory", DeployMode::Restore)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);
    assert!(lines.iter().any(|l| l == "Extract failed: gzip: stdin: not in gzip format"));
    assert!(lines.iter().any(|l| l == "Repository cloned"));
}

#[tokio::test]
async fn install_failure_is_only_a_warning() {
    let h = harness(config(), None);
    h.backend.on_exec(
        "pip install",
        ExecOutput::failed("ERROR: No matching distribution found for flask"),
    );
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    let lines = messages(&until_finished(&mut launched.events).await);
    assert!(lines
        .iter()
        .any(|l| l == "Warning: ERROR: No matching distribution found for flask"));
    assert_eq!(
        h.broker.get(&launched.run_id).unwrap().status,
        RunStatus::Ready
    );
}

#[tokio::test(start_paused = true)]
async fn propagation_errors_are_retried() {
    let mut cfg = config();
    cfg.retry.delay_ms = 5_000;
    let h = harness(cfg, None);
    h.backend.fail_exec_transiently(2);

    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;

    let clones = h
        .backend
        .commands()
        .iter()
        .filter(|c| c.starts_with("git clone"))
        .count();
    assert_eq!(clones, 3);
    assert!(h.broker.get(&launched.run_id).unwrap().deploy_ms.unwrap() >= 10_000);
}

// ===========================================================================
// Failure path
// ===========================================================================

#[tokio::test]
async fn clone_failure_fails_and_deletes_run() {
    let h = harness(config(), None);
    h.backend
        .on_exec("git clone", ExecOutput::failed("fatal: repository not found"));

    let launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    let events = launched.events.collect_events().await;

    let n = events.len();
    assert!(matches!(
        &events[n - 3],
        RunEvent::Log { message, .. }
            if message == "ERROR: provisioning failed: git clone failed: fatal: repository not found"
    ));
    assert!(matches!(
        &events[n - 2],
        RunEvent::Status {
            status: RunStatus::Failed,
            ..
        }
    ));
    assert!(matches!(
        &events[n - 1],
        RunEvent::Complete { reason, .. } if reason == "provisioning failed"
    ));

    assert!(h.broker.get(&launched.run_id).is_none());
    let history = h.broker.deleted_history(5);
    assert_eq!(history[0].final_status, RunStatus::Failed);
    assert_eq!(h.broker.status().total_active, 0);
    assert!(h.backend.live().is_empty());
    assert_eq!(h.broker.metrics().runs_failed, 1);
}

#[tokio::test]
async fn create_failure_fails_run_without_sandbox() {
    let h = harness(config(), None);
    h.backend.fail_next_create(BackendError::new(
        BackendErrorKind::Timeout,
        "create",
        "sandbox not ready after 120s",
    ));
    let launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    let events = launched.events.collect_events().await;
    assert!(matches!(events.last(), Some(RunEvent::Complete { .. })));
    assert!(messages(&events)
        .iter()
        .any(|l| l.starts_with("ERROR: backend error:")));
    assert!(h.backend.deleted().is_empty());
}

// ===========================================================================
// Deletion
// ===========================================================================

#[tokio::test]
async fn delete_twice_succeeds_once() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;

    let (first, second) = tokio::join!(
        h.broker.delete(&launched.run_id),
        h.broker.delete(&launched.run_id)
    );
    assert!(first ^ second);
    assert!(!h.broker.delete(&launched.run_id).await);

    assert_eq!(h.broker.deleted_history(10).len(), 1);
    assert_eq!(h.backend.deleted(), vec!["cold-0001".to_string()]);

    let rest = launched.events.collect_events().await;
    assert!(matches!(
        rest.last(),
        Some(RunEvent::Complete { reason, .. }) if reason == "user request"
    ));
}

#[tokio::test(start_paused = true)]
async fn delete_while_provisioning_releases_late_sandbox() {
    let h = harness(config(), None);
    h.backend.set_create_delay(Duration::from_secs(30));
    let launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();

    tokio::task::yield_now().await;
    assert!(h.broker.delete(&launched.run_id).await);
    assert_eq!(h.broker.status().total_active, 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let backend = h.backend.clone();
    eventually(move || backend.deleted() == vec!["cold-0001".to_string()]).await;
    assert!(h.backend.live().is_empty());
    assert!(h.backend.commands().is_empty());

    let events = launched.events.collect_events().await;
    assert!(matches!(events.last(), Some(RunEvent::Complete { .. })));
}

#[tokio::test(start_paused = true)]
async fn delete_during_exec_retries_is_not_a_failure() {
    let mut cfg = config();
    cfg.retry.delay_ms = 5_000;
    let h = harness(cfg, None);
    h.backend.fail_exec_transiently(5);

    let launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    let backend = h.backend.clone();
    eventually(move || !backend.commands().is_empty()).await;

    assert!(h.broker.delete(&launched.run_id).await);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let metrics = h.broker.metrics();
    assert_eq!(metrics.runs_failed, 0);
    assert_eq!(metrics.runs_deleted, 1);
    assert!(!h
        .broker
        .journal(100)
        .iter()
        .any(|e| e.level == JournalLevel::Error));

    let history = h.broker.deleted_history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, "user request");
    assert_eq!(history[0].final_status, RunStatus::Provisioning);
    assert_eq!(h.backend.deleted(), vec!["cold-0001".to_string()]);

    let events = launched.events.collect_events().await;
    assert!(!messages(&events).iter().any(|l| l.starts_with("ERROR:")));
}

#[tokio::test]
async fn backend_delete_error_is_swallowed() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;
    h.backend
        .fail_next_delete(BackendError::connectivity("delete", "connection refused"));

    assert!(h.broker.delete(&launched.run_id).await);
    assert!(h.broker.get(&launched.run_id).is_none());
    assert!(h
        .broker
        .journal(100)
        .iter()
        .any(|e| e.message.starts_with("Failed to delete sandbox cold-0001")));
}

// ===========================================================================
// Streams
// ===========================================================================

#[tokio::test]
async fn late_subscriber_gets_history_then_ready() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "memory", DeployMode::Clone)
        .await
        .unwrap();
    let live = until_finished(&mut launched.events).await;
    let live_lines = messages(&live);

    let mut late = h.broker.stream(&launched.run_id).unwrap();
    let replay = read_until(&mut late, |e| matches!(e, RunEvent::Ready { .. })).await;
    let (ready, logs) = replay.split_last().unwrap();

    assert_eq!(messages(logs), live_lines);
    match ready {
        RunEvent::Ready {
            ingress_url,
            total_ms,
            ..
        } => {
            let info = h.broker.get(&launched.run_id).unwrap();
            assert_eq!(Some(ingress_url.clone()), info.ingress_url);
            assert_eq!(Some(*total_ms), info.total_ms);
        }
        other => panic!("expected ready, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn idle_stream_sends_keepalive() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;
    assert_eq!(launched.events.next().await, Some(StreamItem::Keepalive));
}

#[tokio::test]
async fn stream_of_unknown_run_is_not_found() {
    let h = harness(config(), None);
    let run_id = sbx_broker_core::RunId::new();
    let err = h.broker.stream(&run_id).unwrap_err();
    assert!(matches!(err, BrokerError::RunNotFound(id) if id == run_id));
    assert!(!err.is_retryable());
}

// ===========================================================================
// Expiry
// ===========================================================================

#[tokio::test]
async fn sweep_deletes_only_expired_runs() {
    let h = harness(config(), None);
    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;

    assert_eq!(h.broker.sweep_now().await, 0);
    h.clock.advance(ChronoDuration::minutes(6));
    assert_eq!(h.broker.sweep_now().await, 1);

    let history = h.broker.deleted_history(1);
    assert_eq!(history[0].reason, "expired (auto-cleanup after 3-6 min)");
    assert_eq!(history[0].final_status, RunStatus::Ready);
    assert_eq!(h.broker.metrics().runs_expired, 1);
    assert_eq!(h.backend.deleted(), vec!["cold-0001".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn sweep_never_touches_provisioning_runs() {
    let h = harness(config(), None);
    h.backend.set_create_delay(Duration::from_secs(3600));
    let launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::days(1));
    assert_eq!(h.broker.sweep_now().await, 0);
    assert_eq!(
        h.broker.get(&launched.run_id).unwrap().status,
        RunStatus::Provisioning
    );
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_reaps_and_stops_on_shutdown() {
    let h = harness(pooled_config(), None);
    h.broker.start().await.unwrap();
    assert!(h.pool.is_started());

    let mut launched = h
        .broker
        .launch(Category::Cold, "snake", DeployMode::Clone)
        .await
        .unwrap();
    until_finished(&mut launched.events).await;

    h.clock.advance(ChronoDuration::minutes(7));
    tokio::time::sleep(Duration::from_secs(31)).await;
    let broker = h.broker.clone();
    let id = launched.run_id;
    eventually(move || broker.get(&id).is_none()).await;

    h.broker.shutdown().await;
    assert!(h.pool.is_shut_down());
    assert!(!h.broker.status().pool.started);
}

// ===========================================================================
// Pool lifecycle and shutdown
// ===========================================================================

#[tokio::test]
async fn warm_up_runs_in_background_when_enabled() {
    let mut cfg = config();
    cfg.pool = Some(PoolSettings {
        warm_up_at_start: true,
        ..PoolSettings::default()
    });
    let h = harness(cfg, None);
    assert!(h.broker.start_pool().await.unwrap());
    assert!(h.broker.start_pool().await.unwrap());

    let pool = h.pool.clone();
    eventually(move || pool.was_warmed()).await;
    assert_eq!(h.broker.status().pool.ready, 2);
}

#[tokio::test]
async fn start_pool_without_pool_is_noop() {
    let h = harness(config(), None);
    assert!(!h.broker.start_pool().await.unwrap());
    assert!(!h.broker.status().pool.enabled);
}

#[tokio::test]
async fn shutdown_drains_live_runs() {
    let h = harness(config(), None);
    for workload in ["snake", "memory"] {
        let mut launched = h
            .broker
            .launch(Category::Cold, workload, DeployMode::Clone)
            .await
            .unwrap();
        until_finished(&mut launched.events).await;
    }
    assert_eq!(h.broker.active_runs().len(), 2);

    h.broker.shutdown().await;
    assert!(h.broker.active_runs().is_empty());
    assert!(h
        .broker
        .deleted_history(10)
        .iter()
        .all(|s| s.reason == "shutdown"));
    assert!(h.backend.live().is_empty());
}
