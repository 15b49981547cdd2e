//! End-to-end coverage against a real child process: the `echo_worker` fixture
//! binary, speaking the control-channel protocol over its own stdio.

use std::time::Duration;

use tempfile::tempdir;
use worker_ipc::process::{ManagerEvent, RestartPolicy, SpawnOptions};
use worker_ipc::{ProcessManager, WorkerId};

fn worker_manager() -> (std::sync::Arc<ProcessManager>, tempfile::TempDir) {
    let dir = tempdir().expect("tempdir");
    let manager = std::sync::Arc::new(ProcessManager::new("WORKERTEST", dir.path()));
    (manager, dir)
}

fn echo_worker_path() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_echo_worker"))
}

#[tokio::test]
async fn spawn_handshakes_and_answers_a_request() {
    let (manager, _dir) = worker_manager();
    let id = WorkerId::new("w1").unwrap();
    let opts = SpawnOptions::new(echo_worker_path());

    let handle = manager.spawn(id.clone(), opts).await.expect("spawn");
    assert!(manager.is_running(&id).await);

    let result = handle
        .request("echo", Some(serde_json::json!({"n": 42})), Some(Duration::from_secs(2)))
        .await
        .expect("echo request");
    assert_eq!(result, serde_json::json!({"n": 42}));

    manager.terminate(&id).await.expect("terminate");
    assert!(!manager.is_running(&id).await);
}

#[tokio::test]
async fn manual_terminate_suppresses_restart() {
    let (manager, _dir) = worker_manager();
    let id = WorkerId::new("w2").unwrap();
    let opts = SpawnOptions::new(echo_worker_path());

    manager.spawn(id.clone(), opts).await.expect("spawn");
    let mut events = manager.events();

    manager.terminate(&id).await.expect("terminate");

    let mut saw_exit_without_restart = false;
    while let Ok(event) = tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
        match event {
            Ok(ManagerEvent::Exit { id: eid, .. }) if eid == id => {
                saw_exit_without_restart = true;
            }
            Ok(ManagerEvent::Restart { id: eid, .. }) if eid == id => {
                panic!("manual terminate must not trigger a restart");
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(saw_exit_without_restart, "expected an Exit event for the terminated worker");
}

#[tokio::test]
async fn crash_triggers_restart_with_backoff() {
    let (manager, _dir) = worker_manager();
    let id = WorkerId::new("w3").unwrap();
    let opts = SpawnOptions::new(echo_worker_path())
        .env("ECHO_WORKER_CRASH_AFTER_MS", "50")
        .with_restart_policy(RestartPolicy {
            enabled: true,
            max_restarts: 2,
            backoff_ms: 20,
            max_backoff_ms: 200,
            window_ms: 60_000,
        });

    manager.spawn(id.clone(), opts).await.expect("spawn");
    let mut events = manager.events();

    let mut saw_restart = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(ManagerEvent::Restart { id: eid, .. })) if eid == id => {
                saw_restart = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_restart, "expected at least one restart after the worker crashed");

    manager.terminate(&id).await.expect("terminate");
}
