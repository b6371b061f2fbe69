//! End-to-end run lifecycle tests
//!
//! Drives discovery, the queue, and the executor against a stub shell
//! driver, asserting the summary and status invariants the dashboard
//! relies on.

use std::path::Path;
use std::time::Duration;

use testdeck_common::types::{RunStatus, RunTestStatus};
use testdeck_common::Database;
use testdeck_server::config::{AppConfig, DriverConfig};
use testdeck_server::discovery;
use testdeck_server::executor::Executor;
use testdeck_server::queue::QueueWorker;
use testdeck_server::recovery;
use testdeck_server::store::{NewRun, Store};

fn write_test_folder(root: &Path, folder: &str, test_key: &str) {
    let dir = root.join(folder);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("meta.json"),
        format!(r#"{{"testKey": "{test_key}", "friendlyName": "{test_key}"}}"#),
    )
    .unwrap();
    std::fs::write(dir.join("main.spec.js"), "// spec").unwrap();
}

struct Harness {
    store: Store,
    executor: Executor,
    queue: QueueWorker,
    artifact_root: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness(driver_script: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let test_root = dir.path().join("tests");
    write_test_folder(&test_root, "auth/basic-login", "auth.basic-login");
    write_test_folder(&test_root, "auth/logout", "auth.logout");

    let db = Database::open_memory().unwrap();
    let store = Store::new(&db);
    discovery::discover_and_sync(&store, &test_root).unwrap();

    let config = AppConfig {
        test_root,
        artifact_root: dir.path().join("artifacts"),
        driver: DriverConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), driver_script.to_string()],
        },
        ..AppConfig::default()
    };

    let executor = Executor::new(store.clone(), &config);
    let queue = QueueWorker::new(store.clone(), executor.clone(), config.max_concurrent_runs);

    Harness {
        store,
        executor,
        queue,
        artifact_root: config.artifact_root.clone(),
        _dir: dir,
    }
}

fn create_run(store: &Store, keys: &[&str]) -> String {
    let mut tests = Vec::new();
    for key in keys {
        let def = store.get_test_by_key(key).unwrap().unwrap();
        tests.push((def.id, def.test_key));
    }
    store
        .create_run(&NewRun {
            trigger_type: testdeck_common::types::TriggerType::Manual,
            environment: "SIT1".to_string(),
            schedule_id: None,
            triggered_by_email: Some("qa@x".to_string()),
            run_overrides: None,
            metadata: None,
            tests,
        })
        .unwrap()
        .id
}

async fn wait_for_terminal(store: &Store, run_id: &str) -> RunStatus {
    for _ in 0..200 {
        let run = store.get_run(run_id).unwrap().unwrap();
        if run.status.is_terminal() {
            return run.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {run_id} did not reach a terminal state");
}

#[tokio::test]
async fn test_happy_manual_run_through_queue() {
    let hx = harness("echo running; exit 0");
    let run_id = create_run(&hx.store, &["auth.basic-login", "auth.logout"]);

    // The queue admits the oldest queued run and dispatches it
    let dispatched = hx.queue.tick().unwrap();
    assert_eq!(dispatched.as_deref(), Some(run_id.as_str()));

    let status = wait_for_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Passed);

    let run = hx.store.get_run(&run_id).unwrap().unwrap();
    let summary = run.summary.unwrap();
    assert_eq!(summary.total_tests, 2);
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert!(summary.duration_ms > 0);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());

    let tests = hx.store.list_run_tests(&run_id).unwrap();
    assert!(tests.iter().all(|t| t.status == RunTestStatus::Passed));

    // Console logs exist for every completed test
    for test in &tests {
        assert!(hx
            .artifact_root
            .join(&run_id)
            .join(&test.test_key)
            .join("console.log")
            .is_file());
    }
}

#[tokio::test]
async fn test_mid_run_cancel_skips_remaining() {
    // Driver sleeps long enough for the cancel to land mid-test
    let hx = harness("sleep 1; exit 0");
    let run_id = create_run(&hx.store, &["auth.basic-login", "auth.logout"]);

    let run_id_clone = run_id.clone();
    let executor = hx.executor.clone();
    let task = tokio::spawn(async move {
        executor.execute_run(&run_id_clone).await;
    });

    // Wait until the first test is actually running
    let mut saw_running = false;
    for _ in 0..100 {
        if let Some(test) = hx.store.get_run_test(&run_id, "auth.basic-login").unwrap() {
            if test.status == RunTestStatus::Running {
                saw_running = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_running);

    // Cancel as the HTTP layer does: flip the row, skip pending tests
    hx.store.cancel_run(&run_id).unwrap();
    hx.store.skip_pending_tests(&run_id).unwrap();

    task.await.unwrap();

    let run = hx.store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    let summary = run.summary.unwrap();
    assert_eq!(summary.total_tests, 2);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);

    // The in-flight test completed naturally; the pending one was skipped
    let tests = hx.store.list_run_tests(&run_id).unwrap();
    assert_eq!(tests[0].status, RunTestStatus::Passed);
    assert_eq!(tests[1].status, RunTestStatus::Skipped);
}

#[tokio::test]
async fn test_failed_test_fails_run_but_not_siblings() {
    // First spec fails, second passes ($0 is the spec path)
    let hx = harness(r#"case "$0" in *basic-login*) echo broken 1>&2; exit 2;; *) exit 0;; esac"#);
    let run_id = create_run(&hx.store, &["auth.basic-login", "auth.logout"]);

    hx.queue.tick().unwrap();
    let status = wait_for_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Failed);

    let tests = hx.store.list_run_tests(&run_id).unwrap();
    assert_eq!(tests[0].status, RunTestStatus::Failed);
    assert_eq!(tests[0].error_message.as_deref(), Some("broken"));
    assert_eq!(tests[1].status, RunTestStatus::Passed);

    let summary = hx.store.get_run(&run_id).unwrap().unwrap().summary.unwrap();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_recovery_then_queue_resumes_service() {
    let hx = harness("exit 0");

    // A run left mid-flight by a dead process
    let stuck = create_run(&hx.store, &["auth.basic-login"]);
    hx.store.set_run_status(&stuck, RunStatus::Running).unwrap();

    recovery::recover_interrupted_runs(&hx.store).unwrap();
    assert_eq!(
        hx.store.get_run(&stuck).unwrap().unwrap().status,
        RunStatus::Failed
    );

    // New work proceeds normally afterwards
    let fresh = create_run(&hx.store, &["auth.logout"]);
    hx.queue.tick().unwrap();
    let status = wait_for_terminal(&hx.store, &fresh).await;
    assert_eq!(status, RunStatus::Passed);
}
