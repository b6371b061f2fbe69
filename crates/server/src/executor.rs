//! Run executor
//!
//! Drives one run end to end: tests strictly one at a time, the external
//! browser-test driver as a child process per test, stdout/stderr teed into
//! the test's `console.log`, and the produced video normalized into the
//! test's artifact directory. The child is never signaled; cancellation is
//! observed between tests only.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::{Map, Value};
use testdeck_common::time::{now_ms, to_rfc3339};
use testdeck_common::types::{
    RunStatus, RunSummary, RunTestStatus, TestArtifacts, TestDefinition,
};
use testdeck_common::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::{AppConfig, DriverConfig};
use crate::store::Store;

/// Name of the environment variable carrying the effective config JSON
pub const DRIVER_CONFIG_ENV: &str = "TESTDECK_TEST_CONFIG";

/// Cap on the stdio tail retained for error messages
const MAX_TAIL_BYTES: usize = 2000;

/// Executes runs sequentially, one test at a time
#[derive(Clone)]
pub struct Executor {
    store: Store,
    artifact_root: PathBuf,
    deploy_root: PathBuf,
    driver: DriverConfig,
}

struct DriverOutcome {
    passed: bool,
    error: Option<String>,
}

impl Executor {
    pub fn new(store: Store, config: &AppConfig) -> Self {
        Self {
            store,
            artifact_root: config.artifact_root.clone(),
            deploy_root: config.test_root.clone(),
            driver: config.driver.clone(),
        }
    }

    /// Execute a dispatched run to a terminal state.
    ///
    /// Never panics out of the queue's fire-and-forget task: any uncaught
    /// error marks the run failed.
    pub async fn execute_run(&self, run_id: &str) {
        match self.run_inner(run_id).await {
            Ok(status) => info!("Run {} finished: {}", run_id, status),
            Err(e) => {
                error!("Run {} aborted: {}", run_id, e);
                if let Err(e) = self.store.set_run_status(run_id, RunStatus::Failed) {
                    error!("Failed to mark run {} failed: {}", run_id, e);
                }
            }
        }
    }

    async fn run_inner(&self, run_id: &str) -> Result<RunStatus> {
        // The queue can observe the same queued row on consecutive ticks;
        // this conditional claim is the serialization point.
        if !self.store.claim_run_for_execution(run_id)? {
            let status = self
                .store
                .get_run(run_id)?
                .map(|r| r.status)
                .unwrap_or(RunStatus::Failed);
            warn!("Run {} is {} at dispatch; not executing", run_id, status);
            return Ok(status);
        }
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| testdeck_common::Error::not_found("run", run_id))?;
        let run_started = now_ms();

        let run_dir = self.artifact_root.join(run_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let tests = self.store.list_run_tests(run_id)?;
        info!(
            "Run {} started on {}: {} test(s)",
            run_id,
            run.environment,
            tests.len()
        );

        let mut cancelled = false;

        for test in &tests {
            // Between-test cancellation point
            if let Some(current) = self.store.get_run(run_id)? {
                if current.status == RunStatus::Cancelled {
                    info!("Run {} cancelled; skipping remaining tests", run_id);
                    self.store.skip_pending_tests(run_id)?;
                    cancelled = true;
                    break;
                }
            }

            let definition = match self.store.get_test_by_key(&test.test_key)? {
                Some(def) if def.active => def,
                _ => {
                    warn!("Test definition {} not found; skipping", test.test_key);
                    self.store.complete_test(
                        &test.id,
                        RunTestStatus::Skipped,
                        None,
                        Some("Test definition not found"),
                        None,
                    )?;
                    continue;
                }
            };

            let test_dir = run_dir.join(&test.test_key);
            tokio::fs::create_dir_all(&test_dir).await?;

            let log_path = test_dir.join("console.log");
            let header = format!(
                "[{}] {} on {}\n",
                to_rfc3339(now_ms()),
                test.test_key,
                run.environment
            );
            tokio::fs::write(&log_path, header).await?;

            self.store.mark_test_running(&test.id)?;
            let test_started = now_ms();

            let effective =
                effective_config(&run.environment, &definition, run.run_overrides.as_ref());

            let outcome = self
                .run_driver(&definition, &test_dir, &log_path, &effective)
                .await;
            let duration_ms = now_ms() - test_started;

            let video = locate_video(&test_dir);
            let artifacts = TestArtifacts {
                console_log: Some("console.log".to_string()),
                video,
                trace: None,
            };

            let (status, message) = if outcome.passed {
                (RunTestStatus::Passed, None)
            } else {
                (RunTestStatus::Failed, outcome.error)
            };
            self.store.complete_test(
                &test.id,
                status,
                Some(duration_ms),
                message.as_deref(),
                Some(&artifacts),
            )?;

            // The live preview frame is only meaningful while the test runs
            let _ = tokio::fs::remove_file(test_dir.join("live.jpg")).await;

            info!(
                "Run {} test {}: {} ({} ms)",
                run_id, test.test_key, status, duration_ms
            );
        }

        // Tally outcomes from the rows themselves: cancellation can skip
        // tests outside this loop (e.g. the cancel endpoint).
        let rows = self.store.list_run_tests(run_id)?;
        let count = |status: RunTestStatus| rows.iter().filter(|t| t.status == status).count() as i64;
        let failed = count(RunTestStatus::Failed);
        let summary = RunSummary {
            total_tests: rows.len() as i64,
            passed: count(RunTestStatus::Passed),
            failed,
            skipped: count(RunTestStatus::Skipped),
            duration_ms: now_ms() - run_started,
        };
        self.store.set_run_summary(run_id, &summary)?;

        let final_status = if cancelled {
            // The cancel endpoint already moved the row; leave it be.
            RunStatus::Cancelled
        } else {
            // All passed, possibly with skips; zero tests also passes.
            let desired = if failed > 0 {
                RunStatus::Failed
            } else {
                RunStatus::Passed
            };
            if self.store.finish_run_if_running(run_id, desired)? {
                desired
            } else {
                // A cancel won the race after the last test completed
                self.store
                    .get_run(run_id)?
                    .map(|r| r.status)
                    .unwrap_or(desired)
            }
        };

        Ok(final_status)
    }

    /// Spawn the driver for one spec and tee its stdio into the console log
    async fn run_driver(
        &self,
        definition: &TestDefinition,
        test_dir: &Path,
        log_path: &Path,
        effective: &Map<String, Value>,
    ) -> DriverOutcome {
        let config_json = match serde_json::to_string(effective) {
            Ok(json) => json,
            Err(e) => {
                return DriverOutcome {
                    passed: false,
                    error: Some(format!("Failed to serialize test config: {e}")),
                }
            }
        };

        let mut cmd = Command::new(&self.driver.program);
        cmd.args(&self.driver.args)
            .arg(&definition.spec_path)
            .arg("--output")
            .arg(test_dir)
            .current_dir(&self.deploy_root)
            .env(DRIVER_CONFIG_ENV, config_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return DriverOutcome {
                    passed: false,
                    error: Some(format!(
                        "Failed to spawn driver {}: {}",
                        self.driver.program, e
                    )),
                }
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(tee_stream(out, log_path.to_path_buf())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(tee_stream(err, log_path.to_path_buf())));

        let status = child.wait().await;

        let stdout_tail = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) if status.success() => DriverOutcome {
                passed: true,
                error: None,
            },
            Ok(status) => {
                let tail = if !stderr_tail.trim().is_empty() {
                    stderr_tail.trim().to_string()
                } else if !stdout_tail.trim().is_empty() {
                    stdout_tail.trim().to_string()
                } else {
                    format!("Driver exited with {status}")
                };
                DriverOutcome {
                    passed: false,
                    error: Some(tail),
                }
            }
            Err(e) => DriverOutcome {
                passed: false,
                error: Some(format!("Failed to wait for driver: {e}")),
            },
        }
    }
}

/// Append one stdio stream to the console log line by line, keeping a
/// bounded tail for error reporting. Each write is an append; the log is
/// never truncated after creation.
async fn tee_stream<R: AsyncRead + Unpin>(reader: R, log_path: PathBuf) -> String {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .await
        .ok();

    let mut tail = String::new();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(file) = file.as_mut() {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        tail.push_str(&line);
        tail.push('\n');
        trim_to_tail(&mut tail, MAX_TAIL_BYTES);
    }

    if let Some(file) = file.as_mut() {
        let _ = file.flush().await;
    }
    tail
}

/// Keep at most `max` trailing bytes without splitting a UTF-8 character
fn trim_to_tail(buf: &mut String, max: usize) {
    if buf.len() <= max {
        return;
    }
    let mut cut = buf.len() - max;
    while cut < buf.len() && !buf.is_char_boundary(cut) {
        cut += 1;
    }
    buf.drain(..cut);
}

/// The ordered top-level merge producing the driver's configuration.
/// Later sources fully replace matching keys; there is no deep merge.
pub fn effective_config(
    env_code: &str,
    definition: &TestDefinition,
    run_overrides: Option<&std::collections::HashMap<String, Value>>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    merged.insert("envCode".to_string(), Value::String(env_code.to_string()));

    for (k, v) in &definition.constants.shared {
        merged.insert(k.clone(), v.clone());
    }
    if let Some(env) = definition.constants.environments.get(env_code) {
        for (k, v) in env {
            merged.insert(k.clone(), v.clone());
        }
    }
    if let Some(overrides) = &definition.overrides {
        for (k, v) in &overrides.shared {
            merged.insert(k.clone(), v.clone());
        }
        if let Some(env) = overrides.environments.get(env_code) {
            for (k, v) in env {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    if let Some(run_overrides) = run_overrides {
        for (k, v) in run_overrides {
            merged.insert(k.clone(), v.clone());
        }
    }

    merged
}

/// Find the driver-produced video under the test directory; normalize it to
/// the directory root as `video.webm` when it was written deeper down.
/// Returns the recorded artifact filename.
fn locate_video(test_dir: &Path) -> Option<String> {
    let found = WalkDir::new(test_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext == "webm" || ext == "mp4")
                    .unwrap_or(false)
        })?;

    let path = found.path();
    if path.parent() == Some(test_dir) {
        return path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
    }

    let target = test_dir.join("video.webm");
    match std::fs::rename(path, &target) {
        Ok(()) => Some("video.webm".to_string()),
        Err(e) => {
            warn!("Failed to move video {:?} to {:?}: {}", path, target, e);
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{memory_store, sample_definition};
    use crate::store::NewRun;
    use std::collections::HashMap;
    use testdeck_common::types::TriggerType;

    fn shell_driver(script: &str) -> DriverConfig {
        // The appended spec path and `--output <dir>` arrive as $0, $1, $2.
        DriverConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn executor_with(store: &Store, driver: DriverConfig) -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            artifact_root: dir.path().join("artifacts"),
            test_root: dir.path().to_path_buf(),
            driver,
            ..AppConfig::default()
        };
        (Executor::new(store.clone(), &config), dir)
    }

    fn seeded_run(store: &Store, keys: &[&str]) -> String {
        let mut tests = Vec::new();
        for key in keys {
            let def = store
                .upsert_test(&sample_definition(key, &format!("suite/{key}")))
                .unwrap();
            tests.push((def.id, def.test_key));
        }
        store
            .create_run(&NewRun {
                trigger_type: TriggerType::Manual,
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

    #[test]
    fn test_effective_config_precedence() {
        let mut def = sample_definition("auth.login", "auth/login");
        let base = |v: &str| Value::String(v.to_string());

        let mut constants = testdeck_common::types::ConfigSet::default();
        constants.shared.insert("a".to_string(), base("shared"));
        constants.shared.insert("b".to_string(), base("shared"));
        constants.shared.insert("c".to_string(), base("shared"));
        constants.environments.insert(
            "SIT1".to_string(),
            [
                ("b".to_string(), base("env")),
                ("c".to_string(), base("env")),
            ]
            .into_iter()
            .collect(),
        );
        let def = {
            let store = memory_store();
            def.constants = constants;
            store.upsert_test(&def).unwrap();

            let mut overrides = testdeck_common::types::ConfigSet::default();
            overrides.shared.insert("c".to_string(), base("override"));
            overrides.environments.insert(
                "SIT1".to_string(),
                [("d".to_string(), base("env-override"))].into_iter().collect(),
            );
            store
                .set_test_overrides("auth.login", Some(&overrides))
                .unwrap()
        };

        let mut run_overrides = HashMap::new();
        run_overrides.insert("d".to_string(), base("run"));
        run_overrides.insert("e".to_string(), base("run"));

        let merged = effective_config("SIT1", &def, Some(&run_overrides));
        assert_eq!(merged["envCode"], base("SIT1"));
        assert_eq!(merged["a"], base("shared"));
        assert_eq!(merged["b"], base("env"));
        assert_eq!(merged["c"], base("override"));
        assert_eq!(merged["d"], base("run"));
        assert_eq!(merged["e"], base("run"));

        // Other environments see neither SIT1 constants nor SIT1 overrides
        let merged = effective_config("SIT2", &def, None);
        assert_eq!(merged["b"], base("shared"));
        assert_eq!(merged["c"], base("override"));
        assert!(!merged.contains_key("d"));
    }

    #[test]
    fn test_trim_to_tail_respects_char_boundaries() {
        let mut buf = "héllo wörld".to_string();
        trim_to_tail(&mut buf, 5);
        assert!(buf.len() <= 5 + 2);
        assert!(buf.is_char_boundary(0));

        let mut short = "ok".to_string();
        trim_to_tail(&mut short, 100);
        assert_eq!(short, "ok");
    }

    #[test]
    fn test_locate_video_normalizes_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("chromium/session-1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("clip.webm"), b"x").unwrap();

        let name = locate_video(dir.path()).unwrap();
        assert_eq!(name, "video.webm");
        assert!(dir.path().join("video.webm").is_file());
        assert!(!nested.join("clip.webm").exists());
    }

    #[test]
    fn test_locate_video_keeps_root_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recording.mp4"), b"x").unwrap();
        assert_eq!(locate_video(dir.path()).unwrap(), "recording.mp4");

        let empty = tempfile::tempdir().unwrap();
        assert!(locate_video(empty.path()).is_none());
    }

    #[tokio::test]
    async fn test_passing_run() {
        let store = memory_store();
        let (executor, _dir) =
            executor_with(&store, shell_driver("echo driver-line-1; echo driver-line-2"));
        let run_id = seeded_run(&store, &["auth.login", "auth.logout"]);

        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());

        let summary = run.summary.unwrap();
        assert_eq!(summary.total_tests, 2);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 0);

        for test in store.list_run_tests(&run_id).unwrap() {
            assert_eq!(test.status, RunTestStatus::Passed);
            assert_eq!(
                test.artifacts.unwrap().console_log.as_deref(),
                Some("console.log")
            );
            let log = std::fs::read_to_string(
                executor
                    .artifact_root
                    .join(&run_id)
                    .join(&test.test_key)
                    .join("console.log"),
            )
            .unwrap();
            // Header plus teed driver output
            assert!(log.contains("SIT1"));
            assert!(log.contains("driver-line-1"));
            assert!(log.contains("driver-line-2"));
        }
    }

    #[tokio::test]
    async fn test_failing_test_records_stderr_tail() {
        let store = memory_store();
        let (executor, _dir) =
            executor_with(&store, shell_driver("echo some output; echo boom 1>&2; exit 3"));
        let run_id = seeded_run(&store, &["auth.login"]);

        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let summary = run.summary.unwrap();
        assert_eq!(summary.failed, 1);

        let test = &store.list_run_tests(&run_id).unwrap()[0];
        assert_eq!(test.status, RunTestStatus::Failed);
        assert_eq!(test.error_message.as_deref(), Some("boom"));
        assert!(test.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_spawn_error_fails_test_not_run_loop() {
        let store = memory_store();
        let (executor, _dir) = executor_with(
            &store,
            DriverConfig {
                program: "/nonexistent/driver-binary".to_string(),
                args: vec![],
            },
        );
        let run_id = seeded_run(&store, &["auth.login", "auth.logout"]);

        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let tests = store.list_run_tests(&run_id).unwrap();
        // Both tests were attempted; one failure never cascades
        assert!(tests.iter().all(|t| t.status == RunTestStatus::Failed));
        assert!(tests[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Failed to spawn driver"));
    }

    #[tokio::test]
    async fn test_missing_definition_is_skipped() {
        let store = memory_store();
        let (executor, _dir) = executor_with(&store, shell_driver("exit 0"));
        let run_id = seeded_run(&store, &["auth.login"]);

        // Definition disappears between run creation and execution
        let seen = std::collections::BTreeSet::new();
        store.deactivate_tests_not_in(&seen).unwrap();

        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        // No failures: skips alone still pass the run
        assert_eq!(run.status, RunStatus::Passed);
        let test = &store.list_run_tests(&run_id).unwrap()[0];
        assert_eq!(test.status, RunTestStatus::Skipped);
        assert_eq!(
            test.error_message.as_deref(),
            Some("Test definition not found")
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let store = memory_store();
        let (executor, _dir) = executor_with(&store, shell_driver("exit 0"));
        let run_id = seeded_run(&store, &["a.one", "b.two"]);

        store.cancel_run(&run_id).unwrap();
        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        // Dispatch refuses non-queued runs outright; rows stay untouched
        // until the cancel path or a later sweep skips them.
        let tests = store.list_run_tests(&run_id).unwrap();
        assert!(tests
            .iter()
            .all(|t| t.status == RunTestStatus::Pending || t.status == RunTestStatus::Skipped));
    }

    #[tokio::test]
    async fn test_empty_run_passes() {
        let store = memory_store();
        let (executor, _dir) = executor_with(&store, shell_driver("exit 0"));
        let run_id = store
            .create_run(&NewRun {
                trigger_type: TriggerType::Schedule,
                environment: "SIT1".to_string(),
                schedule_id: None,
                triggered_by_email: None,
                run_overrides: None,
                metadata: None,
                tests: vec![],
            })
            .unwrap()
            .id;

        executor.execute_run(&run_id).await;

        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        let summary = run.summary.unwrap();
        assert_eq!(summary.total_tests, 0);
        assert_eq!(summary.passed, 0);
    }

    #[tokio::test]
    async fn test_video_recorded_in_artifacts() {
        let store = memory_store();
        let (executor, _dir) = executor_with(
            &store,
            // $2 is the --output directory
            shell_driver("mkdir -p \"$2/chromium\"; echo x > \"$2/chromium/clip.webm\""),
        );
        let run_id = seeded_run(&store, &["auth.login"]);

        executor.execute_run(&run_id).await;

        let test = &store.list_run_tests(&run_id).unwrap()[0];
        assert_eq!(test.status, RunTestStatus::Passed);
        assert_eq!(test.artifacts.as_ref().unwrap().video.as_deref(), Some("video.webm"));
        assert!(executor
            .artifact_root
            .join(&run_id)
            .join("auth.login")
            .join("video.webm")
            .is_file());
    }

    #[tokio::test]
    async fn test_live_screenshot_removed_after_test() {
        let store = memory_store();
        let (executor, _dir) = executor_with(
            &store,
            shell_driver("echo frame > \"$2/live.jpg\""),
        );
        let run_id = seeded_run(&store, &["auth.login"]);

        executor.execute_run(&run_id).await;

        assert!(!executor
            .artifact_root
            .join(&run_id)
            .join("auth.login")
            .join("live.jpg")
            .exists());
    }
}
