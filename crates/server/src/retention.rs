//! Artifact and run retention
//!
//! Hourly sweep (first pass 60 seconds after startup) that deletes runs
//! older than the retention window together with their artifact trees, then
//! reaps orphaned UUID-named directories that no longer have a run row.
//! Filesystem failures are logged and never block the database deletion.

use std::path::PathBuf;
use std::time::Duration;

use testdeck_common::time::now_ms;
use testdeck_common::{Database, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STARTUP_DELAY: Duration = Duration::from_secs(60);

/// Settings key recording the last completed sweep (epoch ms)
const LAST_SWEEP_KEY: &str = "retention.last_sweep_at";

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub runs_deleted: usize,
    pub orphans_removed: usize,
}

pub struct RetentionWorker {
    store: Store,
    db: Database,
    artifact_root: PathBuf,
    retention_days: i64,
}

impl RetentionWorker {
    pub fn new(store: Store, db: Database, artifact_root: PathBuf, retention_days: i64) -> Self {
        Self {
            store,
            db,
            artifact_root,
            retention_days,
        }
    }

    /// Run the sweep loop
    pub async fn run(self) {
        info!(
            "Retention worker started ({} day window)",
            self.retention_days
        );
        tokio::time::sleep(STARTUP_DELAY).await;

        loop {
            match self.sweep(now_ms()) {
                Ok(summary) if summary != RetentionSummary::default() => {
                    info!(
                        "Retention sweep: {} run(s) deleted, {} orphan dir(s) removed",
                        summary.runs_deleted, summary.orphans_removed
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Retention sweep error: {}", e),
            }
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
    }

    /// One sweep at `now_ms`
    pub fn sweep(&self, now_ms: i64) -> Result<RetentionSummary> {
        let cutoff = now_ms - self.retention_days * MS_PER_DAY;
        let mut summary = RetentionSummary::default();

        for run_id in self.store.run_ids_created_before(cutoff)? {
            let dir = self.artifact_root.join(&run_id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!("Failed to remove artifact dir {:?}: {}", dir, e);
                }
            }

            // Row deletion proceeds even when the tree was unremovable;
            // the orphan reaper gets another chance at it later.
            if self.store.delete_run(&run_id)? {
                summary.runs_deleted += 1;
            }
        }

        summary.orphans_removed = self.reap_orphans()?;

        self.db.setting_set(LAST_SWEEP_KEY, &now_ms.to_string())?;
        Ok(summary)
    }

    /// Remove UUID-named artifact directories whose run row is gone
    fn reap_orphans(&self) -> Result<usize> {
        if !self.artifact_root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.artifact_root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Unreadable artifact entry: {}", e);
                    continue;
                }
            };
            if !entry.path().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if Uuid::parse_str(&name).is_err() {
                // Not one of ours; leave it alone
                continue;
            }
            if self.store.run_exists(&name)? {
                continue;
            }

            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!("Reaped orphan artifact dir {}", name);
                    removed += 1;
                }
                Err(e) => warn!("Failed to reap orphan dir {}: {}", name, e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::backdate_run;
    use crate::store::NewRun;
    use testdeck_common::types::TriggerType;

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (Store, Database, tempfile::TempDir) {
        let db = Database::open_memory().unwrap();
        let store = Store::new(&db);
        let dir = tempfile::tempdir().unwrap();
        (store, db, dir)
    }

    fn run_with_artifacts(store: &Store, artifact_root: &std::path::Path, created_at: i64) -> String {
        let run = store
            .create_run(&NewRun {
                trigger_type: TriggerType::Manual,
                environment: "SIT1".to_string(),
                schedule_id: None,
                triggered_by_email: None,
                run_overrides: None,
                metadata: None,
                tests: vec![("t1".to_string(), "auth.login".to_string())],
            })
            .unwrap();
        backdate_run(store, &run.id, created_at);

        let test_dir = artifact_root.join(&run.id).join("auth.login");
        std::fs::create_dir_all(&test_dir).unwrap();
        std::fs::write(test_dir.join("console.log"), "log").unwrap();
        run.id
    }

    #[test]
    fn test_sweep_deletes_old_runs_and_trees() {
        let (store, db, dir) = setup();
        let worker = RetentionWorker::new(store.clone(), db, dir.path().to_path_buf(), 30);

        let old = run_with_artifacts(&store, dir.path(), NOW - 31 * MS_PER_DAY);
        let fresh = run_with_artifacts(&store, dir.path(), NOW - MS_PER_DAY);

        let summary = worker.sweep(NOW).unwrap();
        assert_eq!(summary.runs_deleted, 1);

        assert!(!store.run_exists(&old).unwrap());
        assert!(!dir.path().join(&old).exists());
        assert!(store.run_exists(&fresh).unwrap());
        assert!(dir.path().join(&fresh).exists());
    }

    #[test]
    fn test_run_test_rows_cascade_with_run() {
        let (store, db, dir) = setup();
        let worker = RetentionWorker::new(store.clone(), db, dir.path().to_path_buf(), 30);

        let old = run_with_artifacts(&store, dir.path(), NOW - 45 * MS_PER_DAY);
        assert_eq!(store.list_run_tests(&old).unwrap().len(), 1);

        worker.sweep(NOW).unwrap();
        assert!(store.list_run_tests(&old).unwrap().is_empty());
    }

    #[test]
    fn test_orphan_reaper_spares_known_and_foreign_dirs() {
        let (store, db, dir) = setup();
        let worker = RetentionWorker::new(store.clone(), db.clone(), dir.path().to_path_buf(), 30);

        let live = run_with_artifacts(&store, dir.path(), NOW);

        // Orphan: UUID-named dir with no run row
        let orphan = Uuid::new_v4().to_string();
        std::fs::create_dir_all(dir.path().join(&orphan)).unwrap();

        // Foreign: non-UUID dir must never be touched
        std::fs::create_dir_all(dir.path().join("lost+found")).unwrap();

        let summary = worker.sweep(NOW).unwrap();
        assert_eq!(summary.orphans_removed, 1);
        assert!(!dir.path().join(&orphan).exists());
        assert!(dir.path().join(&live).exists());
        assert!(dir.path().join("lost+found").exists());

        // Sweep bookkeeping landed in settings
        assert_eq!(
            db.setting_get("retention.last_sweep_at").unwrap().as_deref(),
            Some(NOW.to_string().as_str())
        );
    }

    #[test]
    fn test_missing_artifact_root_is_fine() {
        let (store, db, dir) = setup();
        let worker = RetentionWorker::new(
            store,
            db,
            dir.path().join("never-created"),
            30,
        );
        assert_eq!(worker.sweep(NOW).unwrap(), RetentionSummary::default());
    }
}
