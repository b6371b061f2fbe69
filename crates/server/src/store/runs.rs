//! Run and run-test store operations
//!
//! Status transitions are mediated here: `started_at` is stamped on the
//! first transition into `running`, `finished_at` on any terminal
//! transition. Run creation is a single transaction covering the run row
//! and all of its pending test rows.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension};
use serde_json::Value;
use testdeck_common::time::now_ms;
use testdeck_common::types::{
    Run, RunStatus, RunSummary, RunTest, RunTestStatus, TestArtifacts, TriggerType,
};
use testdeck_common::{Error, Result};
use uuid::Uuid;

use super::Store;

/// Payload for run creation
#[derive(Debug, Clone)]
pub struct NewRun {
    pub trigger_type: TriggerType,
    pub environment: String,
    pub schedule_id: Option<String>,
    pub triggered_by_email: Option<String>,
    pub run_overrides: Option<HashMap<String, Value>>,
    pub metadata: Option<Value>,
    /// `(test_id, test_key)` pairs; may be empty (audit-only run)
    pub tests: Vec<(String, String)>,
}

/// Filters and paging for run listing
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub environment: Option<String>,
    pub page: i64,
    pub page_size: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            environment: None,
            page: 1,
            page_size: 20,
        }
    }
}

/// One page of runs plus the unpaged total
#[derive(Debug, Clone)]
pub struct RunPage {
    pub runs: Vec<Run>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

const RUN_COLUMNS: &str = "id, status, trigger_type, environment, schedule_id, triggered_by_email, \
     run_overrides, metadata, summary, created_at, started_at, finished_at";

struct RawRun {
    id: String,
    status: String,
    trigger_type: String,
    environment: String,
    schedule_id: Option<String>,
    triggered_by_email: Option<String>,
    run_overrides: Option<String>,
    metadata: Option<String>,
    summary: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl RawRun {
    fn parse(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            status: self.status.parse()?,
            trigger_type: self.trigger_type.parse()?,
            environment: self.environment,
            schedule_id: self.schedule_id,
            triggered_by_email: self.triggered_by_email,
            run_overrides: self
                .run_overrides
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            metadata: self
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            summary: self
                .summary
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        status: row.get(1)?,
        trigger_type: row.get(2)?,
        environment: row.get(3)?,
        schedule_id: row.get(4)?,
        triggered_by_email: row.get(5)?,
        run_overrides: row.get(6)?,
        metadata: row.get(7)?,
        summary: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}

const RUN_TEST_COLUMNS: &str = "id, run_id, test_id, test_key, status, duration_ms, error_message, \
     artifacts, started_at, finished_at";

struct RawRunTest {
    id: String,
    run_id: String,
    test_id: String,
    test_key: String,
    status: String,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    artifacts: Option<String>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

impl RawRunTest {
    fn parse(self) -> Result<RunTest> {
        Ok(RunTest {
            id: self.id,
            run_id: self.run_id,
            test_id: self.test_id,
            test_key: self.test_key,
            status: self.status.parse()?,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            artifacts: self
                .artifacts
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn map_run_test_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRunTest> {
    Ok(RawRunTest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        test_id: row.get(2)?,
        test_key: row.get(3)?,
        status: row.get(4)?,
        duration_ms: row.get(5)?,
        error_message: row.get(6)?,
        artifacts: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

impl Store {
    /// Create a run and its pending test rows in one transaction
    pub fn create_run(&self, new_run: &NewRun) -> Result<Run> {
        let run_id = Uuid::new_v4().to_string();
        let now = now_ms();

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO runs
                 (id, status, trigger_type, environment, schedule_id, triggered_by_email,
                  run_overrides, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    RunStatus::Queued.as_str(),
                    new_run.trigger_type.as_str(),
                    new_run.environment,
                    new_run.schedule_id,
                    new_run.triggered_by_email,
                    new_run
                        .run_overrides
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    new_run
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    now,
                ],
            )?;

            for (test_id, test_key) in &new_run.tests {
                tx.execute(
                    "INSERT INTO run_tests (id, run_id, test_id, test_key, status)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        run_id,
                        test_id,
                        test_key,
                        RunTestStatus::Pending.as_str(),
                    ],
                )?;
            }

            tx.commit()?;
        }

        self.get_run(&run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                map_run_row,
            )
            .optional()?;
        raw.map(RawRun::parse).transpose()
    }

    /// Paged listing, newest first
    pub fn list_runs(&self, filter: &RunFilter) -> Result<RunPage> {
        let conn = self.conn.lock();

        let mut clauses: Vec<&str> = Vec::new();
        let mut bind: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            bind.push(status.as_str().to_string());
        }
        if let Some(environment) = &filter.environment {
            clauses.push("environment = ?");
            bind.push(environment.clone());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM runs {where_sql}"),
            params_from_iter(bind.iter()),
            |row| row.get(0),
        )?;

        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs {where_sql}
             ORDER BY created_at DESC LIMIT {page_size} OFFSET {offset}"
        ))?;
        let rows = stmt.query_map(params_from_iter(bind.iter()), map_run_row)?;
        let runs = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(RawRun::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(RunPage {
            runs,
            total,
            page,
            page_size,
        })
    }

    /// Mediated status transition.
    ///
    /// Stamps `started_at` the first time the run enters `running` and
    /// `finished_at` on any terminal transition.
    pub fn set_run_status(&self, id: &str, next: RunStatus) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET
                 status = ?1,
                 started_at = CASE
                     WHEN ?1 = 'running' AND started_at IS NULL THEN ?2
                     ELSE started_at
                 END,
                 finished_at = CASE
                     WHEN ?1 IN ('passed', 'failed', 'cancelled') THEN ?2
                     ELSE finished_at
                 END
             WHERE id = ?3",
            params![next.as_str(), now_ms(), id],
        )?;

        if changed == 0 {
            return Err(Error::not_found("run", id));
        }
        Ok(())
    }

    /// Atomically claim a queued run for execution, stamping `started_at`.
    ///
    /// Returns false when the run is no longer `queued` (already claimed by
    /// a previous dispatch of the same row, cancelled, or gone). This
    /// conditional update is what serializes duplicate queue dispatches.
    pub fn claim_run_for_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET status = 'running', started_at = COALESCE(started_at, ?1)
             WHERE id = ?2 AND status = 'queued'",
            params![now_ms(), id],
        )?;
        Ok(changed > 0)
    }

    /// Terminal transition that only applies while the run is still
    /// `running`. Returns false when something else (a cancel) got there
    /// first; the caller re-reads to learn the actual outcome.
    pub fn finish_run_if_running(&self, id: &str, next: RunStatus) -> Result<bool> {
        debug_assert!(next.is_terminal());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![next.as_str(), now_ms(), id],
        )?;
        Ok(changed > 0)
    }

    /// Conditional cancellation. Succeeds only from `queued` or `running`;
    /// a second call on a cancelled run is a no-op.
    pub fn cancel_run(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'running')",
            params![now_ms(), id],
        )?;
        if changed > 0 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;

        match current.as_deref() {
            None => Err(Error::not_found("run", id)),
            Some("cancelled") => Ok(()),
            Some(status) => Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: "cancelled".to_string(),
            }),
        }
    }

    pub fn set_run_summary(&self, id: &str, summary: &RunSummary) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE runs SET summary = ?1 WHERE id = ?2",
            params![serde_json::to_string(summary)?, id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("run", id));
        }
        Ok(())
    }

    pub fn count_runs_by_status(&self, status: RunStatus) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The single oldest queued run, if any (FIFO admission order)
    pub fn next_queued_run(&self) -> Result<Option<Run>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'queued'
                     ORDER BY created_at ASC LIMIT 1"
                ),
                [],
                map_run_row,
            )
            .optional()?;
        raw.map(RawRun::parse).transpose()
    }

    /// All test rows of a run, in execution order
    pub fn list_run_tests(&self, run_id: &str) -> Result<Vec<RunTest>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_TEST_COLUMNS} FROM run_tests WHERE run_id = ?1 ORDER BY test_key ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], map_run_test_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(RawRunTest::parse)
            .collect()
    }

    pub fn get_run_test(&self, run_id: &str, test_key: &str) -> Result<Option<RunTest>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RUN_TEST_COLUMNS} FROM run_tests
                     WHERE run_id = ?1 AND test_key = ?2"
                ),
                params![run_id, test_key],
                map_run_test_row,
            )
            .optional()?;
        raw.map(RawRunTest::parse).transpose()
    }

    /// Transition a test row to `running` and stamp `started_at`
    pub fn mark_test_running(&self, run_test_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE run_tests SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now_ms(), run_test_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("run test", run_test_id));
        }
        Ok(())
    }

    /// Record a test's terminal outcome
    pub fn complete_test(
        &self,
        run_test_id: &str,
        status: RunTestStatus,
        duration_ms: Option<i64>,
        error_message: Option<&str>,
        artifacts: Option<&TestArtifacts>,
    ) -> Result<()> {
        debug_assert!(status.is_complete());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE run_tests SET status = ?1, duration_ms = ?2, error_message = ?3,
                 artifacts = ?4, finished_at = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                duration_ms,
                error_message,
                artifacts.map(serde_json::to_string).transpose()?,
                now_ms(),
                run_test_id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("run test", run_test_id));
        }
        Ok(())
    }

    /// Bulk-promote a run's remaining pending tests to `skipped`.
    /// Returns the number of rows promoted.
    pub fn skip_pending_tests(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE run_tests SET status = 'skipped', finished_at = ?1
             WHERE run_id = ?2 AND status = 'pending'",
            params![now_ms(), run_id],
        )?;
        Ok(changed)
    }

    /// Startup recovery: fail every non-terminal run and its in-flight
    /// tests in one transaction. Returns `(runs, tests)` affected.
    pub fn fail_non_terminal_runs(&self, message: &str) -> Result<(usize, usize)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();

        let tests = tx.execute(
            "UPDATE run_tests SET status = 'failed', finished_at = ?1, error_message = ?2
             WHERE status IN ('pending', 'running')
               AND run_id IN (SELECT id FROM runs WHERE status IN ('queued', 'running'))",
            params![now, message],
        )?;

        let runs = tx.execute(
            "UPDATE runs SET status = 'failed', finished_at = ?1
             WHERE status IN ('queued', 'running')",
            params![now],
        )?;

        tx.commit()?;
        Ok((runs, tests))
    }

    /// IDs of runs created before `cutoff_ms` (retention candidates)
    pub fn run_ids_created_before(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM runs WHERE created_at < ?1")?;
        let rows = stmt.query_map(params![cutoff_ms], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Delete a run row (test rows cascade)
    pub fn delete_run(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn run_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
