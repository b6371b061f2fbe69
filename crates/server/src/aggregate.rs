//! Dashboard aggregation engine
//!
//! Read-only queries over runs and run tests. All rolling windows are
//! parameterized by `days` and an injected `now` so the math is
//! deterministic under test; trends compare the current window with the
//! immediately preceding window of the same width. Fractions are rounded
//! half-up to one decimal and empty divisors yield zero, never NaN.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use testdeck_common::time::rfc3339_ms_opt;
use testdeck_common::{Database, Result};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Read-side query engine over the shared connection
#[derive(Clone)]
pub struct Aggregator {
    conn: Arc<Mutex<Connection>>,
}

// ============================================================================
// Report types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRuns {
    pub running: i64,
    pub queued: i64,
    pub runs: Vec<ActiveRunProgress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunProgress {
    pub run_id: String,
    pub environment: String,

    #[serde(with = "rfc3339_ms_opt")]
    pub started_at: Option<i64>,

    pub completed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassRate {
    pub percentage: f64,
    pub passed: i64,
    pub failed: i64,
    /// Current-window percentage minus previous-window percentage
    pub trend: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Executions {
    pub total: i64,
    pub by_environment: Vec<EnvironmentCount>,
    pub trend: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentCount {
    pub environment: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCounts {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlakyTest {
    pub test_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    /// Failure rate over the window, as a percentage
    pub flakiness_score: f64,
    pub critical: bool,
    pub executions: ExecutionCounts,

    /// Last 10 pass/fail outcomes, most recent first
    pub recent_outcomes: Vec<String>,

    /// Environments with at least one failure in the window
    pub failing_environments: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<LastFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFailure {
    pub run_id: String,

    #[serde(with = "rfc3339_ms_opt")]
    pub finished_at: Option<i64>,

    pub environment: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentHealth {
    pub environment: String,
    pub total_runs: i64,
    pub passed_runs: i64,
    pub pass_rate: f64,
    pub avg_duration_ms: i64,
    pub runs_last_24h: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_run: Option<LatestRun>,

    pub health_status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRun {
    pub run_id: String,
    pub status: String,

    #[serde(with = "rfc3339_ms_opt")]
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Critical,
    Warning,
    Healthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStats {
    pub test_key: String,
    pub executions: ExecutionCounts,
    pub pass_rate: f64,
    pub avg_duration_ms: i64,
    pub per_environment: Vec<TestEnvironmentStats>,

    /// Last 10 completed executions, most recent first
    pub recent_runs: Vec<TestRunSnapshot>,

    pub trend: TrendDirection,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEnvironmentStats {
    pub environment: String,
    pub executions: ExecutionCounts,
    pub pass_rate: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<TestRunSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSnapshot {
    pub run_id: String,
    pub environment: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    #[serde(with = "rfc3339_ms_opt")]
    pub finished_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

// ============================================================================
// Arithmetic helpers
// ============================================================================

/// Round half-up to one decimal
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Percentage with a zero-safe divisor
fn pct(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round1(numerator as f64 / denominator as f64 * 100.0)
    }
}

impl Aggregator {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    // ========================================================================
    // Active runs
    // ========================================================================

    pub fn active_runs(&self) -> Result<ActiveRuns> {
        let conn = self.conn.lock();

        let queued: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT r.id, r.environment, r.started_at,
                    (SELECT COUNT(*) FROM run_tests rt
                     WHERE rt.run_id = r.id
                       AND rt.status IN ('passed', 'failed', 'skipped')),
                    (SELECT COUNT(*) FROM run_tests rt WHERE rt.run_id = r.id)
             FROM runs r WHERE r.status = 'running'
             ORDER BY r.started_at ASC",
        )?;
        let runs: Vec<ActiveRunProgress> = stmt
            .query_map([], |row| {
                Ok(ActiveRunProgress {
                    run_id: row.get(0)?,
                    environment: row.get(1)?,
                    started_at: row.get(2)?,
                    completed: row.get(3)?,
                    total: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(ActiveRuns {
            running: runs.len() as i64,
            queued,
            runs,
        })
    }

    // ========================================================================
    // Pass rate
    // ========================================================================

    pub fn pass_rate(&self, days: i64, now_ms: i64) -> Result<PassRate> {
        let cutoff = now_ms - days * MS_PER_DAY;
        let previous_cutoff = cutoff - days * MS_PER_DAY;

        let (passed, failed) = self.pass_fail_counts(None, cutoff, now_ms)?;
        let (prev_passed, prev_failed) =
            self.pass_fail_counts(None, previous_cutoff, cutoff)?;

        let percentage = pct(passed, passed + failed);
        let previous = pct(prev_passed, prev_passed + prev_failed);

        Ok(PassRate {
            percentage,
            passed,
            failed,
            trend: round1(percentage - previous),
        })
    }

    /// Pass/fail tallies over `run_tests` joined to the owning run's
    /// `finished_at`, within `[from, to)`, optionally for one test key.
    fn pass_fail_counts(
        &self,
        test_key: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<(i64, i64)> {
        let conn = self.conn.lock();

        let sql = "SELECT
                       SUM(CASE WHEN rt.status = 'passed' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN rt.status = 'failed' THEN 1 ELSE 0 END)
                   FROM run_tests rt
                   JOIN runs r ON r.id = rt.run_id
                   WHERE r.finished_at >= ?1 AND r.finished_at < ?2
                     AND rt.status IN ('passed', 'failed')
                     AND (?3 IS NULL OR rt.test_key = ?3)";

        let (passed, failed): (Option<i64>, Option<i64>) =
            conn.query_row(sql, params![from_ms, to_ms, test_key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        Ok((passed.unwrap_or(0), failed.unwrap_or(0)))
    }

    // ========================================================================
    // Total executions
    // ========================================================================

    pub fn total_executions(&self, days: i64, now_ms: i64) -> Result<Executions> {
        let cutoff = now_ms - days * MS_PER_DAY;
        let previous_cutoff = cutoff - days * MS_PER_DAY;

        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE created_at >= ?1 AND created_at < ?2",
            params![cutoff, now_ms],
            |row| row.get(0),
        )?;
        let previous: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE created_at >= ?1 AND created_at < ?2",
            params![previous_cutoff, cutoff],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT environment, COUNT(*) FROM runs
             WHERE created_at >= ?1 AND created_at < ?2
             GROUP BY environment ORDER BY environment",
        )?;
        let by_environment: Vec<EnvironmentCount> = stmt
            .query_map(params![cutoff, now_ms], |row| {
                Ok(EnvironmentCount {
                    environment: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(Executions {
            total,
            by_environment,
            trend: total - previous,
        })
    }

    // ========================================================================
    // Flakiness
    // ========================================================================

    /// Tests whose failure rate over the window sits in the inclusive
    /// 10-90% band with at least `min_executions` completed executions and
    /// both outcomes present. Sorted by score, worst first.
    pub fn flaky_tests(
        &self,
        days: i64,
        min_executions: i64,
        now_ms: i64,
    ) -> Result<Vec<FlakyTest>> {
        let cutoff = now_ms - days * MS_PER_DAY;

        let candidates: Vec<(String, Option<String>, i64, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT rt.test_key,
                        (SELECT td.meta FROM test_definitions td
                         WHERE td.test_key = rt.test_key),
                        SUM(CASE WHEN rt.status = 'passed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN rt.status = 'failed' THEN 1 ELSE 0 END)
                 FROM run_tests rt
                 JOIN runs r ON r.id = rt.run_id
                 WHERE r.finished_at >= ?1 AND r.finished_at < ?2
                   AND rt.status IN ('passed', 'failed')
                 GROUP BY rt.test_key",
            )?;
            let rows = stmt.query_map(params![cutoff, now_ms], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut flaky = Vec::new();
        for (test_key, meta, passed, failed) in candidates {
            let total = passed + failed;
            if total < min_executions || passed == 0 || failed == 0 {
                continue;
            }
            let failure_rate = failed as f64 / total as f64 * 100.0;
            if !(10.0..=90.0).contains(&failure_rate) {
                continue;
            }

            let score = round1(failure_rate);
            let friendly_name = meta
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|v| v["friendlyName"].as_str().map(String::from));

            flaky.push(FlakyTest {
                recent_outcomes: self.recent_outcomes(&test_key, cutoff, now_ms)?,
                failing_environments: self.failing_environments(&test_key, cutoff, now_ms)?,
                last_failure: self.last_failure(&test_key, cutoff, now_ms)?,
                test_key,
                friendly_name,
                flakiness_score: score,
                critical: score >= 30.0,
                executions: ExecutionCounts {
                    total,
                    passed,
                    failed,
                },
            });
        }

        flaky.sort_by(|a, b| {
            b.flakiness_score
                .partial_cmp(&a.flakiness_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(flaky)
    }

    fn recent_outcomes(&self, test_key: &str, from_ms: i64, to_ms: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rt.status FROM run_tests rt
             JOIN runs r ON r.id = rt.run_id
             WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
               AND rt.status IN ('passed', 'failed')
             ORDER BY rt.finished_at DESC LIMIT 10",
        )?;
        let outcomes = stmt
            .query_map(params![test_key, from_ms, to_ms], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(outcomes)
    }

    fn failing_environments(
        &self,
        test_key: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.environment FROM run_tests rt
             JOIN runs r ON r.id = rt.run_id
             WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
               AND rt.status = 'failed'
             ORDER BY r.environment",
        )?;
        let environments = stmt
            .query_map(params![test_key, from_ms, to_ms], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(environments)
    }

    fn last_failure(
        &self,
        test_key: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Option<LastFailure>> {
        let conn = self.conn.lock();
        let failure = conn
            .query_row(
                "SELECT rt.run_id, rt.finished_at, r.environment, rt.error_message
                 FROM run_tests rt
                 JOIN runs r ON r.id = rt.run_id
                 WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
                   AND rt.status = 'failed'
                 ORDER BY rt.finished_at DESC LIMIT 1",
                params![test_key, from_ms, to_ms],
                |row| {
                    Ok(LastFailure {
                        run_id: row.get(0)?,
                        finished_at: row.get(1)?,
                        environment: row.get(2)?,
                        error_message: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(failure)
    }

    // ========================================================================
    // Environment health
    // ========================================================================

    pub fn environment_health(&self, days: i64, now_ms: i64) -> Result<Vec<EnvironmentHealth>> {
        let cutoff = now_ms - days * MS_PER_DAY;
        let last_24h = now_ms - MS_PER_DAY;

        let rows: Vec<(String, i64, i64, Option<f64>, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT environment,
                        COUNT(*),
                        SUM(CASE WHEN status = 'passed' THEN 1 ELSE 0 END),
                        AVG(CASE WHEN started_at IS NOT NULL AND finished_at IS NOT NULL
                                 THEN finished_at - started_at END),
                        SUM(CASE WHEN created_at >= ?2 THEN 1 ELSE 0 END)
                 FROM runs
                 WHERE created_at >= ?1 AND created_at < ?3
                 GROUP BY environment ORDER BY environment",
            )?;
            let rows = stmt.query_map(params![cutoff, last_24h, now_ms], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut report = Vec::new();
        for (environment, total_runs, passed_runs, avg_duration, runs_last_24h) in rows {
            let pass_rate = pct(passed_runs, total_runs);

            let health_status = if pass_rate < 70.0 || runs_last_24h == 0 {
                HealthStatus::Critical
            } else if pass_rate < 90.0 || runs_last_24h < 2 {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            };

            report.push(EnvironmentHealth {
                latest_run: self.latest_finished_run(&environment)?,
                environment,
                total_runs,
                passed_runs,
                pass_rate,
                avg_duration_ms: avg_duration.unwrap_or(0.0).round() as i64,
                runs_last_24h,
                health_status,
            });
        }
        Ok(report)
    }

    fn latest_finished_run(&self, environment: &str) -> Result<Option<LatestRun>> {
        let conn = self.conn.lock();
        let latest = conn
            .query_row(
                "SELECT id, status, finished_at FROM runs
                 WHERE environment = ?1 AND finished_at IS NOT NULL
                 ORDER BY finished_at DESC LIMIT 1",
                params![environment],
                |row| {
                    Ok(LatestRun {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        finished_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(latest)
    }

    // ========================================================================
    // Per-test stats
    // ========================================================================

    pub fn test_stats(&self, test_key: &str, days: i64, now_ms: i64) -> Result<TestStats> {
        let cutoff = now_ms - days * MS_PER_DAY;
        let previous_cutoff = cutoff - days * MS_PER_DAY;

        let (passed, failed) = self.pass_fail_counts(Some(test_key), cutoff, now_ms)?;
        let (prev_passed, prev_failed) =
            self.pass_fail_counts(Some(test_key), previous_cutoff, cutoff)?;

        let total = passed + failed;
        let pass_rate = pct(passed, total);
        let previous_rate = pct(prev_passed, prev_passed + prev_failed);
        let delta = pass_rate - previous_rate;

        let trend = if delta > 5.0 {
            TrendDirection::Up
        } else if delta < -5.0 {
            TrendDirection::Down
        } else {
            TrendDirection::Stable
        };

        let avg_duration_ms: Option<f64> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT AVG(rt.duration_ms) FROM run_tests rt
                 JOIN runs r ON r.id = rt.run_id
                 WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
                   AND rt.status IN ('passed', 'failed')",
                params![test_key, cutoff, now_ms],
                |row| row.get(0),
            )?
        };

        Ok(TestStats {
            test_key: test_key.to_string(),
            executions: ExecutionCounts {
                total,
                passed,
                failed,
            },
            pass_rate,
            avg_duration_ms: avg_duration_ms.unwrap_or(0.0).round() as i64,
            per_environment: self.per_environment_stats(test_key, cutoff, now_ms)?,
            recent_runs: self.recent_test_runs(test_key, cutoff, now_ms, 10)?,
            trend,
        })
    }

    fn per_environment_stats(
        &self,
        test_key: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<TestEnvironmentStats>> {
        let rows: Vec<(String, i64, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT r.environment,
                        SUM(CASE WHEN rt.status = 'passed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN rt.status = 'failed' THEN 1 ELSE 0 END)
                 FROM run_tests rt
                 JOIN runs r ON r.id = rt.run_id
                 WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
                   AND rt.status IN ('passed', 'failed')
                 GROUP BY r.environment ORDER BY r.environment",
            )?;
            let rows = stmt.query_map(params![test_key, from_ms, to_ms], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut stats = Vec::new();
        for (environment, passed, failed) in rows {
            let last_run = self
                .recent_test_runs_in_env(test_key, &environment, from_ms, to_ms)?
                .into_iter()
                .next();
            stats.push(TestEnvironmentStats {
                environment,
                executions: ExecutionCounts {
                    total: passed + failed,
                    passed,
                    failed,
                },
                pass_rate: pct(passed, passed + failed),
                last_run,
            });
        }
        Ok(stats)
    }

    fn recent_test_runs(
        &self,
        test_key: &str,
        from_ms: i64,
        to_ms: i64,
        limit: i64,
    ) -> Result<Vec<TestRunSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rt.run_id, r.environment, rt.status, rt.duration_ms, rt.finished_at,
                    rt.error_message
             FROM run_tests rt
             JOIN runs r ON r.id = rt.run_id
             WHERE rt.test_key = ?1 AND r.finished_at >= ?2 AND r.finished_at < ?3
               AND rt.status IN ('passed', 'failed', 'skipped')
             ORDER BY rt.finished_at DESC LIMIT ?4",
        )?;
        let snapshots = stmt
            .query_map(params![test_key, from_ms, to_ms, limit], |row| {
                Ok(TestRunSnapshot {
                    run_id: row.get(0)?,
                    environment: row.get(1)?,
                    status: row.get(2)?,
                    duration_ms: row.get(3)?,
                    finished_at: row.get(4)?,
                    error_message: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(snapshots)
    }

    fn recent_test_runs_in_env(
        &self,
        test_key: &str,
        environment: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<TestRunSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rt.run_id, r.environment, rt.status, rt.duration_ms, rt.finished_at,
                    rt.error_message
             FROM run_tests rt
             JOIN runs r ON r.id = rt.run_id
             WHERE rt.test_key = ?1 AND r.environment = ?2
               AND r.finished_at >= ?3 AND r.finished_at < ?4
               AND rt.status IN ('passed', 'failed')
             ORDER BY rt.finished_at DESC LIMIT 1",
        )?;
        let snapshots = stmt
            .query_map(params![test_key, environment, from_ms, to_ms], |row| {
                Ok(TestRunSnapshot {
                    run_id: row.get(0)?,
                    environment: row.get(1)?,
                    status: row.get(2)?,
                    duration_ms: row.get(3)?,
                    finished_at: row.get(4)?,
                    error_message: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    // 2023-11-14T22:13:20Z
    const NOW: i64 = 1_700_000_000_000;
    const DAY: i64 = MS_PER_DAY;

    struct Fixture {
        db: Database,
        agg: Aggregator,
        seq: i64,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_memory().unwrap();
            let agg = Aggregator::new(&db);
            Self { db, agg, seq: 0 }
        }

        fn insert_run(
            &mut self,
            environment: &str,
            status: &str,
            created_at: i64,
            finished_at: Option<i64>,
        ) -> String {
            self.seq += 1;
            let id = format!("run-{:04}", self.seq);
            let started_at = if status == "queued" {
                None
            } else {
                Some(created_at + 1_000)
            };
            let conn_arc = self.db.connection();
            let conn = conn_arc.lock();
            conn.execute(
                "INSERT INTO runs (id, status, trigger_type, environment, created_at, started_at, finished_at)
                 VALUES (?1, ?2, 'manual', ?3, ?4, ?5, ?6)",
                params![id, status, environment, created_at, started_at, finished_at],
            )
            .unwrap();
            id
        }

        fn insert_test(
            &mut self,
            run_id: &str,
            test_key: &str,
            status: &str,
            finished_at: Option<i64>,
            error: Option<&str>,
        ) {
            self.seq += 1;
            let conn_arc = self.db.connection();
            let conn = conn_arc.lock();
            conn.execute(
                "INSERT INTO run_tests
                 (id, run_id, test_id, test_key, status, duration_ms, error_message, finished_at)
                 VALUES (?1, ?2, 'tid', ?3, ?4, 1000, ?5, ?6)",
                params![format!("rt-{:04}", self.seq), run_id, test_key, status, error, finished_at],
            )
            .unwrap();
        }

        /// `n` completed single-test runs with the given outcome sequence
        fn seed_outcomes(&mut self, test_key: &str, env: &str, outcomes: &[&str], base: i64) {
            for (i, outcome) in outcomes.iter().enumerate() {
                let at = base + (i as i64) * 60_000;
                let run_status = if *outcome == "passed" { "passed" } else { "failed" };
                let run_id = self.insert_run(env, run_status, at, Some(at + 30_000));
                self.insert_test(
                    &run_id,
                    test_key,
                    outcome,
                    Some(at + 25_000),
                    (*outcome == "failed").then_some("assertion failed"),
                );
            }
        }
    }

    #[test]
    fn test_round1_half_up() {
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(66.666), 66.7);
        assert_eq!(round1(33.35), 33.4);
        assert_eq!(round1(0.0), 0.0);
    }

    #[test]
    fn test_pct_zero_divisor_is_zero() {
        assert_eq!(pct(0, 0), 0.0);
        assert_eq!(pct(5, 0), 0.0);
        assert_eq!(pct(1, 3), 33.3);
    }

    #[test]
    fn test_active_runs_progress() {
        let mut fx = Fixture::new();
        fx.insert_run("SIT1", "queued", NOW, None);
        fx.insert_run("SIT1", "queued", NOW, None);
        let running = fx.insert_run("SIT1", "running", NOW, None);
        fx.insert_test(&running, "a", "passed", Some(NOW), None);
        fx.insert_test(&running, "b", "failed", Some(NOW), None);
        fx.insert_test(&running, "c", "skipped", Some(NOW), None);
        fx.insert_test(&running, "d", "running", None, None);
        fx.insert_test(&running, "e", "pending", None, None);

        let report = fx.agg.active_runs().unwrap();
        assert_eq!(report.queued, 2);
        assert_eq!(report.running, 1);
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].completed, 3);
        assert_eq!(report.runs[0].total, 5);
    }

    #[test]
    fn test_pass_rate_and_trend() {
        let mut fx = Fixture::new();
        // Current window: 8 passed, 4 failed -> 66.7%
        fx.seed_outcomes(
            "t1",
            "SIT1",
            &["passed"; 8],
            NOW - 2 * DAY,
        );
        fx.seed_outcomes("t1", "SIT1", &["failed"; 4], NOW - DAY);
        // Previous window: 1 passed, 1 failed -> 50.0%
        fx.seed_outcomes("t1", "SIT1", &["passed", "failed"], NOW - 40 * DAY);

        let report = fx.agg.pass_rate(30, NOW).unwrap();
        assert_eq!(report.passed, 8);
        assert_eq!(report.failed, 4);
        assert_eq!(report.percentage, 66.7);
        assert_eq!(report.trend, 16.7);
    }

    #[test]
    fn test_pass_rate_empty_is_zero_not_nan() {
        let fx = Fixture::new();
        let report = fx.agg.pass_rate(30, NOW).unwrap();
        assert_eq!(report.percentage, 0.0);
        assert_eq!(report.trend, 0.0);
    }

    #[test]
    fn test_total_executions_by_environment() {
        let mut fx = Fixture::new();
        fx.insert_run("SIT1", "passed", NOW - DAY, Some(NOW - DAY));
        fx.insert_run("SIT1", "failed", NOW - 2 * DAY, Some(NOW - 2 * DAY));
        fx.insert_run("SIT2", "passed", NOW - DAY, Some(NOW - DAY));
        // Previous window only
        fx.insert_run("SIT1", "passed", NOW - 45 * DAY, Some(NOW - 45 * DAY));

        let report = fx.agg.total_executions(30, NOW).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.trend, 2);
        assert_eq!(report.by_environment.len(), 2);
        assert_eq!(report.by_environment[0].environment, "SIT1");
        assert_eq!(report.by_environment[0].count, 2);
    }

    #[test]
    fn test_flaky_detection_scenario() {
        let mut fx = Fixture::new();
        // 12 executions: 8 passed, 4 failed -> 33.3% failure rate, critical
        fx.seed_outcomes("t1", "SIT1", &["passed"; 8], NOW - 3 * DAY);
        fx.seed_outcomes("t1", "SIT2", &["failed"; 4], NOW - 2 * DAY);

        let flaky = fx.agg.flaky_tests(30, 5, NOW).unwrap();
        assert_eq!(flaky.len(), 1);
        let t1 = &flaky[0];
        assert_eq!(t1.test_key, "t1");
        assert_eq!(t1.flakiness_score, 33.3);
        assert!(t1.critical);
        assert_eq!(t1.executions.total, 12);
        assert_eq!(t1.executions.passed, 8);
        assert_eq!(t1.executions.failed, 4);
        assert_eq!(t1.failing_environments, vec!["SIT2"]);

        // Most recent first: the four failures happened last
        assert_eq!(t1.recent_outcomes.len(), 10);
        assert_eq!(&t1.recent_outcomes[..4], &["failed"; 4]);

        let last = t1.last_failure.as_ref().unwrap();
        assert_eq!(last.environment, "SIT2");
        assert_eq!(last.error_message.as_deref(), Some("assertion failed"));
    }

    #[test]
    fn test_flaky_band_is_inclusive() {
        let mut fx = Fixture::new();
        // Exactly 10% failure rate at exactly min executions
        fx.seed_outcomes("low", "SIT1", &["passed"; 9], NOW - 3 * DAY);
        fx.seed_outcomes("low", "SIT1", &["failed"], NOW - 2 * DAY);
        // Exactly 90%
        fx.seed_outcomes("high", "SIT1", &["failed"; 9], NOW - 3 * DAY);
        fx.seed_outcomes("high", "SIT1", &["passed"], NOW - 2 * DAY);

        let flaky = fx.agg.flaky_tests(30, 10, NOW).unwrap();
        let keys: Vec<&str> = flaky.iter().map(|f| f.test_key.as_str()).collect();
        assert!(keys.contains(&"low"));
        assert!(keys.contains(&"high"));
        // Worst first
        assert_eq!(flaky[0].test_key, "high");

        // 30% is the inclusive critical threshold
        let high = flaky.iter().find(|f| f.test_key == "high").unwrap();
        let low = flaky.iter().find(|f| f.test_key == "low").unwrap();
        assert!(high.critical);
        assert!(!low.critical);
    }

    #[test]
    fn test_flaky_excludes_one_sided_and_rare() {
        let mut fx = Fixture::new();
        // All passed: not flaky
        fx.seed_outcomes("stable", "SIT1", &["passed"; 10], NOW - 3 * DAY);
        // All failed: broken, not flaky
        fx.seed_outcomes("broken", "SIT1", &["failed"; 10], NOW - 3 * DAY);
        // Mixed but below min executions
        fx.seed_outcomes("rare", "SIT1", &["passed", "failed"], NOW - 3 * DAY);
        // 5% failure rate: below the band
        fx.seed_outcomes("solid", "SIT1", &["passed"; 19], NOW - 3 * DAY);
        fx.seed_outcomes("solid", "SIT1", &["failed"], NOW - 2 * DAY);

        let flaky = fx.agg.flaky_tests(30, 5, NOW).unwrap();
        assert!(flaky.is_empty());
    }

    #[test]
    fn test_environment_health_thresholds() {
        let mut fx = Fixture::new();

        // healthy: 100% pass, 2 runs in last 24h
        for i in 0..2 {
            let at = NOW - (i + 1) * 3_600_000;
            fx.insert_run("GOOD", "passed", at, Some(at + 60_000));
        }

        // warning: 100% pass but only 1 run in last 24h
        let at = NOW - 3_600_000;
        fx.insert_run("SLOW", "passed", at, Some(at + 60_000));

        // critical: pass rate below 70
        for i in 0..2 {
            let at = NOW - (i + 1) * 3_600_000;
            fx.insert_run("BAD", "failed", at, Some(at + 60_000));
        }
        let at = NOW - 3 * 3_600_000;
        fx.insert_run("BAD", "passed", at, Some(at + 60_000));

        // critical: no runs in last 24h
        fx.insert_run("IDLE", "passed", NOW - 3 * DAY, Some(NOW - 3 * DAY + 60_000));

        let report = fx.agg.environment_health(30, NOW).unwrap();
        let by_env = |code: &str| {
            report
                .iter()
                .find(|e| e.environment == code)
                .unwrap_or_else(|| panic!("missing {code}"))
        };

        assert_eq!(by_env("GOOD").health_status, HealthStatus::Healthy);
        assert_eq!(by_env("SLOW").health_status, HealthStatus::Warning);
        assert_eq!(by_env("BAD").health_status, HealthStatus::Critical);
        assert_eq!(by_env("IDLE").health_status, HealthStatus::Critical);

        assert_eq!(by_env("BAD").pass_rate, 33.3);
        assert_eq!(by_env("GOOD").avg_duration_ms, 59_000);
        assert!(by_env("GOOD").latest_run.is_some());
    }

    #[test]
    fn test_test_stats_trend_directions() {
        let mut fx = Fixture::new();
        // Previous window: 50% (2/4)
        fx.seed_outcomes(
            "t1",
            "SIT1",
            &["passed", "passed", "failed", "failed"],
            NOW - 40 * DAY,
        );
        // Current window: 100% (4/4) -> up
        fx.seed_outcomes("t1", "SIT1", &["passed"; 4], NOW - 2 * DAY);

        let stats = fx.agg.test_stats("t1", 30, NOW).unwrap();
        assert_eq!(stats.executions.total, 4);
        assert_eq!(stats.pass_rate, 100.0);
        assert_eq!(stats.trend, TrendDirection::Up);
        assert_eq!(stats.avg_duration_ms, 1000);
        assert_eq!(stats.recent_runs.len(), 4);
        assert_eq!(stats.per_environment.len(), 1);
        assert_eq!(stats.per_environment[0].environment, "SIT1");
        assert!(stats.per_environment[0].last_run.is_some());

        // Stable when the delta stays within +-5
        let mut fx = Fixture::new();
        fx.seed_outcomes("t2", "SIT1", &["passed"; 2], NOW - 40 * DAY);
        fx.seed_outcomes("t2", "SIT1", &["passed"; 2], NOW - 2 * DAY);
        let stats = fx.agg.test_stats("t2", 30, NOW).unwrap();
        assert_eq!(stats.trend, TrendDirection::Stable);

        // Down when it collapses
        let mut fx = Fixture::new();
        fx.seed_outcomes("t3", "SIT1", &["passed"; 4], NOW - 40 * DAY);
        fx.seed_outcomes("t3", "SIT1", &["failed"; 4], NOW - 2 * DAY);
        let stats = fx.agg.test_stats("t3", 30, NOW).unwrap();
        assert_eq!(stats.trend, TrendDirection::Down);
    }

    #[test]
    fn test_test_stats_empty_history() {
        let fx = Fixture::new();
        let stats = fx.agg.test_stats("ghost", 30, NOW).unwrap();
        assert_eq!(stats.executions.total, 0);
        assert_eq!(stats.pass_rate, 0.0);
        assert_eq!(stats.avg_duration_ms, 0);
        assert!(stats.recent_runs.is_empty());
        assert_eq!(stats.trend, TrendDirection::Stable);
    }
}
