//! Cron-driven run scheduling
//!
//! Every thirty seconds the worker evaluates enabled schedules in UTC and
//! synthesizes runs for the due ones. A schedule whose previous run is
//! still queued or running is suppressed without advancing its
//! `last_triggered_at`, so the missed firing is not replayed later.

use std::str::FromStr;
use std::time::Duration;

use cron::Schedule as CronSchedule;
use serde_json::json;
use testdeck_common::time::{now_ms, to_datetime};
use testdeck_common::types::{Selector, TestDefinition, TriggerType};
use testdeck_common::{Error, Result};
use tracing::{debug, error, info};

use crate::store::{CatalogFilter, NewRun, Store};

const TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct ScheduleWorker {
    store: Store,
}

impl ScheduleWorker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run the scheduling loop
    pub async fn run(self) {
        info!("Schedule worker started");

        loop {
            if let Err(e) = self.tick(now_ms()) {
                error!("Schedule tick error: {}", e);
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }

    /// One evaluation pass at `now_ms`. Returns the number of runs created.
    pub fn tick(&self, now_ms: i64) -> Result<usize> {
        let mut created = 0;

        for schedule in self.store.list_enabled_schedules()? {
            let due = match is_due(&schedule.cron, schedule.last_triggered_at, now_ms) {
                Ok(due) => due,
                Err(e) => {
                    // Operator must fix the expression; the schedule stays
                    // enabled so the error keeps surfacing.
                    error!("Schedule {} ({}): {}", schedule.name, schedule.id, e);
                    continue;
                }
            };
            if !due {
                continue;
            }

            if self.store.schedule_has_open_run(&schedule.id)? {
                debug!(
                    "Schedule {} is due but a prior run is still open; suppressed",
                    schedule.name
                );
                continue;
            }

            let tests = self.materialize_selector(&schedule.selector)?;
            info!(
                "Schedule {} due: creating run with {} test(s) on {}",
                schedule.name,
                tests.len(),
                schedule.environment
            );

            let run = self.store.create_run(&NewRun {
                trigger_type: TriggerType::Schedule,
                environment: schedule.environment.clone(),
                schedule_id: Some(schedule.id.clone()),
                triggered_by_email: None,
                run_overrides: schedule.default_run_overrides.clone(),
                metadata: Some(json!({
                    "scheduleName": schedule.name,
                    "selector": schedule.selector,
                })),
                tests: tests
                    .into_iter()
                    .map(|def| (def.id, def.test_key))
                    .collect(),
            })?;
            debug!("Schedule {} created run {}", schedule.name, run.id);

            self.store
                .set_schedule_last_triggered(&schedule.id, now_ms)?;
            created += 1;
        }

        Ok(created)
    }

    /// Resolve a selector to the concrete set of active tests
    fn materialize_selector(&self, selector: &Selector) -> Result<Vec<TestDefinition>> {
        match selector {
            Selector::Folder { folder_prefix } => self.store.list_tests(&CatalogFilter {
                folder_prefix: Some(folder_prefix.clone()),
                tags: None,
            }),
            Selector::Tags { tags } => self.store.list_tests(&CatalogFilter {
                folder_prefix: None,
                tags: Some(tags.clone()),
            }),
            Selector::Explicit { test_keys } => {
                let (resolved, missing) = self.store.resolve_active_tests(test_keys)?;
                if !missing.is_empty() {
                    debug!("Selector references unknown tests: {:?}", missing);
                }
                Ok(resolved)
            }
        }
    }
}

/// Normalize a 5- or 6-field cron expression to the parser's 6-field
/// (seconds-first) form and parse it.
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 => expression.trim().to_string(),
        _ => {
            return Err(Error::InvalidCron {
                expression: expression.to_string(),
                message: format!("expected 5 or 6 fields, got {fields}"),
            })
        }
    };

    CronSchedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// A schedule is due when the next firing computed from its last trigger
/// (or the epoch, if it never fired) is not in the future.
pub fn is_due(expression: &str, last_triggered_ms: Option<i64>, now_ms: i64) -> Result<bool> {
    let schedule = parse_cron(expression)?;
    let reference = to_datetime(last_triggered_ms.unwrap_or(0));

    match schedule.after(&reference).next() {
        Some(next_fire) => Ok(next_fire.timestamp_millis() <= now_ms),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{memory_store, sample_definition};
    use testdeck_common::types::{RunStatus, Schedule};

    // 2023-11-14T22:13:20Z
    const NOW: i64 = 1_700_000_000_000;
    const HOUR: i64 = 3_600_000;

    fn insert_schedule(store: &Store, selector: Selector, cron: &str) -> Schedule {
        store
            .create_schedule(&crate::store::NewSchedule {
                name: "nightly".to_string(),
                cron: cron.to_string(),
                enabled: true,
                environment: "SIT1".to_string(),
                selector,
                default_run_overrides: None,
                created_by_email: None,
            })
            .unwrap()
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("* * *").is_err());
        assert!(parse_cron("not a cron at all x y").is_err());
    }

    #[test]
    fn test_never_triggered_is_immediately_due() {
        // Reference falls back to the epoch, so any past firing counts
        assert!(is_due("0 0 * * * *", None, NOW).unwrap());
    }

    #[test]
    fn test_due_window_after_last_trigger() {
        // Hourly at minute zero; last fired at 22:13:20, next fire 23:00:00
        let last = Some(NOW);
        assert!(!is_due("0 0 * * * *", last, NOW + 10 * 60_000).unwrap());
        assert!(is_due("0 0 * * * *", last, NOW + HOUR).unwrap());
    }

    #[test]
    fn test_five_field_form_is_hourly_equivalent() {
        let last = Some(NOW);
        assert!(is_due("0 * * * *", last, NOW + HOUR).unwrap());
        assert!(!is_due("0 * * * *", last, NOW + 60_000).unwrap());
    }

    #[test]
    fn test_tick_creates_run_and_advances_stamp() {
        let store = memory_store();
        store
            .upsert_test(&sample_definition("auth.login", "auth/login"))
            .unwrap();
        let schedule = insert_schedule(
            &store,
            Selector::Tags {
                tags: vec!["smoke".to_string()],
            },
            "0 0 * * * *",
        );

        let worker = ScheduleWorker::new(store.clone());
        assert_eq!(worker.tick(NOW).unwrap(), 1);

        let runs = store
            .list_runs(&crate::store::RunFilter::default())
            .unwrap();
        assert_eq!(runs.total, 1);
        let run = &runs.runs[0];
        assert_eq!(run.schedule_id.as_deref(), Some(schedule.id.as_str()));
        assert_eq!(run.trigger_type, TriggerType::Schedule);
        assert_eq!(store.list_run_tests(&run.id).unwrap().len(), 1);

        let stamped = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(stamped.last_triggered_at, Some(NOW));

        // Immediately after firing, the schedule is no longer due
        assert_eq!(worker.tick(NOW + 60_000).unwrap(), 0);
    }

    #[test]
    fn test_overlap_suppression_preserves_stamp() {
        let store = memory_store();
        let schedule = insert_schedule(
            &store,
            Selector::Explicit { test_keys: vec![] },
            "0 0 * * * *",
        );
        let worker = ScheduleWorker::new(store.clone());

        assert_eq!(worker.tick(NOW).unwrap(), 1);
        let open_run = store
            .list_runs(&crate::store::RunFilter::default())
            .unwrap()
            .runs[0]
            .id
            .clone();

        // Next window arrives while the run is still queued
        assert_eq!(worker.tick(NOW + 2 * HOUR).unwrap(), 0);
        let after = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(after.last_triggered_at, Some(NOW));

        // Once the run terminates, the next due tick fires again
        store.set_run_status(&open_run, RunStatus::Running).unwrap();
        store.set_run_status(&open_run, RunStatus::Passed).unwrap();
        assert_eq!(worker.tick(NOW + 3 * HOUR).unwrap(), 1);
        let after = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert_eq!(after.last_triggered_at, Some(NOW + 3 * HOUR));
    }

    #[test]
    fn test_empty_selector_creates_audit_run() {
        let store = memory_store();
        insert_schedule(
            &store,
            Selector::Folder {
                folder_prefix: "does-not-exist/".to_string(),
            },
            "0 0 * * * *",
        );
        let worker = ScheduleWorker::new(store.clone());

        assert_eq!(worker.tick(NOW).unwrap(), 1);
        let run = &store
            .list_runs(&crate::store::RunFilter::default())
            .unwrap()
            .runs[0];
        assert!(store.list_run_tests(&run.id).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_cron_does_not_disable() {
        let store = memory_store();
        let schedule = insert_schedule(
            &store,
            Selector::Explicit { test_keys: vec![] },
            "0 0 * * * *",
        );
        // Corrupt the expression under the validator's feet
        store
            .update_schedule(
                &schedule.id,
                &crate::store::ScheduleUpdate {
                    name: schedule.name.clone(),
                    cron: "whenever".to_string(),
                    enabled: true,
                    environment: schedule.environment.clone(),
                    selector: schedule.selector.clone(),
                    default_run_overrides: None,
                    updated_by_email: None,
                },
            )
            .unwrap();

        let worker = ScheduleWorker::new(store.clone());
        assert_eq!(worker.tick(NOW).unwrap(), 0);

        let after = store.get_schedule(&schedule.id).unwrap().unwrap();
        assert!(after.enabled);
    }

    #[test]
    fn test_selector_materialization() {
        let store = memory_store();
        store
            .upsert_test(&sample_definition("auth.login", "auth/login"))
            .unwrap();
        store
            .upsert_test(&sample_definition("billing.pay", "billing/pay"))
            .unwrap();
        let worker = ScheduleWorker::new(store.clone());

        let by_folder = worker
            .materialize_selector(&Selector::Folder {
                folder_prefix: "auth/".to_string(),
            })
            .unwrap();
        assert_eq!(by_folder.len(), 1);

        let by_tags = worker
            .materialize_selector(&Selector::Tags {
                tags: vec!["smoke".to_string()],
            })
            .unwrap();
        assert_eq!(by_tags.len(), 2);

        let explicit = worker
            .materialize_selector(&Selector::Explicit {
                test_keys: vec!["billing.pay".to_string(), "ghost.key".to_string()],
            })
            .unwrap();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].test_key, "billing.pay");
    }
}
