//! Schedule store operations

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use testdeck_common::time::now_ms;
use testdeck_common::types::{Schedule, Selector};
use testdeck_common::{Error, Result};
use uuid::Uuid;

use super::Store;

/// Payload for schedule creation
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub environment: String,
    pub selector: Selector,
    pub default_run_overrides: Option<HashMap<String, Value>>,
    pub created_by_email: Option<String>,
}

/// Full-replace update payload (PUT semantics)
#[derive(Debug, Clone)]
pub struct ScheduleUpdate {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub environment: String,
    pub selector: Selector,
    pub default_run_overrides: Option<HashMap<String, Value>>,
    pub updated_by_email: Option<String>,
}

const SCHEDULE_COLUMNS: &str = "id, name, cron, enabled, environment, last_triggered_at, selector, \
     default_run_overrides, created_by_email, updated_by_email, created_at, updated_at";

struct RawSchedule {
    id: String,
    name: String,
    cron: String,
    enabled: i64,
    environment: String,
    last_triggered_at: Option<i64>,
    selector: String,
    default_run_overrides: Option<String>,
    created_by_email: Option<String>,
    updated_by_email: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawSchedule {
    fn parse(self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id,
            name: self.name,
            cron: self.cron,
            enabled: self.enabled != 0,
            environment: self.environment,
            last_triggered_at: self.last_triggered_at,
            selector: serde_json::from_str(&self.selector)?,
            default_run_overrides: self
                .default_run_overrides
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_by_email: self.created_by_email,
            updated_by_email: self.updated_by_email,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn map_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSchedule> {
    Ok(RawSchedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        enabled: row.get(3)?,
        environment: row.get(4)?,
        last_triggered_at: row.get(5)?,
        selector: row.get(6)?,
        default_run_overrides: row.get(7)?,
        created_by_email: row.get(8)?,
        updated_by_email: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl Store {
    pub fn create_schedule(&self, new: &NewSchedule) -> Result<Schedule> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO schedules
             (id, name, cron, enabled, environment, selector, default_run_overrides,
              created_by_email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                new.name,
                new.cron,
                new.enabled as i64,
                new.environment,
                serde_json::to_string(&new.selector)?,
                new.default_run_overrides
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                new.created_by_email,
                now,
            ],
        )?;
        drop(conn);

        self.get_schedule(&id)?
            .ok_or_else(|| Error::not_found("schedule", id))
    }

    pub fn update_schedule(&self, id: &str, update: &ScheduleUpdate) -> Result<Schedule> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE schedules SET
                 name = ?1, cron = ?2, enabled = ?3, environment = ?4, selector = ?5,
                 default_run_overrides = ?6, updated_by_email = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                update.name,
                update.cron,
                update.enabled as i64,
                update.environment,
                serde_json::to_string(&update.selector)?,
                update
                    .default_run_overrides
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                update.updated_by_email,
                now_ms(),
                id,
            ],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(Error::not_found("schedule", id));
        }
        self.get_schedule(id)?
            .ok_or_else(|| Error::not_found("schedule", id))
    }

    pub fn delete_schedule(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
                map_schedule_row,
            )
            .optional()?;
        raw.map(RawSchedule::parse).transpose()
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name"
        ))?;
        let rows = stmt.query_map([], map_schedule_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(RawSchedule::parse)
            .collect()
    }

    pub fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE enabled = 1 ORDER BY name"
        ))?;
        let rows = stmt.query_map([], map_schedule_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(RawSchedule::parse)
            .collect()
    }

    pub fn set_schedule_last_triggered(&self, id: &str, at_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE schedules SET last_triggered_at = ?1 WHERE id = ?2",
            params![at_ms, id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("schedule", id));
        }
        Ok(())
    }

    /// Whether any run of this schedule is still queued or running
    /// (overlap suppression)
    pub fn schedule_has_open_run(&self, schedule_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE schedule_id = ?1 AND status IN ('queued', 'running')",
            params![schedule_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
