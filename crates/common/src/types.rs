//! Core data model for TestDeck
//!
//! These are the value objects the store hands out and the HTTP surface
//! serializes. JSON-backed columns (`meta`, `constants`, `overrides`,
//! `selector`, `summary`, `artifacts`, ...) round-trip through serde; status
//! columns are stored as their lowercase string form.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::time::{rfc3339_ms, rfc3339_ms_opt};

// ============================================================================
// Statuses
// ============================================================================

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown run status: {other}"))),
        }
    }
}

/// Lifecycle status of a single test within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl RunTestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTestStatus::Pending => "pending",
            RunTestStatus::Running => "running",
            RunTestStatus::Passed => "passed",
            RunTestStatus::Failed => "failed",
            RunTestStatus::Skipped => "skipped",
        }
    }

    /// A completed test no longer changes and counts toward run progress
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            RunTestStatus::Passed | RunTestStatus::Failed | RunTestStatus::Skipped
        )
    }
}

impl fmt::Display for RunTestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunTestStatus::Pending),
            "running" => Ok(RunTestStatus::Running),
            "passed" => Ok(RunTestStatus::Passed),
            "failed" => Ok(RunTestStatus::Failed),
            "skipped" => Ok(RunTestStatus::Skipped),
            other => Err(Error::Validation(format!("unknown test status: {other}"))),
        }
    }
}

/// How a run came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Schedule,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Schedule => "schedule",
        }
    }
}

impl FromStr for TriggerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "schedule" => Ok(TriggerType::Schedule),
            other => Err(Error::Validation(format!("unknown trigger type: {other}"))),
        }
    }
}

// ============================================================================
// Test catalog
// ============================================================================

/// Friendly metadata parsed from a test folder's `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMeta {
    pub friendly_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Shared and per-environment key/value configuration for a test.
///
/// The same shape backs both `constants` (from `constants.json`) and
/// `overrides` (set through the API).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSet {
    #[serde(default)]
    pub shared: HashMap<String, Value>,

    #[serde(default)]
    pub environments: HashMap<String, HashMap<String, Value>>,
}

impl ConfigSet {
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.environments.is_empty()
    }
}

/// Catalog entry for one spec file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: String,

    /// Natural key; unique and stable across re-discovery
    pub test_key: String,

    /// POSIX folder path relative to the test root
    pub folder_path: String,

    /// Spec file path relative to the test root
    pub spec_path: String,

    pub meta: TestMeta,

    pub constants: ConfigSet,

    /// Operator-managed; never touched by discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ConfigSet>,

    pub active: bool,

    #[serde(with = "rfc3339_ms")]
    pub created_at: i64,

    #[serde(with = "rfc3339_ms")]
    pub updated_at: i64,
}

// ============================================================================
// Runs
// ============================================================================

/// Aggregate totals for a finished (or aborted) run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_tests: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub duration_ms: i64,
}

/// One orchestrated execution against one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub environment: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by_email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_overrides: Option<HashMap<String, Value>>,

    /// Selection provenance (e.g. which selector produced the test set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,

    #[serde(with = "rfc3339_ms")]
    pub created_at: i64,

    #[serde(with = "rfc3339_ms_opt", default)]
    pub started_at: Option<i64>,

    #[serde(with = "rfc3339_ms_opt", default)]
    pub finished_at: Option<i64>,
}

/// Artifact filenames recorded for a test, relative to its artifact directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_log: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// One spec's execution within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTest {
    pub id: String,
    pub run_id: String,
    pub test_id: String,
    pub test_key: String,
    pub status: RunTestStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<TestArtifacts>,

    #[serde(with = "rfc3339_ms_opt", default)]
    pub started_at: Option<i64>,

    #[serde(with = "rfc3339_ms_opt", default)]
    pub finished_at: Option<i64>,
}

// ============================================================================
// Schedules
// ============================================================================

/// Which active tests a schedule materializes into its runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Selector {
    /// Prefix match on `folder_path`
    Folder {
        #[serde(rename = "folderPrefix")]
        folder_prefix: String,
    },

    /// Any overlap with `meta.tags`
    Tags { tags: Vec<String> },

    /// Exact test-key set
    Explicit {
        #[serde(rename = "testKeys")]
        test_keys: Vec<String>,
    },
}

/// Recurring run template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,

    /// 5- or 6-field UTC cron expression
    pub cron: String,

    pub enabled: bool,
    pub environment: String,

    #[serde(with = "rfc3339_ms_opt", default)]
    pub last_triggered_at: Option<i64>,

    pub selector: Selector,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_run_overrides: Option<HashMap<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by_email: Option<String>,

    #[serde(with = "rfc3339_ms")]
    pub created_at: i64,

    #[serde(with = "rfc3339_ms")]
    pub updated_at: i64,
}
