//! Server configuration
//!
//! Loaded once at startup from `<configDir>/app.config.json` with
//! environment-variable overrides, plus the static environment and user
//! tables from `environments.json` and `users.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use testdeck_common::{Error, Result};
use tracing::info;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// HTTP listen port
    pub port: u16,

    /// Root of the deployed test tree
    pub test_root: PathBuf,

    /// Root of the artifact tree (outside the deploy bundle)
    pub artifact_root: PathBuf,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Admission ceiling for concurrently running runs
    pub max_concurrent_runs: usize,

    /// Age in days after which runs and their artifacts are deleted
    pub retention_days: i64,

    /// External browser-test driver command line
    pub driver: DriverConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            test_root: PathBuf::from("tests"),
            artifact_root: PathBuf::from("artifacts"),
            database_path: PathBuf::from("testdeck.db"),
            max_concurrent_runs: 10,
            retention_days: 30,
            driver: DriverConfig::default(),
        }
    }
}

/// Command line used to spawn the driver for one test.
///
/// The executor appends the spec path and `--output <dir>` to `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
        }
    }
}

/// One target environment from `environments.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub code: String,
    pub name: String,

    #[serde(default)]
    pub is_prod: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct EnvironmentsFile {
    environments: Vec<Environment>,
}

/// One allow-list entry from `users.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccess {
    pub email: String,

    #[serde(default)]
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsersFile {
    users: Vec<UserAccess>,
}

impl AppConfig {
    /// Load `app.config.json` from the config directory, then apply
    /// environment-variable overrides. A missing file yields the defaults.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("app.config.json");
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::InvalidConfig(format!("{}: {}", path.display(), e))
            })?
        } else {
            info!("No app.config.json at {:?}, using defaults", config_dir);
            Self::default()
        };

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("PORT={port} is not a port")))?;
        }
        if let Ok(v) = std::env::var("TEST_ROOT") {
            config.test_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }

        if config.max_concurrent_runs == 0 {
            return Err(Error::InvalidConfig(
                "maxConcurrentRuns must be at least 1".to_string(),
            ));
        }
        if config.retention_days < 1 {
            return Err(Error::InvalidConfig(
                "retentionDays must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Load `environments.json`. The file is required: without it no run can
/// ever be admitted.
pub fn load_environments(config_dir: &Path) -> Result<Vec<Environment>> {
    let path = config_dir.join("environments.json");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    let file: EnvironmentsFile = serde_json::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;

    if file.environments.is_empty() {
        return Err(Error::InvalidConfig(
            "environments.json defines no environments".to_string(),
        ));
    }
    Ok(file.environments)
}

/// Load `users.json`. Missing file means an empty allow-list (every run
/// creation is denied), which is safe but logged loudly.
pub fn load_users(config_dir: &Path) -> Result<Vec<UserAccess>> {
    let path = config_dir.join("users.json");
    if !path.exists() {
        tracing::warn!("No users.json at {:?}; all run creation will be denied", config_dir);
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let file: UsersFile = serde_json::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    Ok(file.users)
}
