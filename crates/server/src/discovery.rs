//! Test tree discovery
//!
//! One-shot reconciliation of the deployed test tree against the catalog.
//! A directory is a test folder iff it contains a `meta.json` and exactly
//! one `*.spec.js` file. Folder-level defects are logged and skipped;
//! discovery itself never aborts.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use serde::Deserialize;
use testdeck_common::types::ConfigSet;
use testdeck_common::{Error, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::store::{NewTestDefinition, Store};

/// Outcome counters for one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub discovered: usize,
    pub skipped: usize,
    pub deactivated: usize,
}

/// Shape of a test folder's `meta.json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaFile {
    test_key: String,
    friendly_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Walk the test root and reconcile the catalog.
///
/// An empty or nonexistent tree leaves the catalog untouched: mass
/// deactivation on a misconfigured root would be worse than staleness.
pub fn discover_and_sync(store: &Store, test_root: &Path) -> Result<DiscoverySummary> {
    if !test_root.exists() {
        warn!("Test root {:?} does not exist; skipping discovery", test_root);
        return Ok(DiscoverySummary::default());
    }

    let mut summary = DiscoverySummary::default();
    let mut seen = BTreeSet::new();

    for entry in WalkDir::new(test_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let dir = entry.path();
        if !dir.join("meta.json").is_file() {
            continue;
        }

        match sync_test_folder(store, test_root, dir, &mut seen) {
            Ok(true) => summary.discovered += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!("Skipping test folder {:?}: {}", dir, e);
                summary.skipped += 1;
            }
        }
    }

    if seen.is_empty() {
        if summary.skipped > 0 {
            warn!("Discovery found no valid test folders; catalog left untouched");
        } else {
            info!("Test root {:?} is empty; catalog left untouched", test_root);
        }
        return Ok(summary);
    }

    summary.deactivated = store.deactivate_tests_not_in(&seen)?;

    info!(
        "Discovery complete: {} test(s), {} skipped, {} deactivated",
        summary.discovered, summary.skipped, summary.deactivated
    );
    Ok(summary)
}

/// Sync a single candidate folder. `Ok(false)` means "not a test folder"
/// without being an error (e.g. zero or multiple spec files).
fn sync_test_folder(
    store: &Store,
    test_root: &Path,
    dir: &Path,
    seen: &mut BTreeSet<String>,
) -> Result<bool> {
    let spec_files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".spec.js"))
                    .unwrap_or(false)
        })
        .collect();

    if spec_files.len() != 1 {
        warn!(
            "Folder {:?} has {} spec file(s), expected exactly 1; skipping",
            dir,
            spec_files.len()
        );
        return Ok(false);
    }

    let meta_raw = std::fs::read_to_string(dir.join("meta.json"))?;
    let meta: MetaFile = serde_json::from_str(&meta_raw)
        .map_err(|e| Error::Validation(format!("meta.json: {e}")))?;

    if meta.test_key.trim().is_empty() {
        return Err(Error::Validation("meta.json: testKey is empty".to_string()));
    }
    if meta.friendly_name.trim().is_empty() {
        return Err(Error::Validation(
            "meta.json: friendlyName is empty".to_string(),
        ));
    }
    if !seen.insert(meta.test_key.clone()) {
        return Err(Error::Validation(format!(
            "duplicate testKey {} already discovered elsewhere",
            meta.test_key
        )));
    }

    let constants_path = dir.join("constants.json");
    let constants: ConfigSet = if constants_path.is_file() {
        let raw = std::fs::read_to_string(&constants_path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("constants.json: {e}")))?
    } else {
        ConfigSet::default()
    };

    let folder_path = relative_posix(test_root, dir)?;
    let spec_path = relative_posix(test_root, &spec_files[0])?;

    store.upsert_test(&NewTestDefinition {
        test_key: meta.test_key,
        folder_path,
        spec_path,
        meta: testdeck_common::types::TestMeta {
            friendly_name: meta.friendly_name,
            description: meta.description,
            tags: meta.tags,
        },
        constants,
    })?;

    Ok(true)
}

/// Path relative to the test root, forward-slashed regardless of platform
fn relative_posix(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        Error::Internal(format!("{path:?} is not under the test root {root:?}"))
    })?;

    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}
