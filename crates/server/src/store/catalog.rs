//! Catalog (test definition) store operations

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};
use testdeck_common::time::now_ms;
use testdeck_common::types::{ConfigSet, TestDefinition, TestMeta};
use testdeck_common::Result;
use uuid::Uuid;

use super::Store;

/// Payload for a discovery upsert
#[derive(Debug, Clone)]
pub struct NewTestDefinition {
    pub test_key: String,
    pub folder_path: String,
    pub spec_path: String,
    pub meta: TestMeta,
    pub constants: ConfigSet,
}

/// Optional filters for catalog listing
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    /// Prefix match on `folder_path`
    pub folder_prefix: Option<String>,
    /// Any-of match against `meta.tags`
    pub tags: Option<Vec<String>>,
}

struct RawDefinition {
    id: String,
    test_key: String,
    folder_path: String,
    spec_path: String,
    meta: String,
    constants: String,
    overrides: Option<String>,
    active: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawDefinition {
    fn parse(self) -> Result<TestDefinition> {
        Ok(TestDefinition {
            id: self.id,
            test_key: self.test_key,
            folder_path: self.folder_path,
            spec_path: self.spec_path,
            meta: serde_json::from_str(&self.meta)?,
            constants: serde_json::from_str(&self.constants)?,
            overrides: self
                .overrides
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            active: self.active != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const DEFINITION_COLUMNS: &str =
    "id, test_key, folder_path, spec_path, meta, constants, overrides, active, created_at, updated_at";

fn map_definition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDefinition> {
    Ok(RawDefinition {
        id: row.get(0)?,
        test_key: row.get(1)?,
        folder_path: row.get(2)?,
        spec_path: row.get(3)?,
        meta: row.get(4)?,
        constants: row.get(5)?,
        overrides: row.get(6)?,
        active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl Store {
    /// Insert or update a definition by its natural key.
    ///
    /// An update replaces location, meta, and constants, reactivates the row,
    /// and bumps `updated_at`; `overrides` is left untouched.
    pub fn upsert_test(&self, def: &NewTestDefinition) -> Result<TestDefinition> {
        let conn = self.conn.lock();
        let now = now_ms();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM test_definitions WHERE test_key = ?1",
                params![def.test_key],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE test_definitions
                     SET folder_path = ?1, spec_path = ?2, meta = ?3, constants = ?4,
                         active = 1, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        def.folder_path,
                        def.spec_path,
                        serde_json::to_string(&def.meta)?,
                        serde_json::to_string(&def.constants)?,
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO test_definitions
                     (id, test_key, folder_path, spec_path, meta, constants, active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
                    params![
                        id,
                        def.test_key,
                        def.folder_path,
                        def.spec_path,
                        serde_json::to_string(&def.meta)?,
                        serde_json::to_string(&def.constants)?,
                        now,
                    ],
                )?;
                id
            }
        };

        drop(conn);
        self.get_test_by_key(&def.test_key)?
            .ok_or_else(|| testdeck_common::Error::not_found("test definition", id))
    }

    /// Deactivate every catalog row whose key is not in `seen_keys`.
    /// Returns the number of rows deactivated.
    pub fn deactivate_tests_not_in(&self, seen_keys: &BTreeSet<String>) -> Result<usize> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT test_key FROM test_definitions WHERE active = 1")?;
        let active: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let now = now_ms();
        let mut deactivated = 0;
        for key in active.iter().filter(|k| !seen_keys.contains(*k)) {
            deactivated += conn.execute(
                "UPDATE test_definitions SET active = 0, updated_at = ?1 WHERE test_key = ?2",
                params![now, key],
            )?;
        }
        Ok(deactivated)
    }

    pub fn get_test_by_key(&self, test_key: &str) -> Result<Option<TestDefinition>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {DEFINITION_COLUMNS} FROM test_definitions WHERE test_key = ?1"),
                params![test_key],
                map_definition_row,
            )
            .optional()?;
        raw.map(RawDefinition::parse).transpose()
    }

    /// List active definitions, optionally filtered by folder prefix or tags
    pub fn list_tests(&self, filter: &CatalogFilter) -> Result<Vec<TestDefinition>> {
        let conn = self.conn.lock();

        let mut definitions = match &filter.folder_prefix {
            Some(prefix) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DEFINITION_COLUMNS} FROM test_definitions
                     WHERE active = 1 AND folder_path LIKE ?1 || '%'
                     ORDER BY test_key"
                ))?;
                let rows = stmt.query_map(params![prefix], map_definition_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DEFINITION_COLUMNS} FROM test_definitions
                     WHERE active = 1 ORDER BY test_key"
                ))?;
                let rows = stmt.query_map([], map_definition_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        }
        .into_iter()
        .map(RawDefinition::parse)
        .collect::<Result<Vec<_>>>()?;

        if let Some(tags) = &filter.tags {
            definitions.retain(|d| d.meta.tags.iter().any(|t| tags.contains(t)));
        }

        Ok(definitions)
    }

    /// Distinct tags across active definitions, sorted
    pub fn list_tags(&self) -> Result<Vec<String>> {
        let all = self.list_tests(&CatalogFilter::default())?;
        let tags: BTreeSet<String> = all
            .into_iter()
            .flat_map(|d| d.meta.tags)
            .collect();
        Ok(tags.into_iter().collect())
    }

    /// Distinct folder paths across active definitions, sorted
    pub fn list_folder_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT folder_path FROM test_definitions WHERE active = 1 ORDER BY folder_path",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// Replace a definition's overrides atomically.
    ///
    /// `overrides` replaces the prior value wholesale; `None` clears it.
    pub fn set_test_overrides(
        &self,
        test_key: &str,
        overrides: Option<&ConfigSet>,
    ) -> Result<TestDefinition> {
        let conn = self.conn.lock();
        let serialized = overrides.map(serde_json::to_string).transpose()?;
        let changed = conn.execute(
            "UPDATE test_definitions SET overrides = ?1, updated_at = ?2 WHERE test_key = ?3",
            params![serialized, now_ms(), test_key],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(testdeck_common::Error::not_found("test definition", test_key));
        }
        self.get_test_by_key(test_key)?
            .ok_or_else(|| testdeck_common::Error::not_found("test definition", test_key))
    }

    /// Resolve a list of test keys to active definitions, preserving input
    /// order; unknown or inactive keys are dropped and reported.
    pub fn resolve_active_tests(
        &self,
        test_keys: &[String],
    ) -> Result<(Vec<TestDefinition>, Vec<String>)> {
        let mut resolved = Vec::new();
        let mut missing = Vec::new();

        for key in test_keys {
            match self.get_test_by_key(key)? {
                Some(def) if def.active => resolved.push(def),
                _ => missing.push(key.clone()),
            }
        }

        Ok((resolved, missing))
    }
}
