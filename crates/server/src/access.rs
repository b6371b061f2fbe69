//! Environment access policy
//!
//! A static map from user email to permitted environment codes, built from
//! `environments.json` and `users.json` at startup and immutable thereafter.
//! Email comparison is case-insensitive.

use std::collections::{HashMap, HashSet};

use testdeck_common::{Error, Result};

use crate::config::{Environment, UserAccess};

/// Process-wide read-only access policy
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    environments: Vec<Environment>,
    known_codes: HashSet<String>,
    /// lowercased email -> permitted environment codes
    grants: HashMap<String, HashSet<String>>,
}

impl AccessPolicy {
    pub fn new(environments: Vec<Environment>, users: Vec<UserAccess>) -> Self {
        let known_codes: HashSet<String> =
            environments.iter().map(|e| e.code.clone()).collect();

        let mut grants: HashMap<String, HashSet<String>> = HashMap::new();
        for user in users {
            let entry = grants.entry(user.email.to_lowercase()).or_default();
            entry.extend(user.environments);
        }

        Self {
            environments,
            known_codes,
            grants,
        }
    }

    /// The configured environment list, in file order
    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    /// Whether `code` appears in `environments.json`
    pub fn is_known_environment(&self, code: &str) -> bool {
        self.known_codes.contains(code)
    }

    /// Environments the user may trigger runs against (empty for unknown users)
    pub fn allowed_environments(&self, email: &str) -> Vec<String> {
        let mut codes: Vec<String> = self
            .grants
            .get(&email.to_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        codes.sort();
        codes
    }

    /// Deny unless the user is allow-listed for the environment.
    ///
    /// A missing user is denied, not an error distinct from a known user
    /// without the grant.
    pub fn check(&self, email: &str, environment: &str) -> Result<()> {
        let allowed = self
            .grants
            .get(&email.to_lowercase())
            .map(|envs| envs.contains(environment))
            .unwrap_or(false);

        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                email: email.to_string(),
                environment: environment.to_string(),
            })
        }
    }
}
