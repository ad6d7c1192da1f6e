// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-user accounting and limits.
//!
//! Limits are persisted to `users.yaml` in the spool directory as soon as
//! they change; running counters are never persisted and are rebuilt by
//! spool replay at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Name of the limits file inside the spool directory
pub const USERS_FILE: &str = "users.yaml";

/// Ceilings on a user's running jobs and held cores. Absent or negative
/// values mean no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum concurrently running jobs
    #[serde(rename = "Njobs", default, skip_serializing_if = "Option::is_none")]
    pub njobs: Option<i64>,
    /// Maximum concurrently held cores
    #[serde(rename = "Ncores", default, skip_serializing_if = "Option::is_none")]
    pub ncores: Option<i64>,
}

impl Limits {
    /// The job ceiling, if one is actually enforced
    pub fn job_cap(&self) -> Option<u64> {
        self.njobs.filter(|n| *n >= 0).map(|n| n as u64)
    }

    /// The core ceiling, if one is actually enforced
    pub fn core_cap(&self) -> Option<u64> {
        self.ncores.filter(|n| *n >= 0).map(|n| n as u64)
    }
}

/// Whether `limit` sets or clears the limits for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Replace the user's limits
    Set,
    /// Remove the user's limits
    Clear,
}

/// In-memory record for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Username
    pub user: String,
    /// Jobs currently running
    pub run: u64,
    /// Cores currently held by running jobs
    pub cores: u64,
    /// Configured ceilings
    #[serde(default)]
    pub limits: Limits,
}

impl UserRecord {
    fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            run: 0,
            cores: 0,
            limits: Limits::default(),
        }
    }
}

/// What `users.yaml` holds per user: identity and limits only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedUser {
    user: String,
    #[serde(default)]
    limits: Limits,
}

/// The user registry: counters plus persisted limits.
#[derive(Debug)]
pub struct Users {
    path: PathBuf,
    users: BTreeMap<String, UserRecord>,
}

impl Users {
    /// Load limits from `users.yaml` in the spool directory; a missing file
    /// is an empty registry.
    pub fn load(spool_dir: impl AsRef<Path>) -> Result<Self> {
        let path = spool_dir.as_ref().join(USERS_FILE);
        let mut users = BTreeMap::new();
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let persisted: BTreeMap<String, PersistedUser> = serde_yaml::from_str(&text)
                .map_err(|e| Error::Spool(format!("unreadable {}: {e}", path.display())))?;
            for (name, p) in persisted {
                let mut record = UserRecord::new(&name);
                record.limits = p.limits;
                users.insert(name, record);
            }
            info!("loaded limits for {} users from {}", users.len(), path.display());
        }
        Ok(Self { path, users })
    }

    fn entry(&mut self, user: &str) -> &mut UserRecord {
        self.users
            .entry(user.to_string())
            .or_insert_with(|| UserRecord::new(user))
    }

    /// Account a job start: one running job, `hosts.len()` cores.
    pub fn increment(&mut self, user: &str, hosts: &[String]) {
        let record = self.entry(user);
        record.run += 1;
        record.cores += hosts.len() as u64;
        debug!(
            "user {} now runs {} jobs on {} cores",
            user, record.run, record.cores
        );
    }

    /// Account a job leaving run; clamps at zero.
    pub fn decrement(&mut self, user: &str, hosts: &[String]) {
        let record = self.entry(user);
        record.run = record.run.saturating_sub(1);
        record.cores = record.cores.saturating_sub(hosts.len() as u64);
    }

    /// False iff the user has reached a configured ceiling.
    pub fn within_limits(&self, user: &str) -> bool {
        let Some(record) = self.users.get(user) else {
            return true;
        };
        if let Some(cap) = record.limits.job_cap() {
            if record.run >= cap {
                return false;
            }
        }
        if let Some(cap) = record.limits.core_cap() {
            if record.cores >= cap {
                return false;
            }
        }
        true
    }

    /// Set or clear a user's limits and persist immediately.
    pub fn set_limits(&mut self, user: &str, limits: Limits, action: LimitAction) -> Result<()> {
        let record = self.entry(user);
        record.limits = match action {
            LimitAction::Set => limits,
            LimitAction::Clear => Limits::default(),
        };
        info!("limits for {}: {:?} ({:?})", user, record.limits, action);
        self.persist()
    }

    /// One user's record
    pub fn get(&self, user: &str) -> Option<&UserRecord> {
        self.users.get(user)
    }

    /// All records, ordered by username
    pub fn iter(&self) -> impl Iterator<Item = &UserRecord> {
        self.users.values()
    }

    fn persist(&self) -> Result<()> {
        let persisted: BTreeMap<&String, PersistedUser> = self
            .users
            .iter()
            .map(|(name, r)| {
                (
                    name,
                    PersistedUser {
                        user: r.user.clone(),
                        limits: r.limits,
                    },
                )
            })
            .collect();
        let text = serde_yaml::to_string(&persisted)
            .map_err(|e| Error::Spool(format!("encoding {USERS_FILE}: {e}")))?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hosts(n: usize) -> Vec<String> {
        vec!["n1".to_string(); n]
    }

    #[test]
    fn test_counters() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();

        users.increment("bob", &hosts(4));
        users.increment("bob", &hosts(2));
        let bob = users.get("bob").unwrap();
        assert_eq!(bob.run, 2);
        assert_eq!(bob.cores, 6);

        users.decrement("bob", &hosts(4));
        let bob = users.get("bob").unwrap();
        assert_eq!(bob.run, 1);
        assert_eq!(bob.cores, 2);
    }

    #[test]
    fn test_decrement_clamps_at_zero() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();
        users.decrement("ghost", &hosts(8));
        let ghost = users.get("ghost").unwrap();
        assert_eq!(ghost.run, 0);
        assert_eq!(ghost.cores, 0);
    }

    #[test]
    fn test_limits_enforced() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();

        assert!(users.within_limits("bob"));

        users
            .set_limits(
                "bob",
                Limits {
                    njobs: Some(1),
                    ncores: None,
                },
                LimitAction::Set,
            )
            .unwrap();
        assert!(users.within_limits("bob"));

        users.increment("bob", &hosts(2));
        assert!(!users.within_limits("bob"));

        users.decrement("bob", &hosts(2));
        assert!(users.within_limits("bob"));
    }

    #[test]
    fn test_core_limit() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();
        users
            .set_limits(
                "amy",
                Limits {
                    njobs: None,
                    ncores: Some(4),
                },
                LimitAction::Set,
            )
            .unwrap();
        users.increment("amy", &hosts(4));
        assert!(!users.within_limits("amy"));
    }

    #[test]
    fn test_negative_limit_means_unlimited() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();
        users
            .set_limits(
                "amy",
                Limits {
                    njobs: Some(-1),
                    ncores: Some(-1),
                },
                LimitAction::Set,
            )
            .unwrap();
        users.increment("amy", &hosts(100));
        assert!(users.within_limits("amy"));
    }

    #[test]
    fn test_limits_persist_across_load() {
        let dir = TempDir::new().unwrap();
        {
            let mut users = Users::load(dir.path()).unwrap();
            users
                .set_limits(
                    "bob",
                    Limits {
                        njobs: Some(3),
                        ncores: Some(12),
                    },
                    LimitAction::Set,
                )
                .unwrap();
            users.increment("bob", &hosts(2));
        }

        let users = Users::load(dir.path()).unwrap();
        let bob = users.get("bob").unwrap();
        assert_eq!(bob.limits.njobs, Some(3));
        assert_eq!(bob.limits.ncores, Some(12));
        // counters are rebuilt by replay, not persisted
        assert_eq!(bob.run, 0);
        assert_eq!(bob.cores, 0);
    }

    #[test]
    fn test_clear_limits() {
        let dir = TempDir::new().unwrap();
        let mut users = Users::load(dir.path()).unwrap();
        users
            .set_limits(
                "bob",
                Limits {
                    njobs: Some(0),
                    ncores: None,
                },
                LimitAction::Set,
            )
            .unwrap();
        assert!(!users.within_limits("bob"));

        users
            .set_limits("bob", Limits::default(), LimitAction::Clear)
            .unwrap();
        assert!(users.within_limits("bob"));
    }
}
