//! Configuration model for the spawner process.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnError};
use crate::types::UidGid;

/// Configuration of the privileged spawner, built by the embedding daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Identity the spawner itself runs as after bootstrap.
    pub spawner_uid_gid: UidGid,

    /// Identity used when a request does not specify one.
    pub default_uid_gid: UidGid,

    /// User ids a request may switch to.
    pub allowed_uids: BTreeSet<u32>,

    /// Group ids (effective and supplementary) a request may switch to.
    pub allowed_gids: BTreeSet<u32>,

    /// Skip all uid/gid verification.
    ///
    /// Legacy opt-in for deployments that predate allow-lists; off by default.
    pub allow_any_uid_gid: bool,

    /// Name of the systemd transient scope the spawner wraps itself in.
    pub systemd_scope: Option<String>,

    /// Description of the systemd scope.
    pub systemd_scope_description: Option<String>,

    /// systemd slice the scope is placed in.
    pub systemd_slice: Option<String>,

    /// Fraction of `memory.max` above which clients get a memory warning.
    pub memory_warning_ratio: f64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            spawner_uid_gid: UidGid::default(),
            default_uid_gid: UidGid::default(),
            allowed_uids: BTreeSet::new(),
            allowed_gids: BTreeSet::new(),
            allow_any_uid_gid: false,
            systemd_scope: None,
            systemd_scope_description: None,
            systemd_slice: None,
            memory_warning_ratio: 0.9,
        }
    }
}

impl SpawnConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SpawnError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    /// Checks whether `uid_gid` may be used for a child process.
    ///
    /// An empty identity is always acceptable; the caller substitutes
    /// [`Self::default_uid_gid`] for it.
    #[must_use]
    pub fn verify(&self, uid_gid: &UidGid) -> bool {
        if self.allow_any_uid_gid || uid_gid.is_empty() {
            return true;
        }

        let uid_ok = |uid: Option<u32>| uid.is_none_or(|uid| self.allowed_uids.contains(&uid));
        let gid_ok = |gid: Option<u32>| gid.is_none_or(|gid| self.allowed_gids.contains(&gid));

        uid_ok(uid_gid.uid)
            && uid_ok(uid_gid.real_uid)
            && gid_ok(uid_gid.gid)
            && gid_ok(uid_gid.real_gid)
            && uid_gid.groups.iter().all(|gid| self.allowed_gids.contains(gid))
    }

    /// Like [`Self::verify`] but with a descriptive error.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Rejected`] if the identity is not allowed.
    pub fn check(&self, uid_gid: &UidGid) -> Result<()> {
        if self.verify(uid_gid) {
            Ok(())
        } else {
            Err(SpawnError::Rejected {
                message: format!("uid/gid {uid_gid} is not allowed"),
            })
        }
    }
}

fn validate(config: &SpawnConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&config.memory_warning_ratio) {
        return Err(SpawnError::Config {
            message: format!(
                "memory_warning_ratio must be between 0 and 1, got {}",
                config.memory_warning_ratio
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpawnConfig {
        SpawnConfig {
            allowed_uids: [1000, 1001].into_iter().collect(),
            allowed_gids: [100, 200].into_iter().collect(),
            ..SpawnConfig::default()
        }
    }

    #[test]
    fn accepts_listed_ids() {
        let mut ids = UidGid::new(1000, 100);
        ids.groups = vec![200];
        assert!(config().verify(&ids));
    }

    #[test]
    fn rejects_unlisted_supplementary_group() {
        let mut ids = UidGid::new(1000, 100);
        ids.groups = vec![0];
        assert!(!config().verify(&ids));
    }

    #[test]
    fn rejects_unlisted_real_uid() {
        let mut ids = UidGid::new(1000, 100);
        ids.real_uid = Some(0);
        let err = config().check(&ids).expect_err("real uid 0 is not listed");
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn empty_identity_is_always_accepted() {
        assert!(SpawnConfig::default().verify(&UidGid::default()));
    }

    #[test]
    fn allow_any_bypasses_lists() {
        let config = SpawnConfig {
            allow_any_uid_gid: true,
            ..SpawnConfig::default()
        };
        assert!(config.verify(&UidGid::new(0, 0)));
    }

    #[test]
    fn loads_json_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spawn.json");
        std::fs::write(&path, r#"{ "allowed_uids": [1000], "allowed_gids": [1000] }"#)
            .expect("write config");
        let config = SpawnConfig::load(&path).expect("load config");
        assert!(config.allowed_uids.contains(&1000));
        assert!(!config.allow_any_uid_gid);
        assert!((config.memory_warning_ratio - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn load_rejects_bad_ratio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spawn.json");
        std::fs::write(&path, r#"{ "memory_warning_ratio": 3.0 }"#).expect("write config");
        assert!(SpawnConfig::load(&path).is_err());
    }
}
