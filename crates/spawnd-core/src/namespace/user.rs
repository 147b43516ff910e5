//! User namespace id mapping.
//!
//! The parent writes `/proc/<pid>/uid_map` and `gid_map` for a child that
//! has just entered (or is about to enter) a new user namespace.

use std::fmt::Write as _;

use spawnd_common::error::{Result, SpawnError};

/// Ids to map into a new user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// Outside (parent namespace) id of the child's effective identity.
    pub outside: u32,
    /// Id the effective identity has inside the namespace.
    pub inside: u32,
    /// Outside id of the real identity, if it differs from `outside`.
    pub real: Option<u32>,
    /// Also map root to root.
    pub map_root: bool,
}

impl IdMapping {
    /// Maps `outside` to itself.
    #[must_use]
    pub const fn identity(outside: u32) -> Self {
        Self {
            outside,
            inside: outside,
            real: None,
            map_root: false,
        }
    }

    /// Translates an outside id into the namespace, if it is mapped.
    #[must_use]
    pub fn translate(&self, outside: u32) -> Option<u32> {
        if outside == self.outside {
            Some(self.inside)
        } else if self.real == Some(outside) && outside != self.inside {
            Some(outside)
        } else if self.map_root && outside == 0 && self.inside != 0 {
            Some(0)
        } else {
            None
        }
    }

    /// Renders the mapping in `uid_map`/`gid_map` format
    /// (`<inside> <outside> <count>` per line).
    #[must_use]
    pub fn to_map_content(&self) -> String {
        let mut content = String::new();
        if self.map_root && self.inside != 0 && self.outside != 0 {
            content.push_str("0 0 1\n");
        }
        let _ = writeln!(content, "{} {} 1", self.inside, self.outside);
        if let Some(real) = self.real {
            if real != self.outside && real != self.inside && !(self.map_root && real == 0) {
                let _ = writeln!(content, "{real} {real} 1");
            }
        }
        content
    }

    /// Renders the mapping plus an identity line for each of `groups` not
    /// already covered, so supplementary groups survive inside the
    /// namespace. Only a writer with `CAP_SETGID` may install such a map.
    #[must_use]
    pub fn to_map_content_with(&self, groups: &[u32]) -> String {
        let mut content = self.to_map_content();
        for (i, &group) in groups.iter().enumerate() {
            let seen = groups.get(..i).is_some_and(|earlier| earlier.contains(&group));
            if seen || group == self.inside || self.translate(group).is_some() {
                continue;
            }
            let _ = writeln!(content, "{group} {group} 1");
        }
        content
    }

    /// The id `outside` has inside the namespace: its mapping if any,
    /// otherwise itself (an identity line from [`Self::to_map_content_with`]).
    #[must_use]
    pub fn translate_group(&self, outside: u32) -> u32 {
        self.translate(outside).unwrap_or(outside)
    }
}

fn write_proc_file(pid: libc::pid_t, name: &str, content: &str) -> Result<()> {
    let path = std::path::PathBuf::from(format!("/proc/{pid}/{name}"));
    std::fs::write(&path, content).map_err(|e| SpawnError::Io { path, source: e })
}

/// Denies `setgroups()` for the namespace of `pid`, as required before an
/// unprivileged writer may set `gid_map`.
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/setgroups` cannot be written.
pub fn deny_setgroups(pid: libc::pid_t) -> Result<()> {
    write_proc_file(pid, "setgroups", "deny")
}

/// Writes `gid_map` and `uid_map` for the user namespace of `pid`.
///
/// `groups` are supplementary groups to map as well. An unprivileged
/// writer passes `deny = true`: `setgroups` is denied first (best-effort),
/// as the kernel requires before such a writer may set `gid_map`.
///
/// # Errors
///
/// Returns an error if either map file cannot be written.
pub fn write_id_maps(pid: libc::pid_t, uid: &IdMapping, gid: &IdMapping, groups: &[u32], deny: bool) -> Result<()> {
    if deny {
        if let Err(e) = deny_setgroups(pid) {
            tracing::debug!(pid, error = %e, "could not deny setgroups");
        }
    }
    write_proc_file(pid, "gid_map", &gid.to_map_content_with(groups))?;
    write_proc_file(pid, "uid_map", &uid.to_map_content())?;
    tracing::debug!(pid, uid = uid.outside, gid = gid.outside, groups = groups.len(), "wrote uid/gid maps");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_unprivileged_uid_to_root_inside() {
        let mapping = IdMapping {
            outside: 1000,
            inside: 0,
            real: None,
            map_root: false,
        };
        assert_eq!(mapping.to_map_content(), "0 1000 1\n");
    }

    #[test]
    fn root_line_only_when_requested() {
        let mut mapping = IdMapping::identity(1000);
        assert_eq!(mapping.to_map_content(), "1000 1000 1\n");
        mapping.map_root = true;
        assert_eq!(mapping.to_map_content(), "0 0 1\n1000 1000 1\n");
    }

    #[test]
    fn root_line_not_duplicated_when_mapping_to_root() {
        let mapping = IdMapping {
            outside: 1000,
            inside: 0,
            real: None,
            map_root: true,
        };
        assert_eq!(mapping.to_map_content(), "0 1000 1\n");
    }

    #[test]
    fn real_id_gets_its_own_line() {
        let mapping = IdMapping {
            outside: 1000,
            inside: 1000,
            real: Some(1001),
            map_root: false,
        };
        assert_eq!(mapping.to_map_content(), "1000 1000 1\n1001 1001 1\n");
        assert_eq!(mapping.translate(1001), Some(1001));
        assert_eq!(mapping.translate(5), None);
    }

    #[test]
    fn supplementary_groups_get_identity_lines() {
        let mapping = IdMapping::identity(100);
        assert_eq!(
            mapping.to_map_content_with(&[100, 27, 44, 27]),
            "100 100 1\n27 27 1\n44 44 1\n"
        );
        assert_eq!(mapping.translate_group(27), 27);
        assert_eq!(mapping.to_map_content_with(&[]), mapping.to_map_content());
    }

    #[test]
    fn translate_follows_mapping() {
        let mapping = IdMapping {
            outside: 1000,
            inside: 0,
            real: None,
            map_root: false,
        };
        assert_eq!(mapping.translate(1000), Some(0));
        assert_eq!(mapping.translate(0), None);
    }
}
