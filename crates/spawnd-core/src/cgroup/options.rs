//! Per-child cgroup description.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Component, Path};

use spawnd_common::error::{Result, SpawnError};

use super::{CgroupState, c_name, disabled, io_error, write_file_at};
use crate::sys;

/// Where a child process is placed in the cgroup hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupOptions {
    /// Cgroup below the spawner's delegated group.
    pub name: Option<String>,
    /// Optional per-session cgroup nested inside `name`.
    pub session: Option<String>,
    /// Extended attributes set on the `name` cgroup.
    pub xattrs: Vec<(String, String)>,
    /// Controller settings written to the `name` cgroup.
    pub set: Vec<(String, String)>,
}

impl CgroupOptions {
    /// Creates options for cgroup `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Returns `true` if a cgroup is requested.
    #[must_use]
    pub const fn is_defined(&self) -> bool {
        self.name.is_some()
    }

    /// Rejects a session, settings or attributes without a cgroup name.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Config`] naming the orphaned field.
    pub fn check(&self) -> Result<()> {
        if self.is_defined() {
            return Ok(());
        }
        let orphan = if self.session.is_some() {
            "a cgroup session"
        } else if !self.set.is_empty() {
            "cgroup settings"
        } else if !self.xattrs.is_empty() {
            "cgroup attributes"
        } else {
            return Ok(());
        };
        Err(SpawnError::Config {
            message: format!("{orphan} without a cgroup name"),
        })
    }

    /// Adds a controller setting.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set.push((name.into(), value.into()));
    }

    /// Adds an extended attribute.
    pub fn set_xattr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.xattrs.push((name.into(), value.into()));
    }

    /// Creates (or reuses) the cgroup and returns an `O_PATH` descriptor
    /// suitable for `CLONE_INTO_CGROUP`.
    ///
    /// Calling this again for an existing cgroup succeeds and reapplies
    /// the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if cgroups are disabled, the name is invalid, or a
    /// directory, attribute or setting cannot be written.
    pub fn create2(&self, state: &CgroupState) -> Result<OwnedFd> {
        let name = self.name.as_deref().ok_or_else(|| SpawnError::Config {
            message: "no cgroup name".into(),
        })?;
        let group = state.group_fd().ok_or_else(disabled)?;
        validate_relative(name)?;

        let mut path = String::new();
        for component in name.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(component);
            make_dir(group, &path)?;
        }
        let fd = state.open(name)?;

        if !self.xattrs.is_empty() {
            // fsetxattr() refuses O_PATH descriptors
            let c_path = c_name(name)?;
            let dir = sys::openat(Some(group), &c_path, libc::O_RDONLY | libc::O_DIRECTORY, 0)
                .map_err(|e| io_error(state, name, e))?;
            for (key, value) in &self.xattrs {
                sys::fsetxattr(dir.as_fd(), &c_name(key)?, value.as_bytes()).map_err(|e| SpawnError::Os {
                    operation: "fsetxattr",
                    source: e,
                })?;
            }
        }

        for (setting, value) in &self.set {
            let setting = remap_setting(setting);
            validate_setting(setting)?;
            write_file_at(fd.as_fd(), setting, value.as_bytes())
                .map_err(|e| io_error(state, &format!("{name}/{setting}"), e))?;
        }

        let Some(session) = self.session.as_deref() else {
            tracing::debug!(cgroup = name, "cgroup ready");
            return Ok(fd);
        };
        if session.is_empty() || session.contains('/') || session == "." || session == ".." {
            return Err(SpawnError::Config {
                message: format!("invalid cgroup session: {session:?}"),
            });
        }
        make_dir(fd.as_fd(), session)?;
        let session_fd = state.open(&format!("{name}/{session}"))?;
        tracing::debug!(cgroup = name, session, "cgroup ready");
        Ok(session_fd)
    }
}

/// Maps legacy cgroup v1 setting names to their v2 equivalent.
fn remap_setting(name: &str) -> &str {
    match name {
        "memory.limit_in_bytes" => "memory.max",
        other => other,
    }
}

fn validate_setting(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with("cgroup.") || !name.contains('.') {
        return Err(SpawnError::Config {
            message: format!("invalid cgroup setting: {name:?}"),
        });
    }
    Ok(())
}

fn validate_relative(name: &str) -> Result<()> {
    let path = Path::new(name);
    if name.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(SpawnError::Config {
            message: format!("invalid cgroup name: {name:?}"),
        });
    }
    Ok(())
}

fn make_dir(dir: BorrowedFd<'_>, name: &str) -> Result<()> {
    match sys::mkdirat(Some(dir), &c_name(name)?, 0o777) {
        Err(e) if e.raw_os_error() != Some(libc::EEXIST) => Err(SpawnError::Io {
            path: name.into(),
            source: e,
        }),
        _ => Ok(()),
    }
}
