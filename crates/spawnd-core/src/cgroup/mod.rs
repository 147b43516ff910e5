//! Cgroup v2 management.
//!
//! [`CgroupState`] is the spawner's view of its own delegated cgroup,
//! discovered once at startup. [`CgroupOptions`] describes the sub-cgroup
//! a child is created in.

pub mod controllers;
pub mod events;
pub mod options;

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use spawnd_common::constants::CGROUP_V2_PATH;
use spawnd_common::error::{Result, SpawnError};

pub use self::options::CgroupOptions;
use crate::sys;

/// The spawner's delegated cgroup.
///
/// Either disabled (no path, no descriptor) or fully enabled; never
/// changes after construction.
#[derive(Debug, Default)]
pub struct CgroupState {
    group_path: String,
    group_fd: Option<OwnedFd>,
    mount_path: PathBuf,
    cgroup_kill: bool,
}

impl CgroupState {
    /// Discovers the cgroup of `pid` (or the calling process).
    ///
    /// Returns a disabled state if the process is not in a cgroup v2
    /// hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/<pid>/cgroup` cannot be read or the
    /// cgroup directory cannot be opened.
    pub fn from_process(pid: Option<libc::pid_t>) -> Result<Self> {
        let path = pid.map_or_else(
            || PathBuf::from("/proc/self/cgroup"),
            |pid| PathBuf::from(format!("/proc/{pid}/cgroup")),
        );
        let text = std::fs::read_to_string(&path).map_err(|e| SpawnError::Io {
            path: path.clone(),
            source: e,
        })?;
        match parse_proc_cgroup(&text) {
            Some(group) => Self::from_group(CGROUP_V2_PATH, &group),
            None => {
                tracing::debug!("no cgroup v2 membership, cgroups disabled");
                Ok(Self::default())
            }
        }
    }

    /// Opens `group_path` below the cgroup2 mount at `mount_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened.
    pub fn from_group(mount_path: impl Into<PathBuf>, group_path: &str) -> Result<Self> {
        let mount_path = mount_path.into();
        let directory = mount_path.join(group_path.trim_start_matches('/'));
        let fd = open_path_dir(None, &directory)?;
        let cgroup_kill = sys::file_type_at(Some(fd.as_fd()), c"cgroup.kill").is_ok_and(|t| t == libc::S_IFREG);
        tracing::info!(group = group_path, cgroup_kill, "using delegated cgroup");
        Ok(Self {
            group_path: group_path.to_owned(),
            group_fd: Some(fd),
            mount_path,
            cgroup_kill,
        })
    }

    /// Returns `true` if the spawner manages cgroups.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.group_fd.is_some()
    }

    /// Path of the group relative to the cgroup2 mount, starting with `/`.
    #[must_use]
    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    /// `O_PATH` descriptor of the group directory.
    #[must_use]
    pub fn group_fd(&self) -> Option<BorrowedFd<'_>> {
        self.group_fd.as_ref().map(AsFd::as_fd)
    }

    /// Where cgroup2 is mounted.
    #[must_use]
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Returns `true` if the kernel supports `cgroup.kill`.
    #[must_use]
    pub const fn supports_kill(&self) -> bool {
        self.cgroup_kill
    }

    /// Absolute path of a cgroup below the delegated group.
    #[must_use]
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.mount_path
            .join(self.group_path.trim_start_matches('/'))
            .join(relative)
    }

    /// Opens a cgroup below the delegated group as `O_PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if cgroups are disabled or the directory is missing.
    pub fn open(&self, relative: &str) -> Result<OwnedFd> {
        let group = self.group_fd().ok_or_else(disabled)?;
        open_path_dir(Some(group), Path::new(relative))
    }
}

/// Extracts the unified hierarchy path from `/proc/<pid>/cgroup`.
///
/// Returns `None` if there is no cgroup v2 line or its path is empty.
#[must_use]
pub fn parse_proc_cgroup(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("0::"))
        .find(|path| !path.is_empty())
        .map(str::to_owned)
}

pub(crate) fn disabled() -> SpawnError {
    SpawnError::Config {
        message: "cgroups are not available".into(),
    }
}

pub(crate) fn io_error(state: &CgroupState, relative: &str, source: io::Error) -> SpawnError {
    SpawnError::Io {
        path: state.absolute_path(relative),
        source,
    }
}

pub(crate) fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| SpawnError::Config {
        message: format!("cgroup name contains a NUL byte: {name:?}"),
    })
}

fn open_path_dir(dir: Option<BorrowedFd<'_>>, path: &Path) -> Result<OwnedFd> {
    let c_path = crate::filesystem::plan::c_path(path)?;
    sys::openat(dir, &c_path, libc::O_PATH | libc::O_DIRECTORY, 0).map_err(|e| SpawnError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Writes `value` to the control file `name` below `dir`.
///
/// # Errors
///
/// Returns the OS error if the file cannot be opened or written.
pub fn write_file_at(dir: BorrowedFd<'_>, name: &str, value: &[u8]) -> io::Result<()> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = sys::openat(Some(dir), &c_name, libc::O_WRONLY | libc::O_TRUNC | libc::O_NOCTTY, 0)?;
    sys::write_all(std::os::fd::AsRawFd::as_raw_fd(&fd), value)
}

/// Reads the control file `name` below `dir`.
///
/// # Errors
///
/// Returns the OS error if the file cannot be opened or read.
pub fn read_file_at(dir: BorrowedFd<'_>, name: &str) -> io::Result<String> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = sys::openat(Some(dir), &c_name, libc::O_RDONLY | libc::O_NOCTTY, 0)?;
    io::read_to_string(std::fs::File::from(fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unified_line() {
        let text = "1:name=systemd:/system.slice/web.service\n0::/system.slice/web.service\n";
        assert_eq!(parse_proc_cgroup(text).as_deref(), Some("/system.slice/web.service"));
    }

    #[test]
    fn no_unified_line_means_disabled() {
        assert_eq!(parse_proc_cgroup("4:memory:/foo\n"), None);
        assert_eq!(parse_proc_cgroup("0::\n"), None);
    }

    #[test]
    fn opens_fake_hierarchy() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join("web")).expect("mkdir");
        std::fs::write(root.path().join("web/cgroup.kill"), "").expect("write");
        let state = CgroupState::from_group(root.path(), "/web").expect("state");
        assert!(state.is_enabled());
        assert!(state.supports_kill());
        assert_eq!(state.absolute_path("child"), root.path().join("web/child"));
    }

    #[test]
    fn default_state_is_disabled() {
        let state = CgroupState::default();
        assert!(!state.is_enabled());
        assert!(state.group_fd().is_none());
        assert!(state.open("x").is_err());
    }

    #[test]
    fn reads_and_writes_control_files() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join("memory.max"), "max\n").expect("write");
        let state = CgroupState::from_group(root.path(), "/").expect("state");
        let fd = state.group_fd().expect("enabled");
        assert_eq!(read_file_at(fd, "memory.max").expect("read"), "max\n");
        write_file_at(fd, "memory.max", b"1048576").expect("write");
        assert_eq!(read_file_at(fd, "memory.max").expect("read"), "1048576");
    }
}
