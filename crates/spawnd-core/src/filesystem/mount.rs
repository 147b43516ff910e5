//! Mount operations executed by the child.
//!
//! A [`MountOp`] carries everything it needs as prepared C strings and
//! descriptors, so executing it between `clone3()` and `execve()` never
//! allocates.

use std::ffi::{CStr, CString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};

use super::pivot_root;
use crate::setup::{SetupContext, SetupError};
use crate::sys;

/// One step of building the child's filesystem.
#[derive(Debug)]
pub enum MountOp {
    /// Stop mount propagation back into the parent namespace.
    MakePrivate,
    /// `mkdir` with mode 0755; an existing directory is fine.
    MakeDir {
        /// Directory path.
        path: CString,
    },
    /// Fail with "not writable" unless `path` is a directory.
    RequireDir {
        /// Directory path.
        path: CString,
    },
    /// Create an empty regular file as a bind mount target.
    MakeFile {
        /// File path.
        path: CString,
    },
    /// Mount a new filesystem instance (tmpfs, proc, devpts).
    Filesystem {
        /// Filesystem type.
        fstype: &'static CStr,
        /// Mount point.
        target: CString,
        /// Mount flags.
        flags: MsFlags,
        /// Filesystem options.
        data: Option<CString>,
    },
    /// Bind mount a path, then remount with `remount` flags.
    Bind {
        /// Source path, as seen at the time of the operation.
        source: CString,
        /// Mount point.
        target: CString,
        /// Include submounts.
        recursive: bool,
        /// Per-mount flags applied by a bind remount.
        remount: MsFlags,
        /// Skip silently if the source is missing.
        optional: bool,
    },
    /// Attach a clone of the mount tree behind `fd`.
    BindFd {
        /// Directory or file descriptor.
        fd: OwnedFd,
        /// Mount point.
        target: CString,
        /// Include submounts.
        recursive: bool,
        /// Per-mount flags applied by a bind remount.
        remount: MsFlags,
    },
    /// `chdir`.
    ChangeDir {
        /// New working directory.
        path: CString,
    },
    /// Make the working directory the new root, moving the old one to
    /// `put_old`.
    PivotRoot {
        /// Old root location relative to the new root.
        put_old: CString,
    },
    /// Create a new file with `contents`.
    CreateFile {
        /// File path.
        path: CString,
        /// File contents.
        contents: Vec<u8>,
    },
    /// Create a symbolic link.
    Symlink {
        /// Where the link points.
        target: CString,
        /// Path of the link.
        link_path: CString,
    },
    /// Lazily unmount the old root.
    DetachOldRoot {
        /// Old root location.
        path: CString,
    },
    /// Remount a bind-capable mount read-only.
    RemountReadOnly {
        /// Mount point.
        path: CString,
    },
}

impl MountOp {
    /// Executes the operation.
    ///
    /// # Errors
    ///
    /// Returns the failed step.
    pub fn execute(&self) -> Result<(), SetupError<'_>> {
        match self {
            Self::MakePrivate => mount(
                None::<&CStr>,
                c"/",
                None::<&CStr>,
                MsFlags::MS_PRIVATE | MsFlags::MS_REC,
                None::<&CStr>,
            )
            .setup("make / private"),
            Self::MakeDir { path } => match sys::mkdirat(None, path, 0o755) {
                Err(e) if e.raw_os_error() != Some(libc::EEXIST) => Err(SetupError::os("mkdir", Some(path.as_c_str()), &e)),
                _ => Ok(()),
            },
            Self::RequireDir { path } => match sys::file_type_at(None, path) {
                Ok(libc::S_IFDIR) => Ok(()),
                _ => Err(SetupError::with_detail("not writable", path)),
            },
            Self::MakeFile { path } => {
                match sys::openat(None, path, libc::O_CREAT | libc::O_WRONLY | libc::O_NOCTTY, 0o444) {
                    Ok(_) => Ok(()),
                    Err(e) => Err(SetupError::os("create mount point", Some(path.as_c_str()), &e)),
                }
            }
            Self::Filesystem {
                fstype,
                target,
                flags,
                data,
            } => mount(Some(*fstype), target.as_c_str(), Some(*fstype), *flags, data.as_deref())
                .setup_at("mount", target),
            Self::Bind {
                source,
                target,
                recursive,
                remount,
                optional,
            } => {
                let mut flags = MsFlags::MS_BIND;
                if *recursive {
                    flags |= MsFlags::MS_REC;
                }
                match mount(Some(source.as_c_str()), target.as_c_str(), None::<&CStr>, flags, None::<&CStr>) {
                    Err(Errno::ENOENT) if *optional => Ok(()),
                    Err(e) => Err(SetupError::errno("bind mount", Some(source.as_c_str()), e)),
                    Ok(()) => remount_bind(target, *remount),
                }
            }
            Self::BindFd {
                fd,
                target,
                recursive,
                remount,
            } => {
                let tree = sys::open_tree_clone(fd.as_fd(), *recursive).setup("open_tree")?;
                sys::move_mount(tree.as_fd(), target).setup_at("move_mount", target)?;
                remount_bind(target, *remount)
            }
            Self::ChangeDir { path } => nix::unistd::chdir(path.as_c_str()).setup_at("chdir", path),
            Self::PivotRoot { put_old } => pivot_root::pivot_into_cwd(put_old),
            Self::CreateFile { path, contents } => create_file(path, contents),
            Self::Symlink { target, link_path } => sys::symlink(target, link_path).setup_at("symlink", link_path),
            Self::DetachOldRoot { path } => pivot_root::detach_old_root(path),
            Self::RemountReadOnly { path } => remount_bind(path, MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
        }
    }
}

fn remount_bind(target: &CStr, flags: MsFlags) -> Result<(), SetupError<'_>> {
    if flags.is_empty() {
        return Ok(());
    }
    mount(
        None::<&CStr>,
        target,
        None::<&CStr>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | flags,
        None::<&CStr>,
    )
    .setup_at("remount", target)
}

fn create_file<'a>(path: &'a CStr, contents: &[u8]) -> Result<(), SetupError<'a>> {
    let fd = sys::openat(
        None,
        path,
        libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY | libc::O_NOCTTY,
        0o644,
    )
    .setup_at("create file", path)?;
    sys::write_all(fd.as_raw_fd(), contents).setup_at("write file", path)
}

/// Mount flags for a bind mount's read-only/noexec remount.
#[must_use]
pub fn bind_remount_flags(writable: bool, exec: bool) -> MsFlags {
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }
    if !exec {
        flags |= MsFlags::MS_NOEXEC;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_noexec_by_default() {
        let flags = bind_remount_flags(false, false);
        assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID));
        let flags = bind_remount_flags(true, true);
        assert!(!flags.intersects(MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC));
    }

    #[test]
    fn make_dir_tolerates_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = CString::new(dir.path().join("sub").to_string_lossy().as_bytes()).expect("path");
        let op = MountOp::MakeDir { path };
        op.execute().expect("first mkdir");
        op.execute().expect("second mkdir");
    }

    #[test]
    fn require_dir_reports_not_writable() {
        let op = MountOp::RequireDir {
            path: CString::from(c"/nonexistent/spawnd/test"),
        };
        let err = op.execute().expect_err("missing dir");
        assert_eq!(err.to_string(), "not writable '/nonexistent/spawnd/test'");
    }

    #[test]
    fn create_file_writes_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("hosts");
        let op = MountOp::CreateFile {
            path: CString::new(file.to_string_lossy().as_bytes()).expect("path"),
            contents: b"127.0.0.1 localhost\n".to_vec(),
        };
        op.execute().expect("create");
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "127.0.0.1 localhost\n");
        assert!(op.execute().is_err());
    }

    #[test]
    fn symlink_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("link");
        let op = MountOp::Symlink {
            target: CString::from(c"/usr/bin"),
            link_path: CString::new(link.to_string_lossy().as_bytes()).expect("path"),
        };
        op.execute().expect("symlink");
        assert_eq!(std::fs::read_link(&link).expect("readlink"), std::path::PathBuf::from("/usr/bin"));
    }
}
