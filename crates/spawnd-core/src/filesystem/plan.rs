//! Turns [`MountNamespaceOptions`] into an ordered list of [`MountOp`]s.
//!
//! The plan is computed in the parent before `clone3()`, so ordering
//! mistakes ("not writable", "would hide") are reported without forking
//! and the child only replays prepared steps.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use spawnd_common::error::{Result, SpawnError};

use super::mount::{MountOp, bind_remount_flags};
use super::vfs::{DirStep, VfsBuilder};
use crate::namespace::mount::{Mount, MountKind, MountNamespaceOptions};
use crate::setup::SetupError;
use crate::sys;

/// Where the old root stays reachable until the plan has finished.
const OLD_ROOT: &str = "/mnt";

const ROOT_TMPFS_OPTIONS: &str = "size=16M,nr_inodes=256,mode=755";
const TMP_TMPFS_OPTIONS: &str = "size=16M,nr_inodes=256,mode=1777";
const TMPFS_OPTIONS: &str = "size=16M,nr_inodes=65536,mode=1777";
const DEVPTS_OPTIONS: &str = "newinstance,ptmxmode=0666,mode=0620";

/// Resolves a named tmpfs to the directory it is mounted on.
pub trait NamedTmpfsResolver {
    /// Returns the host path of the named tmpfs, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the tmpfs cannot be created.
    fn resolve(&self, name: &str) -> Result<PathBuf>;
}

/// The prepared mount sequence for one child.
#[derive(Debug, Default)]
pub struct MountPlan {
    ops: Vec<MountOp>,
    /// Descriptors referenced by path (`/proc/self/fd/N`) from `ops`.
    keep_alive: Vec<OwnedFd>,
}

impl MountPlan {
    /// Builds the plan for `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mounts cannot be ordered into a valid
    /// filesystem or a path is malformed.
    pub fn build(options: MountNamespaceOptions, named_tmpfs: Option<&dyn NamedTmpfsResolver>) -> Result<Self> {
        if !options.is_enabled() {
            return Ok(Self::default());
        }
        let mut planner = Planner::default();
        planner.root(&options)?;
        planner.special_filesystems(&options)?;
        let has_proc = options.mount_proc || !options.has_new_root();
        for mount in options.mounts {
            planner.mount(mount, has_proc, named_tmpfs)?;
        }
        planner.finish(options.mount_root_tmpfs && options.pivot_root.is_none());
        tracing::debug!(ops = planner.plan.ops.len(), "built mount plan");
        Ok(planner.plan)
    }

    /// Returns `true` if the child keeps the parent's mount namespace.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations in execution order.
    #[must_use]
    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    /// Runs all operations in the child.
    ///
    /// # Errors
    ///
    /// Returns the first failed step.
    pub fn execute(&self) -> std::result::Result<(), SetupError<'_>> {
        self.ops.iter().try_for_each(MountOp::execute)
    }
}

#[derive(Debug, Default)]
struct Planner {
    plan: MountPlan,
    vfs: VfsBuilder,
    old_root: Option<PathBuf>,
}

impl Planner {
    fn push(&mut self, op: MountOp) {
        self.plan.ops.push(op);
    }

    fn root(&mut self, options: &MountNamespaceOptions) -> Result<()> {
        self.push(MountOp::MakePrivate);
        if let Some(root) = &options.pivot_root {
            let root_c = c_path(root)?;
            self.push(MountOp::Bind {
                source: root_c.clone(),
                target: root_c.clone(),
                recursive: true,
                remount: MsFlags::empty(),
                optional: false,
            });
            self.push(MountOp::ChangeDir { path: root_c });
            self.push(MountOp::RequireDir { path: c"mnt".into() });
            self.push(MountOp::PivotRoot { put_old: c"mnt".into() });
            self.old_root = Some(PathBuf::from(OLD_ROOT));
            self.vfs.add("/", false, Some(root.clone()))?;
        } else if options.mount_root_tmpfs {
            self.push(MountOp::Filesystem {
                fstype: c"tmpfs",
                target: c_path(Path::new(OLD_ROOT))?,
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                data: Some(c_str(ROOT_TMPFS_OPTIONS)?),
            });
            self.push(MountOp::ChangeDir {
                path: c_path(Path::new(OLD_ROOT))?,
            });
            self.push(MountOp::MakeDir { path: c"mnt".into() });
            self.push(MountOp::PivotRoot { put_old: c"mnt".into() });
            self.old_root = Some(PathBuf::from(OLD_ROOT));
            self.vfs.add("/", true, None)?;
        } else {
            self.vfs.add("/", false, Some(PathBuf::from("/")))?;
        }
        Ok(())
    }

    fn special_filesystems(&mut self, options: &MountNamespaceOptions) -> Result<()> {
        if options.mount_proc {
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
            if !options.writable_proc {
                flags |= MsFlags::MS_RDONLY;
            }
            self.filesystem(c"proc", Path::new("/proc"), flags, None, false)?;
        }

        if options.mount_dev {
            self.mkdir(Path::new("/dev"))?;
            self.push(MountOp::Bind {
                source: self.source(Path::new("/dev"))?,
                target: c"/dev".into(),
                recursive: true,
                remount: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                optional: false,
            });
            self.vfs.add("/dev", false, Some(PathBuf::from("/dev")))?;
        }

        if options.mount_pts {
            self.filesystem(
                c"devpts",
                Path::new("/dev/pts"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some(DEVPTS_OPTIONS),
                false,
            )?;
        } else if options.bind_mount_pts {
            self.mkdir(Path::new("/dev/pts"))?;
            self.push(MountOp::Bind {
                source: self.source(Path::new("/dev/pts"))?,
                target: c"/dev/pts".into(),
                recursive: false,
                remount: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                optional: false,
            });
            self.vfs.add("/dev/pts", false, None)?;
        }

        if let Some(extra) = &options.mount_tmp_tmpfs {
            let data = if extra.is_empty() {
                TMP_TMPFS_OPTIONS.to_owned()
            } else {
                format!("{TMP_TMPFS_OPTIONS},{extra}")
            };
            self.filesystem(
                c"tmpfs",
                Path::new("/tmp"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                Some(&data),
                true,
            )?;
        }
        Ok(())
    }

    fn filesystem(
        &mut self,
        fstype: &'static std::ffi::CStr,
        target: &Path,
        flags: MsFlags,
        data: Option<&str>,
        writable: bool,
    ) -> Result<()> {
        self.mkdir(target)?;
        self.push(MountOp::Filesystem {
            fstype,
            target: c_path(target)?,
            flags,
            data: data.map(c_str).transpose()?,
        });
        self.vfs.add(target, writable, None)
    }

    fn mount(&mut self, mount: Mount, has_proc: bool, named_tmpfs: Option<&dyn NamedTmpfsResolver>) -> Result<()> {
        let Mount { kind, target, flags } = mount;
        if let Some(old_root) = &self.old_root {
            if target.starts_with(old_root) {
                return Err(SpawnError::Config {
                    message: format!("mount target {} is reserved", target.display()),
                });
            }
        }
        let remount = bind_remount_flags(flags.writable, flags.exec);

        match kind {
            MountKind::Bind { source } => {
                if flags.optional && !source.exists() {
                    tracing::debug!(source = %source.display(), "skipping optional bind mount");
                    return Ok(());
                }
                self.bind(&source, &target, remount, flags.optional)?;
                self.vfs.add(target, flags.writable, Some(source))
            }
            MountKind::NamedTmpfs { name } => {
                let resolver = named_tmpfs.ok_or_else(|| SpawnError::Config {
                    message: format!("named tmpfs {name:?} is not available here"),
                })?;
                let source = resolver.resolve(&name)?;
                self.bind(&source, &target, remount, false)?;
                self.vfs.add(target, flags.writable, None)
            }
            MountKind::BindFile { source } => {
                if flags.optional && !source.is_file() {
                    tracing::debug!(source = %source.display(), "skipping optional file bind mount");
                    return Ok(());
                }
                self.file_mount_point(&target)?;
                self.push(MountOp::Bind {
                    source: self.source(&source)?,
                    target: c_path(&target)?,
                    recursive: false,
                    remount,
                    optional: flags.optional,
                });
                self.vfs.add(target, flags.writable, None)
            }
            MountKind::BindFd { fd } => {
                self.mkdir(&target)?;
                self.push(MountOp::BindFd {
                    fd,
                    target: c_path(&target)?,
                    recursive: true,
                    remount,
                });
                self.vfs.add(target, flags.writable, None)
            }
            MountKind::BindFdFile { fd } => {
                self.file_mount_point(&target)?;
                self.push(MountOp::BindFd {
                    fd,
                    target: c_path(&target)?,
                    recursive: false,
                    remount,
                });
                self.vfs.add(target, flags.writable, None)
            }
            MountKind::Tmpfs => {
                let mut mount_flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                if !flags.exec {
                    mount_flags |= MsFlags::MS_NOEXEC;
                }
                if !flags.writable {
                    mount_flags |= MsFlags::MS_RDONLY;
                }
                self.filesystem(c"tmpfs", &target, mount_flags, Some(TMPFS_OPTIONS), flags.writable)
            }
            MountKind::WriteFile { contents } => self.write_file(&target, contents, has_proc),
            MountKind::Symlink { link_target } => {
                let parent = parent_of(&target)?;
                self.mkdir(parent)?;
                if !self.vfs.is_writable(parent) {
                    return Err(not_writable(parent));
                }
                self.push(MountOp::Symlink {
                    target: c_path(&link_target)?,
                    link_path: c_path(&target)?,
                });
                Ok(())
            }
        }
    }

    fn bind(&mut self, source: &Path, target: &Path, remount: MsFlags, optional: bool) -> Result<()> {
        self.mkdir(target)?;
        self.push(MountOp::Bind {
            source: self.source(source)?,
            target: c_path(target)?,
            recursive: true,
            remount,
            optional,
        });
        Ok(())
    }

    fn write_file(&mut self, target: &Path, contents: String, has_proc: bool) -> Result<()> {
        let parent = parent_of(target)?;
        self.mkdir(parent)?;
        if self.vfs.is_writable(parent) {
            self.push(MountOp::CreateFile {
                path: c_path(target)?,
                contents: contents.into_bytes(),
            });
            return Ok(());
        }

        if !has_proc {
            return Err(SpawnError::Config {
                message: format!("writing {} into a read-only directory requires /proc", target.display()),
            });
        }
        let memfd = sys::memfd_create(c"write-file").map_err(|e| SpawnError::Os {
            operation: "memfd_create",
            source: e,
        })?;
        sys::write_all(memfd.as_raw_fd(), contents.as_bytes()).map_err(|e| SpawnError::Os {
            operation: "write memfd",
            source: e,
        })?;
        self.push(MountOp::Bind {
            source: c_str(&format!("/proc/self/fd/{}", memfd.as_raw_fd()))?,
            target: c_path(target)?,
            recursive: false,
            remount: bind_remount_flags(false, false),
            optional: false,
        });
        self.plan.keep_alive.push(memfd);
        Ok(())
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        for step in self.vfs.mkdir(path)? {
            let op = match step {
                DirStep::Make(dir) => MountOp::MakeDir { path: c_path(&dir)? },
                DirStep::Require(dir) => MountOp::RequireDir { path: c_path(&dir)? },
            };
            self.push(op);
        }
        Ok(())
    }

    fn file_mount_point(&mut self, target: &Path) -> Result<()> {
        let parent = parent_of(target)?;
        self.mkdir(parent)?;
        if self.vfs.is_writable(parent) {
            self.push(MountOp::MakeFile { path: c_path(target)? });
        }
        Ok(())
    }

    /// Host path of `source` as the child sees it during the plan.
    fn source(&self, source: &Path) -> Result<CString> {
        if !source.is_absolute() {
            return Err(SpawnError::Config {
                message: format!("mount source must be absolute: {}", source.display()),
            });
        }
        match (&self.old_root, source.strip_prefix("/")) {
            (Some(old_root), Ok(relative)) => c_path(&old_root.join(relative)),
            _ => c_path(source),
        }
    }

    fn finish(&mut self, root_tmpfs: bool) {
        if self.old_root.take().is_some() {
            self.push(MountOp::DetachOldRoot { path: c"/mnt".into() });
            if root_tmpfs {
                self.push(MountOp::RemountReadOnly { path: c"/".into() });
            }
        }
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent().ok_or_else(|| SpawnError::Config {
        message: format!("{} has no parent directory", path.display()),
    })
}

fn not_writable(path: &Path) -> SpawnError {
    SpawnError::ChildSetup {
        message: format!("not writable: {}", path.display()),
    }
}

/// Converts a path into a C string.
///
/// # Errors
///
/// Returns an error if the path contains a NUL byte.
pub fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| SpawnError::Config {
        message: format!("path contains a NUL byte: {}", path.display()),
    })
}

fn c_str(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| SpawnError::Config {
        message: format!("value contains a NUL byte: {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::mount::MountFlags;

    struct FixedResolver(PathBuf);

    impl NamedTmpfsResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Result<PathBuf> {
            Ok(self.0.join(name))
        }
    }

    fn bind_sources(plan: &MountPlan) -> Vec<String> {
        plan.ops()
            .iter()
            .filter_map(|op| match op {
                MountOp::Bind { source, .. } => Some(source.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    fn writable() -> MountFlags {
        MountFlags {
            writable: true,
            ..MountFlags::default()
        }
    }

    #[test]
    fn disabled_namespace_has_empty_plan() {
        let plan = MountPlan::build(MountNamespaceOptions::default(), None).expect("plan");
        assert!(plan.is_empty());
    }

    #[test]
    fn root_tmpfs_pivots_and_cleans_up() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mount_proc: true,
            mounts: vec![Mount::new(
                MountKind::Bind {
                    source: PathBuf::from("/usr"),
                },
                "/usr",
                MountFlags::default(),
            )],
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, None).expect("plan");
        let ops = plan.ops();
        assert!(matches!(ops.first(), Some(MountOp::MakePrivate)));
        assert!(ops.iter().any(|op| matches!(op, MountOp::PivotRoot { .. })));
        assert!(matches!(ops.last(), Some(MountOp::RemountReadOnly { .. })));
        assert!(matches!(ops.get(ops.len() - 2), Some(MountOp::DetachOldRoot { .. })));
        assert_eq!(bind_sources(&plan), vec!["/mnt/usr".to_owned()]);
    }

    #[test]
    fn proc_is_read_only_unless_requested() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mount_proc: true,
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, None).expect("plan");
        let proc_flags = plan.ops().iter().find_map(|op| match op {
            MountOp::Filesystem { fstype, flags, .. } if *fstype == c"proc" => Some(*flags),
            _ => None,
        });
        assert!(proc_flags.is_some_and(|f| f.contains(MsFlags::MS_RDONLY)));
    }

    #[test]
    fn nested_mount_in_wrong_order_fails() {
        let host = tempfile::tempdir().expect("tempdir");
        let options = MountNamespaceOptions {
            pivot_root: Some(host.path().to_path_buf()),
            mounts: vec![
                Mount::new(MountKind::Tmpfs, "/data/cache", writable()),
                Mount::new(MountKind::Tmpfs, "/data", writable()),
            ],
            ..MountNamespaceOptions::default()
        };
        let err = MountPlan::build(options, None).expect_err("must fail");
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn nested_mount_in_right_order_succeeds() {
        let host = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(host.path().join("data")).expect("mkdir");
        let options = MountNamespaceOptions {
            pivot_root: Some(host.path().to_path_buf()),
            mounts: vec![
                Mount::new(MountKind::Tmpfs, "/data", writable()),
                Mount::new(MountKind::Tmpfs, "/data/cache", writable()),
            ],
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, None).expect("plan");
        assert!(
            plan.ops()
                .iter()
                .any(|op| matches!(op, MountOp::MakeDir { path } if path.as_c_str() == c"/data/cache"))
        );
    }

    #[test]
    fn write_file_into_writable_directory_creates_it() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mounts: vec![Mount::new(
                MountKind::WriteFile {
                    contents: "nameserver 127.0.0.1\n".into(),
                },
                "/etc/resolv.conf",
                MountFlags::default(),
            )],
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, None).expect("plan");
        assert!(plan.ops().iter().any(|op| matches!(op, MountOp::CreateFile { .. })));
    }

    #[test]
    fn write_file_into_read_only_directory_needs_proc() {
        let host = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(host.path().join("etc")).expect("mkdir");
        let options = MountNamespaceOptions {
            pivot_root: Some(host.path().to_path_buf()),
            mounts: vec![Mount::new(
                MountKind::WriteFile {
                    contents: "x".into(),
                },
                "/etc/motd",
                MountFlags::default(),
            )],
            ..MountNamespaceOptions::default()
        };
        assert!(MountPlan::build(options, None).is_err());
    }

    #[test]
    fn symlink_needs_writable_parent() {
        let host = tempfile::tempdir().expect("tempdir");
        let options = MountNamespaceOptions {
            pivot_root: Some(host.path().to_path_buf()),
            mounts: vec![Mount::new(
                MountKind::Symlink {
                    link_target: PathBuf::from("/usr/bin"),
                },
                "/bin",
                MountFlags::default(),
            )],
            ..MountNamespaceOptions::default()
        };
        let err = MountPlan::build(options, None).expect_err("must fail");
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn named_tmpfs_requires_resolver() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mounts: vec![Mount::new(MountKind::NamedTmpfs { name: "shared".into() }, "/shared", writable())],
            ..MountNamespaceOptions::default()
        };
        assert!(MountPlan::build(options, None).is_err());
    }

    #[test]
    fn named_tmpfs_becomes_bind_mount() {
        let resolver = FixedResolver(PathBuf::from("/tmp/named-tmpfs"));
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mounts: vec![Mount::new(MountKind::NamedTmpfs { name: "shared".into() }, "/shared", writable())],
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, Some(&resolver)).expect("plan");
        assert_eq!(bind_sources(&plan), vec!["/mnt/tmp/named-tmpfs/shared".to_owned()]);
    }

    #[test]
    fn optional_bind_with_missing_source_is_skipped() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mounts: vec![Mount::new(
                MountKind::Bind {
                    source: PathBuf::from("/nonexistent/spawnd"),
                },
                "/opt",
                MountFlags {
                    optional: true,
                    ..MountFlags::default()
                },
            )],
            ..MountNamespaceOptions::default()
        };
        let plan = MountPlan::build(options, None).expect("plan");
        assert!(bind_sources(&plan).is_empty());
    }

    #[test]
    fn old_root_location_is_reserved() {
        let options = MountNamespaceOptions {
            mount_root_tmpfs: true,
            mounts: vec![Mount::new(MountKind::Tmpfs, "/mnt/x", writable())],
            ..MountNamespaceOptions::default()
        };
        assert!(MountPlan::build(options, None).is_err());
    }
}
