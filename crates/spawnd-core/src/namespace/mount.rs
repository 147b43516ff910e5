//! Mount namespace description.
//!
//! [`MountNamespaceOptions`] says what the child's filesystem view should
//! look like. It is turned into an executable plan by
//! [`crate::filesystem::MountPlan`].

use std::os::fd::OwnedFd;
use std::path::PathBuf;

/// Per-mount flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountFlags {
    /// Leave the mount writable.
    pub writable: bool,
    /// Allow executing files from the mount.
    pub exec: bool,
    /// Skip the mount silently if the source does not exist.
    pub optional: bool,
}

impl MountFlags {
    const WRITABLE: u8 = 0x1;
    const EXEC: u8 = 0x2;
    const OPTIONAL: u8 = 0x4;

    /// Packs the flags into their wire representation.
    #[must_use]
    pub const fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.writable {
            bits |= Self::WRITABLE;
        }
        if self.exec {
            bits |= Self::EXEC;
        }
        if self.optional {
            bits |= Self::OPTIONAL;
        }
        bits
    }

    /// Unpacks flags, returning `None` for unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !(Self::WRITABLE | Self::EXEC | Self::OPTIONAL) != 0 {
            return None;
        }
        Some(Self {
            writable: bits & Self::WRITABLE != 0,
            exec: bits & Self::EXEC != 0,
            optional: bits & Self::OPTIONAL != 0,
        })
    }
}

/// What a [`Mount`] entry puts at its target.
#[derive(Debug)]
pub enum MountKind {
    /// Bind mount a directory.
    Bind {
        /// Host path of the directory.
        source: PathBuf,
    },
    /// Bind mount a single regular file.
    BindFile {
        /// Host path of the file.
        source: PathBuf,
    },
    /// Bind mount the directory behind an open descriptor.
    BindFd {
        /// Descriptor of the directory.
        fd: OwnedFd,
    },
    /// Bind mount the regular file behind an open descriptor.
    BindFdFile {
        /// Descriptor of the file.
        fd: OwnedFd,
    },
    /// Mount a fresh private tmpfs.
    Tmpfs,
    /// Mount a tmpfs shared by name between children.
    NamedTmpfs {
        /// Registry name.
        name: String,
    },
    /// Create a file with the given contents.
    WriteFile {
        /// File contents.
        contents: String,
    },
    /// Create a symbolic link at the target.
    Symlink {
        /// Where the link points.
        link_target: PathBuf,
    },
}

/// One entry in [`MountNamespaceOptions::mounts`].
#[derive(Debug)]
pub struct Mount {
    /// What to mount.
    pub kind: MountKind,
    /// Absolute path inside the child's new root.
    pub target: PathBuf,
    /// Mount options.
    pub flags: MountFlags,
}

impl Mount {
    /// Creates a mount entry.
    #[must_use]
    pub fn new(kind: MountKind, target: impl Into<PathBuf>, flags: MountFlags) -> Self {
        Self {
            kind,
            target: target.into(),
            flags,
        }
    }
}

/// Description of the child's mount namespace.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default)]
pub struct MountNamespaceOptions {
    /// Create a mount namespace even if nothing else asks for one.
    pub enable: bool,
    /// Switch to this directory as the new root.
    pub pivot_root: Option<PathBuf>,
    /// Use an empty tmpfs as the new root.
    pub mount_root_tmpfs: bool,
    /// Mount a new `/proc`.
    pub mount_proc: bool,
    /// Leave `/proc` writable.
    pub writable_proc: bool,
    /// Bind mount the host `/dev`.
    pub mount_dev: bool,
    /// Mount a new `devpts` instance on `/dev/pts`.
    pub mount_pts: bool,
    /// Bind mount the host `/dev/pts`.
    pub bind_mount_pts: bool,
    /// Mount a tmpfs on `/tmp` with these options.
    pub mount_tmp_tmpfs: Option<String>,
    /// Additional mounts, applied in order.
    pub mounts: Vec<Mount>,
}

impl MountNamespaceOptions {
    /// Returns `true` if the child needs its own mount namespace.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enable
            || self.pivot_root.is_some()
            || self.mount_root_tmpfs
            || self.mount_proc
            || self.mount_dev
            || self.mount_pts
            || self.bind_mount_pts
            || self.mount_tmp_tmpfs.is_some()
            || !self.mounts.is_empty()
    }

    /// Returns `true` if the child gets a new root filesystem.
    #[must_use]
    pub const fn has_new_root(&self) -> bool {
        self.pivot_root.is_some() || self.mount_root_tmpfs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_and_reject_unknown_bits() {
        let flags = MountFlags {
            writable: true,
            exec: false,
            optional: true,
        };
        assert_eq!(flags.to_bits(), 0x5);
        assert_eq!(MountFlags::from_bits(0x5), Some(flags));
        assert_eq!(MountFlags::from_bits(0x80), None);
    }

    #[test]
    fn any_mount_enables_namespace() {
        let mut options = MountNamespaceOptions::default();
        assert!(!options.is_enabled());
        options
            .mounts
            .push(Mount::new(MountKind::Tmpfs, "/scratch", MountFlags::default()));
        assert!(options.is_enabled());
        assert!(!options.has_new_root());
    }
}
