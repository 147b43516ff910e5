//! Tracks which mount points of a child's new filesystem are writable.
//!
//! Every mount registered here becomes an item; creating a mount point
//! below an item is only possible by `mkdir` if that item is writable.
//! Below a read-only item the directory has to exist already.

use std::path::{Component, Path, PathBuf};

use spawnd_common::error::{Result, SpawnError};

#[derive(Debug)]
struct Item {
    path: PathBuf,
    writable: bool,
    /// Host directory whose contents appear at `path`, when known.
    backing: Option<PathBuf>,
}

/// One step needed to make a directory available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirStep {
    /// Create the directory (an existing one is fine).
    Make(PathBuf),
    /// The directory must already exist.
    Require(PathBuf),
}

/// Registry of the mounts a child's filesystem consists of.
#[derive(Debug, Default)]
pub struct VfsBuilder {
    items: Vec<Item>,
}

impl VfsBuilder {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Registers a mount at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if an earlier mount lies below `path` and would be
    /// hidden by this one.
    pub fn add(&mut self, path: impl Into<PathBuf>, writable: bool, backing: Option<PathBuf>) -> Result<()> {
        let path = path.into();
        check_normalized(&path)?;
        if let Some(hidden) = self
            .items
            .iter()
            .find(|item| item.path != path && item.path.starts_with(&path))
        {
            return Err(SpawnError::ChildSetup {
                message: format!(
                    "mount over {} would hide {}",
                    path.display(),
                    hidden.path.display()
                ),
            });
        }
        self.items.retain(|item| item.path != path);
        self.items.push(Item {
            path,
            writable,
            backing,
        });
        Ok(())
    }

    fn find(&self, path: &Path) -> Option<&Item> {
        self.items
            .iter()
            .filter(|item| path.starts_with(&item.path))
            .max_by_key(|item| item.path.components().count())
    }

    /// Returns `true` if new entries can be created inside directory `dir`.
    #[must_use]
    pub fn is_writable(&self, dir: &Path) -> bool {
        self.find(dir).is_some_and(|item| item.writable)
    }

    /// Returns the steps that make directory `path` available.
    ///
    /// # Errors
    ///
    /// Returns a "not writable" error if `path` is below a read-only mount
    /// whose host directory is known and lacks it.
    pub fn mkdir(&self, path: &Path) -> Result<Vec<DirStep>> {
        check_normalized(path)?;
        let Some(item) = self.find(path) else {
            return Ok(vec![DirStep::Require(path.to_path_buf())]);
        };
        if item.path == path {
            return Ok(Vec::new());
        }
        let Ok(relative) = path.strip_prefix(&item.path) else {
            return Ok(vec![DirStep::Require(path.to_path_buf())]);
        };

        if item.writable {
            let mut current = item.path.clone();
            return Ok(relative
                .components()
                .map(|component| {
                    current.push(component);
                    DirStep::Make(current.clone())
                })
                .collect());
        }

        match &item.backing {
            Some(backing) if !backing.join(relative).is_dir() => Err(SpawnError::ChildSetup {
                message: format!("not writable: {}", path.display()),
            }),
            _ => Ok(vec![DirStep::Require(path.to_path_buf())]),
        }
    }
}

fn check_normalized(path: &Path) -> Result<()> {
    let mut components = path.components();
    let absolute = components.next() == Some(Component::RootDir);
    if absolute && components.all(|c| matches!(c, Component::Normal(_))) {
        Ok(())
    } else {
        Err(SpawnError::Config {
            message: format!("mount path must be absolute and normalized: {}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpfs_root() -> VfsBuilder {
        let mut vfs = VfsBuilder::new();
        vfs.add("/", true, None).expect("root");
        vfs
    }

    #[test]
    fn creates_every_missing_component_in_writable_root() {
        let vfs = tmpfs_root();
        let steps = vfs.mkdir(Path::new("/usr/share")).expect("mkdir");
        assert_eq!(
            steps,
            vec![
                DirStep::Make(PathBuf::from("/usr")),
                DirStep::Make(PathBuf::from("/usr/share")),
            ]
        );
    }

    #[test]
    fn nested_mount_after_writable_parent_succeeds() {
        let mut vfs = VfsBuilder::new();
        vfs.add("/", false, Some(PathBuf::from("/nonexistent-host-root"))).expect("root");
        vfs.add("/", true, None).expect("replace root");
        vfs.add("/data", true, None).expect("data");
        let steps = vfs.mkdir(Path::new("/data/cache")).expect("mkdir");
        assert_eq!(steps, vec![DirStep::Make(PathBuf::from("/data/cache"))]);
    }

    #[test]
    fn missing_directory_below_read_only_mount_is_not_writable() {
        let host = tempfile::tempdir().expect("tempdir");
        let mut vfs = VfsBuilder::new();
        vfs.add("/", false, Some(host.path().to_path_buf())).expect("root");
        let err = vfs.mkdir(Path::new("/data/cache")).expect_err("must fail");
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn existing_directory_below_read_only_mount_is_required() {
        let host = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(host.path().join("data")).expect("create dir");
        let mut vfs = VfsBuilder::new();
        vfs.add("/", false, Some(host.path().to_path_buf())).expect("root");
        assert_eq!(
            vfs.mkdir(Path::new("/data")).expect("mkdir"),
            vec![DirStep::Require(PathBuf::from("/data"))]
        );
    }

    #[test]
    fn mount_order_matters() {
        let host = tempfile::tempdir().expect("tempdir");

        // parent before child
        let mut vfs = VfsBuilder::new();
        vfs.add("/", false, Some(host.path().to_path_buf())).expect("root");
        vfs.add("/srv", true, None).expect("srv");
        assert!(vfs.mkdir(Path::new("/srv/app")).is_ok());

        // child before parent
        let mut vfs = VfsBuilder::new();
        vfs.add("/", false, Some(host.path().to_path_buf())).expect("root");
        let err = vfs.mkdir(Path::new("/srv/app")).expect_err("must fail");
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn mounting_over_earlier_mount_would_hide_it() {
        let mut vfs = tmpfs_root();
        vfs.add("/srv/app", false, None).expect("app");
        let err = vfs.add("/srv", true, None).expect_err("must fail");
        assert!(err.to_string().contains("would hide /srv/app"));
    }

    #[test]
    fn writability_follows_closest_mount() {
        let mut vfs = tmpfs_root();
        vfs.add("/usr", false, None).expect("usr");
        assert!(vfs.is_writable(Path::new("/etc")));
        assert!(!vfs.is_writable(Path::new("/usr/lib")));
        assert_eq!(
            vfs.mkdir(Path::new("/usr/lib")).expect("mkdir"),
            vec![DirStep::Require(PathBuf::from("/usr/lib"))]
        );
    }

    #[test]
    fn rejects_relative_and_dotted_paths() {
        let vfs = tmpfs_root();
        assert!(vfs.mkdir(Path::new("usr")).is_err());
        assert!(vfs.mkdir(Path::new("/usr/../etc")).is_err());
    }
}
