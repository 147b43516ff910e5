//! Registry of tmpfs instances shared by name between children.
//!
//! The first request for a name mounts a fresh tmpfs below the spawner's
//! private `/tmp`; later requests reuse it. Children get it bind mounted.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use spawnd_common::constants::NAMED_TMPFS_DIR;
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::filesystem::NamedTmpfsResolver;

const TMPFS_OPTIONS: &str = "size=16M,nr_inodes=65536,mode=1777";

/// Mounts and remembers named tmpfs instances.
#[derive(Debug)]
pub struct NamedTmpfsManager {
    base: PathBuf,
    mounted: RefCell<BTreeSet<String>>,
}

impl Default for NamedTmpfsManager {
    fn default() -> Self {
        Self::new(NAMED_TMPFS_DIR)
    }
}

impl NamedTmpfsManager {
    /// Creates a registry mounting below `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            mounted: RefCell::new(BTreeSet::new()),
        }
    }

    /// Directory the instances are mounted in.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Names mounted so far.
    pub fn names(&self) -> Vec<String> {
        self.mounted.borrow().iter().cloned().collect()
    }

    fn mount_new(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| SpawnError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        mount(
            Some("named-tmpfs"),
            path,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(TMPFS_OPTIONS),
        )
        .map_err(|e| SpawnError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(SpawnError::Config {
            message: format!("invalid named tmpfs: {name:?}"),
        });
    }
    Ok(())
}

impl NamedTmpfsResolver for NamedTmpfsManager {
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.base.join(name);
        if !self.mounted.borrow().contains(name) {
            self.mount_new(&path)?;
            tracing::info!(name, path = %path.display(), "mounted named tmpfs");
            let _ = self.mounted.borrow_mut().insert(name.to_owned());
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_escaping_the_base() {
        let manager = NamedTmpfsManager::new("/nonexistent/base");
        for name in ["", ".", "..", "a/b", "../etc"] {
            assert!(matches!(manager.resolve(name), Err(SpawnError::Config { .. })), "{name:?}");
        }
        assert!(manager.names().is_empty());
    }

    #[test]
    fn default_base_is_below_tmp() {
        assert_eq!(NamedTmpfsManager::default().base(), Path::new(NAMED_TMPFS_DIR));
    }
}
