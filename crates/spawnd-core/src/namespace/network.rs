//! Named network namespaces.
//!
//! Network namespaces created with `ip netns add NAME` are bind-mounted
//! at `/run/netns/NAME`; a child joins one instead of getting a fresh,
//! empty network stack.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use spawnd_common::constants::NETNS_DIR;
use spawnd_common::error::Result;

use super::open_namespace_file;

/// Returns the bind-mount path of the named network namespace.
///
/// # Errors
///
/// Returns an error if `name` is not a plain file name.
pub fn named_path(name: &str) -> Result<PathBuf> {
    super::validate_name("network namespace", name)?;
    Ok(PathBuf::from(NETNS_DIR).join(name))
}

/// Opens the named network namespace.
///
/// # Errors
///
/// Returns an error if the name is invalid or the namespace does not exist.
pub fn open_named(name: &str) -> Result<OwnedFd> {
    let path = named_path(name)?;
    let fd = open_namespace_file(&path)?;
    tracing::debug!(name, "opened network namespace");
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_netns_path() {
        let path = named_path("blue").expect("valid name");
        assert_eq!(path, PathBuf::from("/run/netns/blue"));
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(named_path("../etc").is_err());
        assert!(named_path("").is_err());
    }
}
