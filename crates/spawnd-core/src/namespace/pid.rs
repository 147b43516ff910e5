//! Named PID namespaces.
//!
//! A child can be placed into an existing PID namespace whose namespace
//! file is bind-mounted at `/run/pidns/NAME`. Such a child never gets a
//! spawned init process; the namespace already has one.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use spawnd_common::constants::PIDNS_DIR;
use spawnd_common::error::Result;

use super::open_namespace_file;

/// Returns the bind-mount path of the named PID namespace.
///
/// # Errors
///
/// Returns an error if `name` is not a plain file name.
pub fn named_path(name: &str) -> Result<PathBuf> {
    super::validate_name("PID namespace", name)?;
    Ok(PathBuf::from(PIDNS_DIR).join(name))
}

/// Opens the named PID namespace.
///
/// # Errors
///
/// Returns an error if the name is invalid or the namespace does not exist.
pub fn open_named(name: &str) -> Result<OwnedFd> {
    let path = named_path(name)?;
    let fd = open_namespace_file(&path)?;
    tracing::debug!(name, "opened PID namespace");
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_pidns_path() {
        assert_eq!(
            named_path("worker").expect("valid name"),
            PathBuf::from("/run/pidns/worker")
        );
    }

    #[test]
    fn missing_namespace_is_an_error() {
        assert!(open_named("does-not-exist-here").is_err());
    }
}
