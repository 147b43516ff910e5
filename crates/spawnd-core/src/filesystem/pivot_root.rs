//! Root filesystem switching via `pivot_root(2)`.

use std::ffi::CStr;

use nix::mount::{MntFlags, umount2};

use crate::setup::{SetupContext, SetupError};

/// Makes the current working directory the new root.
///
/// The old root ends up at `put_old` (relative to the new root) and stays
/// mounted there until [`detach_old_root`] so bind mount sources can still
/// be reached through it.
///
/// # Errors
///
/// Returns an error if `pivot_root(2)` or the following `chdir` fails.
pub fn pivot_into_cwd(put_old: &CStr) -> Result<(), SetupError<'_>> {
    nix::unistd::pivot_root(c".", put_old).setup_at("pivot_root", put_old)?;
    nix::unistd::chdir(c"/").setup("chdir to new root")
}

/// Lazily unmounts the old root.
///
/// # Errors
///
/// Returns an error if `umount2(2)` fails.
pub fn detach_old_root(put_old: &CStr) -> Result<(), SetupError<'_>> {
    umount2(put_old, MntFlags::MNT_DETACH).setup_at("umount", put_old)
}
