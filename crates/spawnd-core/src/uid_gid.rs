//! Switching a child to its target user and group ids.

use nix::unistd::{Gid, Uid, getgroups, getresgid, getresuid, setresgid, setresuid};
use spawnd_common::types::UidGid;

use crate::setup::{SetupContext, SetupError};
use crate::sys;

/// Applies `ids` to the calling process. Does not allocate.
///
/// Supplementary groups are replaced only when `set_groups` is `true`; a
/// user namespace with `setgroups` denied has to keep them. An empty group
/// list clears them.
///
/// # Errors
///
/// Returns the step that failed.
pub fn apply(ids: &UidGid, set_groups: bool) -> Result<(), SetupError<'static>> {
    if set_groups && ids.gid.is_some() {
        sys::setgroups(&ids.groups).setup("setgroups")?;
    }
    if let Some(gid) = ids.gid {
        let real = ids.effective_real_gid().unwrap_or(gid);
        setresgid(Gid::from_raw(real), Gid::from_raw(gid), Gid::from_raw(gid)).setup("setresgid")?;
    }
    if let Some(uid) = ids.uid {
        let real = ids.effective_real_uid().unwrap_or(uid);
        setresuid(Uid::from_raw(real), Uid::from_raw(uid), Uid::from_raw(uid)).setup("setresuid")?;
    }
    Ok(())
}

/// Returns `true` if the calling process already runs with exactly `ids`,
/// so applying them can be skipped.
#[must_use]
pub fn is_nop(ids: &UidGid) -> bool {
    let (Ok(uids), Ok(gids)) = (getresuid(), getresgid()) else {
        return false;
    };
    let uid_ok = ids.uid.is_none_or(|uid| {
        uids.effective.as_raw() == uid
            && uids.saved.as_raw() == uid
            && ids.effective_real_uid() == Some(uids.real.as_raw())
    });
    let gid_ok = ids.gid.is_none_or(|gid| {
        gids.effective.as_raw() == gid
            && gids.saved.as_raw() == gid
            && ids.effective_real_gid() == Some(gids.real.as_raw())
    });
    let groups_ok = ids.gid.is_none()
        || getgroups().is_ok_and(|current| {
            current.len() == ids.groups.len() && current.iter().zip(&ids.groups).all(|(a, b)| a.as_raw() == *b)
        });
    uid_ok && gid_ok && groups_ok
}

/// The effective ids of the calling process.
#[must_use]
pub fn load_effective() -> UidGid {
    UidGid::new(Uid::effective().as_raw(), Gid::effective().as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ids_are_always_nop() {
        assert!(is_nop(&UidGid::default()));
    }

    #[test]
    fn current_effective_uid_is_nop() {
        let mut ids = load_effective();
        ids.gid = None;
        assert!(is_nop(&ids) == (Uid::current() == Uid::effective()));
    }

    #[test]
    fn applying_empty_ids_does_nothing() {
        apply(&UidGid::default(), false).expect("no-op");
    }
}
