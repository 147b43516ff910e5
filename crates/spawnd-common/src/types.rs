//! Domain primitive types used across the spawnd workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_GROUPS;
use crate::error::{Result, SpawnError};

/// User and group identities a child process switches to.
///
/// A value with neither `uid` nor `gid` set is "empty" and means no
/// privilege drop was requested. This is distinct from explicitly asking
/// for uid/gid 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UidGid {
    /// Effective (and saved) user id.
    pub uid: Option<u32>,
    /// Effective (and saved) group id.
    pub gid: Option<u32>,
    /// Real user id, when it differs from the effective one.
    pub real_uid: Option<u32>,
    /// Real group id, when it differs from the effective one.
    pub real_gid: Option<u32>,
    /// Supplementary groups, at most [`MAX_GROUPS`].
    pub groups: Vec<u32>,
}

impl UidGid {
    /// Creates an identity with effective uid and gid and no supplementary groups.
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
            real_uid: None,
            real_gid: None,
            groups: Vec::new(),
        }
    }

    /// Returns `true` if no identity change was requested.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Real uid to apply: the explicit one, else the effective one.
    #[must_use]
    pub fn effective_real_uid(&self) -> Option<u32> {
        self.real_uid.or(self.uid)
    }

    /// Real gid to apply: the explicit one, else the effective one.
    #[must_use]
    pub fn effective_real_gid(&self) -> Option<u32> {
        self.real_gid.or(self.gid)
    }

    /// Adds a supplementary group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group list is already full.
    pub fn add_group(&mut self, gid: u32) -> Result<()> {
        if self.groups.len() >= MAX_GROUPS {
            return Err(SpawnError::Config {
                message: format!("too many supplementary groups (max {MAX_GROUPS})"),
            });
        }
        self.groups.push(gid);
        Ok(())
    }
}

impl fmt::Display for UidGid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.uid, self.gid) {
            (None, None) => write!(f, "(unchanged)"),
            (uid, gid) => {
                let show = |id: Option<u32>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
                write!(f, "{}:{}", show(uid), show(gid))?;
                for group in &self.groups {
                    write!(f, ",{group}")?;
                }
                Ok(())
            }
        }
    }
}

/// Number of resource limit slots (`RLIM_NLIMITS` on Linux).
pub const RLIMIT_COUNT: usize = 16;

/// One soft/hard resource limit pair.
///
/// `None` means "inherit the current value"; `u64::MAX` is `RLIM_INFINITY`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Soft limit.
    pub soft: Option<u64>,
    /// Hard limit.
    pub hard: Option<u64>,
}

impl ResourceLimit {
    /// Creates a limit with both values set.
    #[must_use]
    pub const fn new(soft: u64, hard: u64) -> Self {
        Self {
            soft: Some(soft),
            hard: Some(hard),
        }
    }

    /// Returns `true` if neither value is set.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        self.soft.is_none() && self.hard.is_none()
    }

    /// Returns `true` if only one of the two values is set.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.soft.is_none() != self.hard.is_none()
    }
}

/// Resource limits for a child process, indexed by `RLIMIT_*` number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    values: [ResourceLimit; RLIMIT_COUNT],
}

impl ResourceLimits {
    /// Returns the limit for one resource.
    #[must_use]
    pub fn get(&self, resource: usize) -> Option<&ResourceLimit> {
        self.values.get(resource)
    }

    /// Sets the limit for one resource.
    ///
    /// # Errors
    ///
    /// Returns an error if `resource` is out of range.
    pub fn set(&mut self, resource: usize, limit: ResourceLimit) -> Result<()> {
        let slot = self.values.get_mut(resource).ok_or_else(|| SpawnError::Config {
            message: format!("invalid resource limit index {resource}"),
        })?;
        *slot = limit;
        Ok(())
    }

    /// Returns `true` if no limit is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(ResourceLimit::is_undefined)
    }

    /// Iterates over defined limits in resource order.
    pub fn defined(&self) -> impl Iterator<Item = (usize, &ResourceLimit)> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, limit)| !limit.is_undefined())
    }
}

/// Encodes a wait status the way `W_EXITCODE(ret, sig)` does.
#[must_use]
pub const fn w_exitcode(code: u8, signal: u8) -> i32 {
    ((code as i32) << 8) | signal as i32
}

/// Wait status reported for a request that never got to run.
pub const SPAWN_FAILED_STATUS: i32 = w_exitcode(0xff, 0);

/// Decoded form of a raw wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process called `exit()` with this code.
    Exited(i32),
    /// The process was killed by a signal.
    Signaled {
        /// Signal number.
        signal: i32,
        /// Whether a core dump was written.
        core_dumped: bool,
    },
    /// Stop/continue notifications and anything unrecognized.
    Other(i32),
}

impl ExitStatus {
    /// Decodes a raw `waitpid()` status.
    #[must_use]
    pub const fn from_raw(status: i32) -> Self {
        let signal = status & 0x7f;
        if signal == 0 {
            Self::Exited((status >> 8) & 0xff)
        } else if signal != 0x7f {
            Self::Signaled {
                signal,
                core_dumped: status & 0x80 != 0,
            }
        } else {
            Self::Other(status)
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "died from signal {signal} (core dumped)"),
            Self::Signaled { signal, .. } => write!(f, "died from signal {signal}"),
            Self::Other(raw) => write!(f, "unknown wait status {raw:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uid_gid_differs_from_root() {
        assert!(UidGid::default().is_empty());
        assert!(!UidGid::new(0, 0).is_empty());
    }

    #[test]
    fn real_ids_default_to_effective() {
        let mut ids = UidGid::new(1000, 100);
        assert_eq!(ids.effective_real_uid(), Some(1000));
        ids.real_uid = Some(1001);
        assert_eq!(ids.effective_real_uid(), Some(1001));
        assert_eq!(ids.effective_real_gid(), Some(100));
    }

    #[test]
    fn group_list_is_bounded() {
        let mut ids = UidGid::new(1, 1);
        for gid in 0..32 {
            ids.add_group(gid).expect("within limit");
        }
        assert!(ids.add_group(99).is_err());
    }

    #[test]
    fn uid_gid_display_lists_groups() {
        let mut ids = UidGid::new(1000, 100);
        ids.groups = vec![10, 20];
        assert_eq!(ids.to_string(), "1000:100,10,20");
        assert_eq!(UidGid::default().to_string(), "(unchanged)");
    }

    #[test]
    fn resource_limits_iterate_defined_only() {
        let mut limits = ResourceLimits::default();
        assert!(limits.is_empty());
        limits.set(7, ResourceLimit::new(64, 128)).expect("valid index");
        let defined: Vec<_> = limits.defined().map(|(i, l)| (i, *l)).collect();
        assert_eq!(defined, vec![(7, ResourceLimit::new(64, 128))]);
        assert!(limits.set(RLIMIT_COUNT, ResourceLimit::default()).is_err());
    }

    #[test]
    fn spawn_failed_status_is_exit_code_255() {
        assert_eq!(SPAWN_FAILED_STATUS, 0xff00);
        assert_eq!(ExitStatus::from_raw(SPAWN_FAILED_STATUS), ExitStatus::Exited(255));
    }

    #[test]
    fn decodes_signal_death() {
        assert_eq!(
            ExitStatus::from_raw(9),
            ExitStatus::Signaled {
                signal: 9,
                core_dumped: false
            }
        );
        assert_eq!(
            ExitStatus::from_raw(0x80 | 11),
            ExitStatus::Signaled {
                signal: 11,
                core_dumped: true
            }
        );
    }
}
