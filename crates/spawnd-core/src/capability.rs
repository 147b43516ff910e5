//! Linux capability management for least-privilege execution.
//!
//! The spawner keeps only the capabilities it needs to build sandboxes;
//! everything else is removed from its effective, permitted, inheritable
//! and bounding sets.

use spawnd_common::error::{Result, SpawnError};

use crate::sys;

/// Linux capability identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Change file ownership.
    Chown,
    /// Bypass file permission checks.
    DacOverride,
    /// Bypass ownership checks on file operations.
    Fowner,
    /// Send signals to arbitrary processes.
    Kill,
    /// Set group ids.
    Setgid,
    /// Set user ids.
    Setuid,
    /// Bind to privileged ports (< 1024).
    NetBindService,
    /// Network administration.
    NetAdmin,
    /// Use `chroot()`.
    SysChroot,
    /// Namespaces, mounts and most other administration.
    SysAdmin,
    /// Raise scheduling priority.
    SysNice,
    /// Override resource limits.
    SysResource,
}

/// Highest capability number known to current kernels.
const CAP_LAST_CAP: u32 = 40;

impl Capability {
    /// Kernel capability number.
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::Chown => 0,
            Self::DacOverride => 1,
            Self::Fowner => 3,
            Self::Kill => 5,
            Self::Setgid => 6,
            Self::Setuid => 7,
            Self::NetBindService => 10,
            Self::NetAdmin => 12,
            Self::SysChroot => 18,
            Self::SysAdmin => 21,
            Self::SysNice => 23,
            Self::SysResource => 24,
        }
    }

    const fn mask(self) -> (usize, u32) {
        let number = self.number();
        ((number / 32) as usize, 1 << (number % 32))
    }
}

/// Returns `true` if the calling thread has `capability` in its effective
/// set.
#[must_use]
pub fn has_effective(capability: Capability) -> bool {
    let (index, bit) = capability.mask();
    sys::capget().is_ok_and(|data| data.get(index).is_some_and(|d| d.effective & bit != 0))
}

/// Drops all Linux capabilities except those in the allowlist.
///
/// # Errors
///
/// Returns an error if capability manipulation syscalls fail.
pub fn drop_capabilities(keep: &[Capability]) -> Result<()> {
    let mut masks = [0u32; 2];
    for capability in keep {
        let (index, bit) = capability.mask();
        if let Some(mask) = masks.get_mut(index) {
            *mask |= bit;
        }
    }

    for number in 0..=CAP_LAST_CAP {
        let kept = masks
            .get((number / 32) as usize)
            .is_some_and(|mask| mask & (1 << (number % 32)) != 0);
        if kept {
            continue;
        }
        if let Err(e) = sys::capbset_drop(number) {
            // EINVAL: capability unknown to this kernel
            if e.raw_os_error() != Some(libc::EINVAL) {
                return Err(SpawnError::Os {
                    operation: "PR_CAPBSET_DROP",
                    source: e,
                });
            }
        }
    }

    let mut data = sys::capget().map_err(|e| SpawnError::Os {
        operation: "capget",
        source: e,
    })?;
    for (entry, mask) in data.iter_mut().zip(masks) {
        entry.effective &= mask;
        entry.permitted &= mask;
        entry.inheritable &= mask;
    }
    sys::capset(&data).map_err(|e| SpawnError::Os {
        operation: "capset",
        source: e,
    })?;

    tracing::info!(retained = keep.len(), "dropped capabilities");
    Ok(())
}
