//! Applying [`ResourceLimits`] with `prlimit64()`.

use std::io;

use spawnd_common::types::{ResourceLimit, ResourceLimits};

use crate::sys::{self, Rlimit64};

/// Applies all defined limits to `pid` (0 = the calling process).
///
/// A limit with only one value set keeps the other at its current value.
/// Does not allocate, so it is safe to call in a freshly cloned child.
///
/// # Errors
///
/// Returns the OS error of the first limit that cannot be applied.
pub fn apply(pid: libc::pid_t, limits: &ResourceLimits) -> io::Result<()> {
    for (resource, limit) in limits.defined() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let resource = resource as libc::c_int;
        let mut value = Rlimit64::default();
        if limit.is_partial() {
            sys::prlimit(pid, resource, None, Some(&mut value))?;
        }
        merge(&mut value, limit);
        sys::prlimit(pid, resource, Some(&value), None)?;
    }
    Ok(())
}

fn merge(current: &mut Rlimit64, limit: &ResourceLimit) {
    if let Some(soft) = limit.soft {
        current.cur = soft;
    }
    if let Some(hard) = limit.hard {
        current.max = hard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_limit_keeps_other_value() {
        let mut current = Rlimit64 { cur: 1024, max: 4096 };
        merge(
            &mut current,
            &ResourceLimit {
                soft: Some(512),
                hard: None,
            },
        );
        assert_eq!(current, Rlimit64 { cur: 512, max: 4096 });
    }

    #[test]
    fn applies_soft_limit_to_self() {
        let mut current = Rlimit64::default();
        sys::prlimit(0, libc::RLIMIT_NOFILE as libc::c_int, None, Some(&mut current)).expect("get");

        let mut limits = ResourceLimits::default();
        limits
            .set(
                libc::RLIMIT_NOFILE as usize,
                ResourceLimit {
                    soft: Some(current.cur),
                    hard: None,
                },
            )
            .expect("set");
        apply(0, &limits).expect("apply");

        let mut after = Rlimit64::default();
        sys::prlimit(0, libc::RLIMIT_NOFILE as libc::c_int, None, Some(&mut after)).expect("get");
        assert_eq!(after, current);
    }
}
