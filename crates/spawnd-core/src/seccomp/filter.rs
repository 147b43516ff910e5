//! Syscall filter policies for spawned children.
//!
//! Every child gets the default list of forbidden syscalls (process is
//! killed with `SIGSYS`). The `forbid_*` options add rules that make the
//! offending call fail with an errno instead.

use super::{Action, ArgCheck, FilterBuilder, Rule, SeccompProgram};

/// Syscalls no sandboxed process has any business calling.
const FORBIDDEN_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_acct,
    libc::SYS_add_key,
    libc::SYS_bpf,
    libc::SYS_clock_adjtime,
    libc::SYS_clock_settime,
    libc::SYS_delete_module,
    libc::SYS_finit_module,
    libc::SYS_init_module,
    libc::SYS_kexec_file_load,
    libc::SYS_kexec_load,
    libc::SYS_keyctl,
    libc::SYS_open_by_handle_at,
    libc::SYS_perf_event_open,
    libc::SYS_quotactl,
    libc::SYS_reboot,
    libc::SYS_request_key,
    libc::SYS_settimeofday,
    libc::SYS_swapoff,
    libc::SYS_swapon,
    libc::SYS_syslog,
    libc::SYS_userfaultfd,
    libc::SYS_vhangup,
];

/// Legacy syscalls that only exist on x86_64.
#[cfg(target_arch = "x86_64")]
const FORBIDDEN_SYSCALLS_ARCH: &[libc::c_long] = &[
    libc::SYS_create_module,
    libc::SYS_get_kernel_syms,
    libc::SYS_ioperm,
    libc::SYS_iopl,
    libc::SYS_modify_ldt,
    libc::SYS_nfsservctl,
    libc::SYS_query_module,
    libc::SYS_uselib,
    libc::SYS__sysctl,
];

#[cfg(not(target_arch = "x86_64"))]
const FORBIDDEN_SYSCALLS_ARCH: &[libc::c_long] = &[];

const MCAST_JOIN_GROUP: u32 = 42;
const MCAST_JOIN_SOURCE_GROUP: u32 = 46;

/// `(level, optname)` pairs of `setsockopt()` calls joining a multicast
/// group.
const MULTICAST_JOINS: &[(u32, u32)] = &[
    (libc::IPPROTO_IP as u32, libc::IP_ADD_MEMBERSHIP as u32),
    (libc::IPPROTO_IP as u32, libc::IP_ADD_SOURCE_MEMBERSHIP as u32),
    (libc::IPPROTO_IP as u32, MCAST_JOIN_GROUP),
    (libc::IPPROTO_IP as u32, MCAST_JOIN_SOURCE_GROUP),
    (libc::IPPROTO_IPV6 as u32, libc::IPV6_ADD_MEMBERSHIP as u32),
    (libc::IPPROTO_IPV6 as u32, MCAST_JOIN_GROUP),
    (libc::IPPROTO_IPV6 as u32, MCAST_JOIN_SOURCE_GROUP),
];

/// Which optional restrictions a child's filter carries.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallFilter {
    /// Creating user namespaces fails with `EPERM`.
    ///
    /// `clone3()` fails with `ENOSYS` because its flags live in memory a
    /// filter cannot inspect; C libraries fall back to `clone()`.
    pub forbid_user_namespace: bool,
    /// Joining multicast groups fails with `EPERM`.
    pub forbid_multicast: bool,
    /// `bind()` and `listen()` fail with `EACCES`.
    pub forbid_bind: bool,
}

impl SyscallFilter {
    /// Returns `true` if an option was requested; the filter is then
    /// mandatory and failing to install it aborts the spawn.
    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.forbid_user_namespace || self.forbid_multicast || self.forbid_bind
    }

    /// Assembles the filter program.
    #[must_use]
    pub fn program(&self) -> SeccompProgram {
        let mut builder = FilterBuilder::new();
        for &syscall in FORBIDDEN_SYSCALLS.iter().chain(FORBIDDEN_SYSCALLS_ARCH) {
            builder.add(Rule::new(syscall, Action::KillProcess));
        }

        if self.forbid_user_namespace {
            let newuser = ArgCheck::AnyBits {
                index: 0,
                mask: libc::CLONE_NEWUSER as u32,
            };
            builder
                .add(Rule::new(libc::SYS_unshare, errno(libc::EPERM)).with(newuser))
                .add(Rule::new(libc::SYS_clone, errno(libc::EPERM)).with(newuser))
                .add(Rule::new(libc::SYS_clone3, errno(libc::ENOSYS)));
        }

        if self.forbid_multicast {
            for &(level, optname) in MULTICAST_JOINS {
                builder.add(
                    Rule::new(libc::SYS_setsockopt, errno(libc::EPERM))
                        .with(ArgCheck::Equal { index: 1, value: level })
                        .with(ArgCheck::Equal {
                            index: 2,
                            value: optname,
                        }),
                );
            }
        }

        if self.forbid_bind {
            builder
                .add(Rule::new(libc::SYS_bind, errno(libc::EACCES)))
                .add(Rule::new(libc::SYS_listen, errno(libc::EACCES)));
        }

        builder.build()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn errno(value: libc::c_int) -> Action {
    Action::Errno(value as u16)
}
