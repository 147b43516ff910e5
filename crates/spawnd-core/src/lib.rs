//! # spawnd-core
//!
//! Linux isolation primitives for the spawnd child process spawner.
//!
//! This crate provides:
//! - **Platform primitives** ([`sys`]): `clone3`, pidfds, `prlimit64`,
//!   capabilities and the other raw syscalls the rest builds on.
//! - **Namespaces**: user, PID, network, IPC, UTS, cgroup and mount
//!   namespace configuration, uid/gid maps and named namespaces.
//! - **Filesystem**: the mount plan a child executes to build its root.
//! - **Cgroups v2**: the delegated group, per-child cgroups, controllers.
//! - **Seccomp**: BPF assembly and the syscall filter policies.
//! - **Process description**: [`prepared::PreparedChildProcess`].
//!
//! Code reachable from a freshly cloned child never allocates; failures
//! there are [`setup::SetupError`] values written to the error pipe.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("spawnd-core only supports Linux");

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod prepared;
pub mod rlimit;
pub mod seccomp;
pub mod setup;
pub mod sys;
pub mod uid_gid;
