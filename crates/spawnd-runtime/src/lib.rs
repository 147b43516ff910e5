//! # spawnd-runtime
//!
//! Process machinery of spawnd:
//!
//! - [`direct`]: the spawn engine. `clone3()`, the parent/child handshake
//!   and the child-side setup up to `execve()`.
//! - [`service`]: the [`service::SpawnService`] abstraction, implemented by
//!   [`local::LocalSpawnService`] (in-process) and
//!   [`client::SpawnServerClient`] (through a spawner).
//! - [`server`] and [`launch`]: the privileged spawner process.
//! - [`cgroup_kill`] and [`cgroup_watch`]: supervising cgroups.
//!
//! Everything asynchronous runs on a current-thread tokio runtime inside a
//! [`tokio::task::LocalSet`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup_kill;
pub mod cgroup_watch;
pub mod client;
pub mod direct;
pub mod exit_watch;
pub mod journal;
pub mod launch;
pub mod local;
pub mod named_tmpfs;
pub mod process_name;
pub mod server;
pub mod service;
