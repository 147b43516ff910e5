//! # spawnd-protocol
//!
//! The datagram protocol spoken over the `SOCK_SEQPACKET` socket between
//! an unprivileged client and the privileged spawner.
//!
//! A request datagram starts with one [`RequestCommand`] byte; an `EXEC`
//! request carries a sparse stream of [`ExecCommand`] records describing
//! a [`spawnd_core::prepared::PreparedChildProcess`]. A response datagram
//! is a sequence of [`ResponseCommand`] records. File descriptors travel
//! next to the bytes as `SCM_RIGHTS` ancillary data.
//!
//! All integers are little-endian; strings are NUL-terminated.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod commands;
pub mod exec;
pub mod payload;
pub mod request;
pub mod response;
pub mod scm;

pub use builder::{Datagram, Serializer};
pub use commands::{ExecCommand, RequestCommand, ResponseCommand};
pub use payload::{Payload, ReceivedFds};
pub use request::{MalformedRequest, Request};
pub use response::Response;
