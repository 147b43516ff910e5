//! Parent side of the user namespace handshake.
//!
//! A child with a new user namespace cannot continue until the parent has
//! written its uid/gid maps. When `clone3()` created the namespace the
//! parent writes the maps right away; when the child creates it later with
//! `unshare()`, the parent first waits for that, then writes the maps and
//! applies resource limits the child can no longer set on itself.

use std::os::fd::{AsRawFd, OwnedFd};

use spawnd_common::error::{Result, SpawnError};
use spawnd_common::types::ResourceLimits;
use spawnd_core::namespace::user;
use spawnd_core::{rlimit, sys};

use super::prepare::{IdMaps, UserNamespaceMode};

/// Where the handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    /// The child has yet to `unshare(CLONE_NEWUSER)`.
    AwaitingUserNsCreation,
    /// The namespace exists; its maps have not been written.
    AwaitingUidGidMap,
    /// The child may continue.
    Ready,
}

impl HandshakeState {
    /// The first state for `mode`.
    pub const fn initial(mode: UserNamespaceMode) -> Self {
        match mode {
            UserNamespaceMode::None => Self::Ready,
            UserNamespaceMode::Cloned => Self::AwaitingUidGidMap,
            UserNamespaceMode::Postponed => Self::AwaitingUserNsCreation,
        }
    }
}

/// The parent's side effects, so the ordering can be tested without a child.
pub(crate) trait HandshakeIo {
    /// Blocks until the child reports its new user namespace.
    fn wait_user_namespace(&mut self) -> Result<()>;
    /// Writes `uid_map` and `gid_map` for the child.
    fn write_id_maps(&mut self, maps: &IdMaps) -> Result<()>;
    /// Applies resource limits to the child from outside.
    fn apply_parent_rlimits(&mut self) -> Result<()>;
    /// Lets the child continue.
    fn wake_child(&mut self) -> Result<()>;
}

/// Drives a [`HandshakeIo`] from the initial state to [`HandshakeState::Ready`].
#[derive(Debug)]
pub(crate) struct Handshake<'a> {
    state: HandshakeState,
    mode: UserNamespaceMode,
    maps: Option<&'a IdMaps>,
}

impl<'a> Handshake<'a> {
    pub const fn new(mode: UserNamespaceMode, maps: Option<&'a IdMaps>) -> Self {
        Self {
            state: HandshakeState::initial(mode),
            mode,
            maps,
        }
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Performs one transition.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed side effect; the state is left
    /// unchanged.
    pub fn step(&mut self, io: &mut dyn HandshakeIo) -> Result<HandshakeState> {
        self.state = match self.state {
            HandshakeState::AwaitingUserNsCreation => {
                io.wait_user_namespace()?;
                HandshakeState::AwaitingUidGidMap
            }
            HandshakeState::AwaitingUidGidMap => {
                let maps = self.maps.ok_or_else(|| SpawnError::Config {
                    message: "user namespace without id maps".into(),
                })?;
                io.write_id_maps(maps)?;
                if self.mode == UserNamespaceMode::Postponed {
                    io.apply_parent_rlimits()?;
                }
                io.wake_child()?;
                HandshakeState::Ready
            }
            HandshakeState::Ready => HandshakeState::Ready,
        };
        Ok(self.state)
    }

    /// Steps until [`HandshakeState::Ready`].
    ///
    /// # Errors
    ///
    /// Returns the first failed step's error.
    pub fn run(&mut self, io: &mut dyn HandshakeIo) -> Result<()> {
        while self.step(io)? != HandshakeState::Ready {}
        Ok(())
    }
}

/// [`HandshakeIo`] over the real pipes of a freshly cloned child.
#[derive(Debug)]
pub(crate) struct PipeHandshake<'a> {
    pub pid: libc::pid_t,
    /// Read end the child writes to after `unshare()`.
    pub created: Option<OwnedFd>,
    /// Write end the child blocks on.
    pub wake: Option<OwnedFd>,
    pub rlimits: &'a ResourceLimits,
}

impl HandshakeIo for PipeHandshake<'_> {
    fn wait_user_namespace(&mut self) -> Result<()> {
        let fd = self.created.take().ok_or_else(|| SpawnError::ChildSetup {
            message: "no user namespace pipe".into(),
        })?;
        let mut byte = [0u8; 1];
        match sys::read(fd.as_raw_fd(), &mut byte) {
            Ok(1) => Ok(()),
            Ok(_) => Err(SpawnError::ChildSetup {
                message: "child exited before creating its user namespace".into(),
            }),
            Err(e) => Err(SpawnError::Os {
                operation: "read",
                source: e,
            }),
        }
    }

    fn write_id_maps(&mut self, maps: &IdMaps) -> Result<()> {
        user::write_id_maps(self.pid, &maps.uid, &maps.gid, &maps.groups, maps.deny_setgroups)
    }

    fn apply_parent_rlimits(&mut self) -> Result<()> {
        rlimit::apply(self.pid, self.rlimits).map_err(|e| SpawnError::Os {
            operation: "prlimit",
            source: e,
        })
    }

    fn wake_child(&mut self) -> Result<()> {
        if let Some(fd) = self.wake.take() {
            sys::write_all(fd.as_raw_fd(), &[0]).map_err(|e| SpawnError::Os {
                operation: "write",
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use spawnd_core::namespace::user::IdMapping;

    use super::*;

    #[derive(Default)]
    struct FakeIo {
        calls: Vec<&'static str>,
        fail_wait: bool,
    }

    impl HandshakeIo for FakeIo {
        fn wait_user_namespace(&mut self) -> Result<()> {
            self.calls.push("wait");
            if self.fail_wait {
                return Err(SpawnError::ChildSetup {
                    message: "gone".into(),
                });
            }
            Ok(())
        }

        fn write_id_maps(&mut self, _maps: &IdMaps) -> Result<()> {
            self.calls.push("maps");
            Ok(())
        }

        fn apply_parent_rlimits(&mut self) -> Result<()> {
            self.calls.push("rlimits");
            Ok(())
        }

        fn wake_child(&mut self) -> Result<()> {
            self.calls.push("wake");
            Ok(())
        }
    }

    const MAPS: IdMaps = IdMaps {
        uid: IdMapping::identity(1000),
        gid: IdMapping::identity(1000),
        groups: Vec::new(),
        deny_setgroups: true,
    };

    #[test]
    fn no_user_namespace_is_ready_immediately() {
        let mut io = FakeIo::default();
        let mut handshake = Handshake::new(UserNamespaceMode::None, None);
        assert_eq!(handshake.state(), HandshakeState::Ready);
        handshake.run(&mut io).unwrap();
        assert!(io.calls.is_empty());
    }

    #[test]
    fn cloned_namespace_writes_maps_then_wakes() {
        let mut io = FakeIo::default();
        let maps = MAPS;
        let mut handshake = Handshake::new(UserNamespaceMode::Cloned, Some(&maps));
        assert_eq!(handshake.state(), HandshakeState::AwaitingUidGidMap);
        handshake.run(&mut io).unwrap();
        assert_eq!(io.calls, ["maps", "wake"]);
    }

    #[test]
    fn postponed_namespace_waits_and_sets_limits() {
        let mut io = FakeIo::default();
        let maps = MAPS;
        let mut handshake = Handshake::new(UserNamespaceMode::Postponed, Some(&maps));
        assert_eq!(
            handshake.step(&mut io).unwrap(),
            HandshakeState::AwaitingUidGidMap
        );
        assert_eq!(io.calls, ["wait"]);
        assert_eq!(handshake.step(&mut io).unwrap(), HandshakeState::Ready);
        assert_eq!(io.calls, ["wait", "maps", "rlimits", "wake"]);
    }

    #[test]
    fn failed_wait_keeps_state_and_skips_maps() {
        let mut io = FakeIo {
            fail_wait: true,
            ..FakeIo::default()
        };
        let maps = MAPS;
        let mut handshake = Handshake::new(UserNamespaceMode::Postponed, Some(&maps));
        assert!(handshake.run(&mut io).is_err());
        assert_eq!(handshake.state(), HandshakeState::AwaitingUserNsCreation);
        assert_eq!(io.calls, ["wait"]);
    }

    #[test]
    fn pipe_handshake_reports_early_child_exit() {
        let (r, w) = sys::pipe().unwrap();
        drop(w);
        let limits = ResourceLimits::default();
        let mut io = PipeHandshake {
            pid: 0,
            created: Some(r),
            wake: None,
            rlimits: &limits,
        };
        assert!(matches!(
            io.wait_user_namespace(),
            Err(SpawnError::ChildSetup { .. })
        ));
    }

    #[test]
    fn pipe_handshake_wakes_through_pipe() {
        let (r, w) = sys::pipe().unwrap();
        let limits = ResourceLimits::default();
        let mut io = PipeHandshake {
            pid: 0,
            created: None,
            wake: Some(w),
            rlimits: &limits,
        };
        io.wake_child().unwrap();
        let mut buf = [0xffu8; 2];
        assert_eq!(sys::read(r.as_raw_fd(), &mut buf).unwrap(), 1);
        assert_eq!(sys::read(r.as_raw_fd(), &mut buf).unwrap(), 0);
    }
}
