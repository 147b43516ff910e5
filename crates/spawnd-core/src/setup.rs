//! Errors raised by child-side setup steps.
//!
//! Code that runs between `clone3()` and `execve()` must not allocate, so
//! a [`SetupError`] only borrows static step names and paths prepared by
//! the parent. It is written to the error pipe through a stack buffer.

use std::ffi::CStr;
use std::fmt;
use std::io::{self, Write};
use std::os::fd::RawFd;

use crate::sys;

/// A failed setup step inside the child.
#[derive(Debug, Clone, Copy)]
pub struct SetupError<'a> {
    what: &'static str,
    detail: Option<&'a CStr>,
    errno: Option<i32>,
}

impl<'a> SetupError<'a> {
    /// A failure described by a message alone.
    #[must_use]
    pub const fn message(what: &'static str) -> Self {
        Self {
            what,
            detail: None,
            errno: None,
        }
    }

    /// A failure with a path or value the message refers to.
    #[must_use]
    pub const fn with_detail(what: &'static str, detail: &'a CStr) -> Self {
        Self {
            what,
            detail: Some(detail),
            errno: None,
        }
    }

    /// A failed system call.
    #[must_use]
    pub fn os(what: &'static str, detail: Option<&'a CStr>, err: &io::Error) -> Self {
        Self {
            what,
            detail,
            errno: err.raw_os_error(),
        }
    }

    /// A failed `nix` call.
    #[must_use]
    pub const fn errno(what: &'static str, detail: Option<&'a CStr>, err: nix::errno::Errno) -> Self {
        Self {
            what,
            detail,
            errno: Some(err as i32),
        }
    }

    /// Writes the message to `fd` without allocating.
    pub fn write_to(&self, fd: RawFd) {
        let mut buffer = [0u8; 1024];
        let mut cursor = io::Cursor::new(&mut buffer[..]);
        let _ = write!(cursor, "{self}");
        #[allow(clippy::cast_possible_truncation)]
        let len = cursor.position() as usize;
        let _ = sys::write_all(fd, buffer.get(..len).unwrap_or_default());
    }
}

impl fmt::Display for SetupError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.what)?;
        if let Some(detail) = self.detail {
            write!(f, " '{}'", detail.to_string_lossy())?;
        }
        if let Some(errno) = self.errno {
            write!(f, ": {}", nix::errno::Errno::from_raw(errno).desc())?;
        }
        Ok(())
    }
}

/// Attaches a step name to `io::Result` and `nix::Result` values in child code.
pub trait SetupContext<T> {
    /// Maps the error to a [`SetupError`] naming `what`.
    ///
    /// # Errors
    ///
    /// Returns the mapped error.
    fn setup(self, what: &'static str) -> Result<T, SetupError<'static>>;

    /// Maps the error to a [`SetupError`] naming `what` and `detail`.
    ///
    /// # Errors
    ///
    /// Returns the mapped error.
    fn setup_at<'a>(self, what: &'static str, detail: &'a CStr) -> Result<T, SetupError<'a>>;
}

impl<T> SetupContext<T> for io::Result<T> {
    fn setup(self, what: &'static str) -> Result<T, SetupError<'static>> {
        self.map_err(|e| SetupError::os(what, None, &e))
    }

    fn setup_at<'a>(self, what: &'static str, detail: &'a CStr) -> Result<T, SetupError<'a>> {
        self.map_err(|e| SetupError::os(what, Some(detail), &e))
    }
}

impl<T> SetupContext<T> for nix::Result<T> {
    fn setup(self, what: &'static str) -> Result<T, SetupError<'static>> {
        self.map_err(|e| SetupError::errno(what, None, e))
    }

    fn setup_at<'a>(self, what: &'static str, detail: &'a CStr) -> Result<T, SetupError<'a>> {
        self.map_err(|e| SetupError::errno(what, Some(detail), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_step_path_and_errno() {
        let err = SetupError::errno("mount", Some(c"/proc"), nix::errno::Errno::EPERM);
        assert_eq!(err.to_string(), "mount '/proc': Operation not permitted");
    }

    #[test]
    fn formats_plain_message() {
        let err = SetupError::with_detail("not writable", c"/var/lib");
        assert_eq!(err.to_string(), "not writable '/var/lib'");
    }

    #[test]
    fn writes_message_to_pipe() {
        let (r, w) = sys::pipe().expect("pipe");
        SetupError::message("execve failed").write_to(std::os::fd::AsRawFd::as_raw_fd(&w));
        drop(w);
        let mut buffer = [0u8; 64];
        let n = sys::read(std::os::fd::AsRawFd::as_raw_fd(&r), &mut buffer).expect("read");
        assert_eq!(&buffer[..n], b"execve failed");
    }
}
