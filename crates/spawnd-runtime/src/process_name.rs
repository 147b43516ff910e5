//! The kernel name (`comm`) of the current process.
//!
//! [`init`] records the name the program started with; [`set`] renames
//! the process, e.g. to `spawn` after the spawner forked off.

use std::ffi::CString;
use std::sync::OnceLock;

use spawnd_core::sys;

static ORIGINAL_NAME: OnceLock<String> = OnceLock::new();

/// Records the name from `argv[0]`. Later calls are ignored.
pub fn init(argv0: &str) {
    let name = argv0.rsplit('/').next().unwrap_or(argv0);
    let _ = ORIGINAL_NAME.set(name.to_owned());
}

/// The name recorded by [`init`], if any.
pub fn original() -> Option<&'static str> {
    ORIGINAL_NAME.get().map(String::as_str)
}

/// Renames the current thread group leader.
///
/// The kernel truncates to 15 bytes. Names containing NUL are ignored.
pub fn set(name: &str) {
    let Ok(name) = CString::new(name) else {
        return;
    };
    if let Err(e) = sys::set_comm(&name) {
        tracing::debug!(error = %e, "could not set the process name");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_keeps_basename_once() {
        init("/usr/sbin/spawnd");
        init("/other");
        assert_eq!(original(), Some("spawnd"));
    }
}
