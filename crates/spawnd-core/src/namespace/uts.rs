//! UTS namespace: the child's own hostname.

use std::ffi::CStr;
use std::io;

/// Sets the hostname of the calling process's UTS namespace.
///
/// Called in the child after `clone3(CLONE_NEWUTS)`; does not allocate.
///
/// # Errors
///
/// Returns the OS error if `sethostname(2)` fails.
pub fn set_hostname(hostname: &CStr) -> io::Result<()> {
    let bytes = hostname.to_bytes();
    // SAFETY: bytes is valid for reads of its length.
    if unsafe { libc::sethostname(bytes.as_ptr().cast(), bytes.len()) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
