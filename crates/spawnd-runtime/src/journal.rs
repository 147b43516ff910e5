//! systemd journal stream connections for child stdout/stderr.

use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use spawnd_common::constants::JOURNAL_STREAM_SOCKET;
use spawnd_common::error::{Result, SpawnError};

/// Builds the stream header journald expects before the payload.
///
/// Fields: identifier, unit id (empty), priority (6 = info), level prefix,
/// forward to syslog, kmsg, console.
pub fn stream_header(identifier: &str) -> String {
    format!("{identifier}\n\n6\n0\n0\n0\n0\n")
}

/// Opens a journal stream tagged with `identifier`.
///
/// # Errors
///
/// Returns an error if journald is not reachable.
pub fn connect(identifier: &str) -> Result<OwnedFd> {
    let io_err = |e| SpawnError::Io {
        path: JOURNAL_STREAM_SOCKET.into(),
        source: e,
    };
    let mut stream = UnixStream::connect(JOURNAL_STREAM_SOCKET).map_err(io_err)?;
    stream.shutdown(std::net::Shutdown::Read).map_err(io_err)?;
    stream.write_all(stream_header(identifier).as_bytes()).map_err(io_err)?;
    Ok(OwnedFd::from(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_seven_lines() {
        let header = stream_header("worker");
        assert!(header.starts_with("worker\n\n6\n"));
        assert_eq!(header.lines().count(), 7);
    }
}
