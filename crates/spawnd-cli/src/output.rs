//! Reporting child outcomes on the terminal.

use spawnd_common::types::ExitStatus;

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    match bytes {
        GIB.. => format!("{:.1} GiB", bytes as f64 / GIB as f64),
        MIB.. => format!("{:.1} MiB", bytes as f64 / MIB as f64),
        KIB.. => format!("{:.1} KiB", bytes as f64 / KIB as f64),
        _ => format!("{bytes} B"),
    }
}

/// Maps a child's wait status to our own exit code.
///
/// A normal exit is mirrored; a signal death is reported with a message
/// and `EXIT_FAILURE`.
#[must_use]
pub fn exit_code(status: ExitStatus) -> (i32, Option<String>) {
    match status {
        ExitStatus::Exited(code) => (code, None),
        other => (libc::EXIT_FAILURE, Some(format!("child {other}"))),
    }
}

/// Prints the spawner's memory warning.
#[allow(clippy::print_stderr)]
pub fn memory_warning(current: u64, max: u64) {
    eprintln!(
        "spawnd: spawner memory at {} of {}",
        format_bytes(current),
        format_bytes(max)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_a_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(134_217_728), "128.0 MiB");
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn exit_codes_mirror_the_child() {
        assert_eq!(exit_code(ExitStatus::Exited(3)), (3, None));
        let (code, message) = exit_code(ExitStatus::Signaled {
            signal: libc::SIGKILL,
            core_dumped: false,
        });
        assert_eq!(code, libc::EXIT_FAILURE);
        assert!(message.is_some());
    }
}
