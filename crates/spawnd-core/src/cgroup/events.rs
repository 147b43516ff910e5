//! Parsers for cgroup control files.

/// Reads the `populated` key of `cgroup.events`.
#[must_use]
pub fn parse_populated(events: &str) -> Option<bool> {
    events
        .lines()
        .find_map(|line| line.strip_prefix("populated "))
        .map(|value| value.trim() != "0")
}

/// Parses `cgroup.procs` into process ids, skipping garbage lines.
#[must_use]
pub fn parse_procs(procs: &str) -> Vec<libc::pid_t> {
    procs.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

/// Parses a single-value file such as `memory.current` or `memory.max`;
/// `max` is [`u64::MAX`].
#[must_use]
pub fn parse_value(text: &str) -> Option<u64> {
    match text.trim() {
        "max" => Some(u64::MAX),
        value => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populated_flag() {
        assert_eq!(parse_populated("populated 1\nfrozen 0\n"), Some(true));
        assert_eq!(parse_populated("populated 0\nfrozen 0\n"), Some(false));
        assert_eq!(parse_populated("frozen 0\n"), None);
    }

    #[test]
    fn procs_list() {
        assert_eq!(parse_procs("12\n345\n\n"), vec![12, 345]);
    }

    #[test]
    fn values() {
        assert_eq!(parse_value("4096\n"), Some(4096));
        assert_eq!(parse_value("max\n"), Some(u64::MAX));
        assert_eq!(parse_value("garbage"), None);
    }
}
