//! Enabling controllers for the spawner's child cgroups.

use std::os::fd::BorrowedFd;

use spawnd_common::constants::SPAWNER_LEAF_CGROUP;
use spawnd_common::error::Result;

use super::{CgroupState, c_name, disabled, io_error, read_file_at, write_file_at};
use crate::sys;

/// Leaf weights that keep the spawner from being starved by its children.
const LEAF_WEIGHTS: &[(&str, &str)] = &[
    ("cpu.weight", "1000"),
    ("io.weight", "1000"),
    ("io.bfq.weight", "1000"),
];

/// Builds the `cgroup.subtree_control` line enabling every available
/// controller except `cpuset`.
#[must_use]
pub fn subtree_control_line(controllers: &str) -> String {
    controllers
        .split_whitespace()
        .filter(|controller| *controller != "cpuset")
        .map(|controller| format!("+{controller}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Moves the calling process into the leaf cgroup `_` and enables all
/// controllers for the delegated group's children.
///
/// A cgroup with member processes cannot delegate controllers, hence the
/// leaf.
///
/// # Errors
///
/// Returns an error if the leaf cannot be created or joined, or the
/// controllers cannot be enabled.
pub fn enable_all_controllers(state: &CgroupState) -> Result<()> {
    let group = state.group_fd().ok_or_else(disabled)?;

    match sys::mkdirat(Some(group), &c_name(SPAWNER_LEAF_CGROUP)?, 0o777) {
        Err(e) if e.raw_os_error() != Some(libc::EEXIST) => {
            return Err(io_error(state, SPAWNER_LEAF_CGROUP, e));
        }
        _ => {}
    }
    let leaf_procs = format!("{SPAWNER_LEAF_CGROUP}/cgroup.procs");
    write_file_at(group, &leaf_procs, b"0").map_err(|e| io_error(state, &leaf_procs, e))?;

    let available = read_file_at(group, "cgroup.controllers").map_err(|e| io_error(state, "cgroup.controllers", e))?;
    let line = subtree_control_line(&available);
    if !line.is_empty() {
        write_file_at(group, "cgroup.subtree_control", line.as_bytes())
            .map_err(|e| io_error(state, "cgroup.subtree_control", e))?;
    }
    tracing::info!(controllers = %line, "enabled cgroup controllers");

    raise_leaf_weights(group);
    Ok(())
}

fn raise_leaf_weights(group: BorrowedFd<'_>) {
    for (file, value) in LEAF_WEIGHTS {
        let path = format!("{SPAWNER_LEAF_CGROUP}/{file}");
        if let Err(e) = write_file_at(group, &path, value.as_bytes()) {
            tracing::debug!(file = %path, error = %e, "could not raise weight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuset_is_skipped() {
        assert_eq!(subtree_control_line("cpuset cpu io memory pids\n"), "+cpu +io +memory +pids");
        assert_eq!(subtree_control_line(""), "");
    }

    #[test]
    fn enables_controllers_in_fake_hierarchy() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join("cgroup.controllers"), "cpuset cpu memory\n").expect("write");
        std::fs::write(root.path().join("cgroup.subtree_control"), "").expect("write");
        std::fs::create_dir(root.path().join("_")).expect("mkdir");
        std::fs::write(root.path().join("_/cgroup.procs"), "").expect("write");

        let state = CgroupState::from_group(root.path(), "/").expect("state");
        enable_all_controllers(&state).expect("enable");

        assert_eq!(
            std::fs::read_to_string(root.path().join("cgroup.subtree_control")).expect("read"),
            "+cpu +memory"
        );
        assert_eq!(std::fs::read_to_string(root.path().join("_/cgroup.procs")).expect("read"), "0");
    }
}
