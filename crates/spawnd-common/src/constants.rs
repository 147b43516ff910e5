//! System-wide constants and default paths.

use std::time::Duration;

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Maximum size of one wire protocol datagram.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Maximum number of file descriptors attached to one outgoing datagram.
pub const MAX_FDS: usize = 8;

/// Number of file descriptors the receiving side makes room for.
pub const MAX_RECEIVE_FDS: usize = 32;

/// Request ids occupy the low 30 bits of the wire field.
pub const REQUEST_ID_BITS: u32 = 30;

/// Maximum number of argv entries accepted from the wire.
pub const MAX_ARGS: usize = 16384;

/// Maximum number of environment entries accepted from the wire.
pub const MAX_ENV: usize = 16384;

/// Maximum number of supplementary groups in a [`crate::types::UidGid`].
pub const MAX_GROUPS: usize = 32;

/// Maximum number of exit records packed into one response datagram.
pub const EXIT_BATCH_SIZE: usize = 64;

/// How long the parent waits for the error pipe after `clone3`.
pub const ERROR_PIPE_TIMEOUT: Duration = Duration::from_millis(250);

/// Delay between `SIGTERM` and `SIGKILL` in the cgroup kill sequence.
pub const CGROUP_KILL_TERM_DELAY: Duration = Duration::from_secs(10);

/// Delay between `SIGKILL` and giving up in the cgroup kill sequence.
pub const CGROUP_KILL_KILL_DELAY: Duration = Duration::from_secs(10);

/// Number of outstanding exec requests above which the client is under pressure.
pub const SPAWN_PRESSURE_THRESHOLD: usize = 16;

/// Name of the leaf cgroup the spawner moves itself into.
pub const SPAWNER_LEAF_CGROUP: &str = "_";

/// Where `ip netns` keeps named network namespaces.
pub const NETNS_DIR: &str = "/run/netns";

/// Where named PID namespaces are bind-mounted.
pub const PIDNS_DIR: &str = "/run/pidns";

/// Directory (inside the spawner's private `/tmp`) holding named tmpfs instances.
pub const NAMED_TMPFS_DIR: &str = "/tmp/named-tmpfs";

/// systemd journal stream socket.
pub const JOURNAL_STREAM_SOCKET: &str = "/run/systemd/journal/stdout";

/// Kernel comm name of the spawner process.
pub const SPAWNER_PROCESS_NAME: &str = "spawn";

/// Kernel comm name of the init process inside a new PID namespace.
pub const INIT_PROCESS_NAME: &std::ffi::CStr = c"init";

/// Application name used in log output.
pub const APP_NAME: &str = "spawnd";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "spawnd";
