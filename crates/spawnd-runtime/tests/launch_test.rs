//! Spawning through a launched spawner process.
//!
//! The spawner must be cloned while the process is single-threaded, so
//! this target has its own `main` instead of the libtest harness. It needs
//! `CAP_SYS_ADMIN` (and `CAP_SETGID` for the group checks) and skips
//! itself otherwise.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::print_stderr, missing_docs)]

use std::os::fd::OwnedFd;
use std::time::Duration;

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use spawnd_common::config::SpawnConfig;
use spawnd_common::types::ExitStatus;
use spawnd_core::capability::{self, Capability};
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::uid_gid;
use spawnd_runtime::client::SpawnServerClient;
use spawnd_runtime::launch;
use spawnd_runtime::service::{SpawnService, wait_spawn_completion};
use tokio::sync::oneshot;
use tokio::task::LocalSet;

const EMPTY_GROUPS: &str = r#"grep -q "^Groups:[[:space:]]*$" /proc/self/status"#;

fn shell(script: &str) -> PreparedChildProcess {
    let mut process = PreparedChildProcess::new();
    process.append_arg("/bin/sh");
    process.append_arg("-c");
    process.append_arg(script);
    process
}

fn user_namespace(script: &str, pid_namespace: bool) -> PreparedChildProcess {
    let mut process = shell(script);
    process.ns.enable_user = true;
    process.ns.enable_pid = pid_namespace;
    process
}

async fn run(client: &SpawnServerClient, name: &str, process: PreparedChildProcess) -> ExitStatus {
    let mut handle = client.spawn_child_process(name, process).unwrap();
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    handle.set_exit_listener(Box::new(move |status| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(status);
        }
    }));
    wait_spawn_completion(handle.as_mut())
        .await
        .unwrap_or_else(|e| panic!("{name}: {e}"));
    let status = tokio::time::timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    ExitStatus::from_raw(status)
}

async fn exercise(socket: OwnedFd, config: SpawnConfig, setgid: bool) {
    let client = SpawnServerClient::new(socket, config).unwrap();
    assert_eq!(run(&client, "exit4", shell("exit 4")).await, ExitStatus::Exited(4));

    // The spawner lives in its own PID namespace; the maps must reach
    // the child it just cloned.
    assert_eq!(run(&client, "userns", user_namespace("exit 0", false)).await, ExitStatus::Exited(0));
    assert_eq!(run(&client, "userns-pidns", user_namespace("exit 0", true)).await, ExitStatus::Exited(0));

    if setgid {
        // The daemon's supplementary groups do not leak into the child.
        for (name, pid_namespace) in [("groups", false), ("groups-pidns", true)] {
            let status = run(&client, name, user_namespace(EMPTY_GROUPS, pid_namespace)).await;
            assert_eq!(status, ExitStatus::Exited(0), "{name}");
        }

        let mut process = user_namespace(r#"grep -q "^Groups:[[:space:]]*44[[:space:]]*$" /proc/self/status"#, false);
        process.uid_gid = uid_gid::load_effective();
        process.uid_gid.add_group(44).unwrap();
        assert_eq!(run(&client, "mapped-group", process).await, ExitStatus::Exited(0));
    }

    client.close();
}

fn main() {
    if !capability::has_effective(Capability::SysAdmin) {
        eprintln!("launch_test: skipped, CAP_SYS_ADMIN is missing");
        return;
    }
    let setgid = capability::has_effective(Capability::Setgid);

    let ids = uid_gid::load_effective();
    let mut config = SpawnConfig {
        default_uid_gid: ids.clone(),
        ..SpawnConfig::default()
    };
    config.allowed_uids.extend(ids.uid);
    config.allowed_gids.extend(ids.gid.into_iter().chain([44]));

    let spawner = launch::launch_spawner(config.clone()).expect("launch spawner");
    let pid = spawner.pid;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    LocalSet::new().block_on(&runtime, exercise(spawner.socket, config, setgid));
    drop(runtime);

    // Hanging up makes the spawner exit.
    assert_eq!(waitpid(Pid::from_raw(pid), None).unwrap(), WaitStatus::Exited(Pid::from_raw(pid), 0));
    eprintln!("launch_test: ok");
}
