use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::TempDir;

fn read_to_string_best_effort(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn write_config(dir: &TempDir, peer: &TempDir) {
    let config_dir = dir.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let peer_sock = peer.path().join("agentmail.sock");
    fs::write(
        config_dir.join("config.toml"),
        format!(
            "project-id = \"fleet\"\n\n[relay]\npeers = [\"unix:{}\"]\nreconnect-interval-ms = 100\n",
            peer_sock.display()
        ),
    )
    .unwrap();
}

fn wait_for_daemon_ready(dir: &TempDir) {
    let log_path = dir.path().join("agentmail.log");
    let sock_path = dir.path().join("agentmail.sock");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if Instant::now() > deadline {
            let log = read_to_string_best_effort(&log_path);
            panic!("timed out waiting for daemon ready; log was: {log}");
        }

        if sock_path.exists() {
            let log = read_to_string_best_effort(&log_path);
            if log.contains("daemon ready") {
                return;
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

fn spawn_daemon(dir: &TempDir) -> std::process::Child {
    let child = Command::new(assert_cmd::cargo::cargo_bin!("am"))
        .env("AGENTMAIL_DIR", dir.path())
        .args(["server", "start", "--foreground"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for_daemon_ready(dir);
    child
}

fn shutdown_daemon(dir: &TempDir, mut child: std::process::Child) {
    let mut shutdown = cargo_bin_cmd!("am");
    shutdown.env("AGENTMAIL_DIR", dir.path());
    shutdown.args(["server", "stop"]);
    shutdown.assert().success();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if child.try_wait().unwrap().is_some() {
            break;
        }
        if Instant::now() > deadline {
            let pid = Pid::from_raw(child.id() as i32);
            let _ = kill(pid, Signal::SIGKILL);
            panic!("timed out waiting for daemon to exit after shutdown");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn am(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("am");
    cmd.env("AGENTMAIL_DIR", dir.path());
    cmd.env_remove("AGENTMAIL_AGENT");
    cmd
}

fn send(dir: &TempDir, to: &str, body: &str) -> String {
    let out = am(dir)
        .args(["send", "--from", "alice", to, body])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(out).unwrap().trim().to_owned()
}

fn wait_for_file(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn two_daemons_converge_without_echo() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_config(&a, &b);
    write_config(&b, &a);

    let daemon_a = spawn_daemon(&a);
    let daemon_b = spawn_daemon(&b);

    let topic_id = send(&a, "task", "from a");
    let dm_id = send(&b, "@bob", "from b");

    wait_for_file(&b.path().join("mail/topics/task").join(format!("{topic_id}.json")));
    wait_for_file(&a.path().join("mail/dm/bob").join(format!("{dm_id}.json")));

    am(&b)
        .args(["watch", "task", "--all", "--count", "1", "--timeout-secs", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&topic_id));

    // Give any echo a chance to show up before counting.
    std::thread::sleep(Duration::from_millis(500));
    for dir in [&a, &b] {
        am(dir)
            .args(["read", "task"])
            .assert()
            .success()
            .stdout(predicate::str::contains(&topic_id).count(1));
        am(dir)
            .args(["read", "@bob", "--agent", "bob"])
            .assert()
            .success()
            .stdout(predicate::str::contains(&dm_id).count(1));
    }

    let cursors = read_to_string_best_effort(&b.path().join("runtime/relay-cursors.json"));
    assert!(cursors.contains("fleet"), "cursors were: {cursors}");

    shutdown_daemon(&a, daemon_a);
    shutdown_daemon(&b, daemon_b);
}
