use std::fs;
use std::io::{BufRead as _, BufReader, Read as _};
use std::os::unix::net::UnixListener;
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
    shutdown.assert().success().stdout(predicate::str::contains("ok"));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            assert!(status.success(), "status: {status:?}");
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

/// Waits for a daemon to answer pings. Needed after a restart, when the log
/// already holds the previous run's ready line.
fn wait_for_ping(dir: &TempDir) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if am(dir).arg("ping").output().unwrap().status.success() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("daemon never answered");
}

fn kill_daemon(mut child: std::process::Child) {
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.wait();
}

fn am(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("am");
    cmd.env("AGENTMAIL_DIR", dir.path());
    cmd.env_remove("AGENTMAIL_AGENT");
    cmd
}

#[test]
fn server_status_follows_daemon_lifecycle() {
    let dir = TempDir::new().unwrap();

    am(&dir)
        .args(["server", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));

    let daemon = spawn_daemon(&dir);

    am(&dir)
        .args(["server", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("running"));
    am(&dir)
        .args(["ping"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok\tdefault"));

    shutdown_daemon(&dir, daemon);
    assert!(!dir.path().join("agentmail.sock").exists());

    am(&dir)
        .args(["server", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));
}

#[test]
fn send_through_daemon_then_replay() {
    let dir = TempDir::new().unwrap();
    let daemon = spawn_daemon(&dir);

    let out = am(&dir)
        .args(["send", "--from", "alice", "task", "via daemon"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let id = String::from_utf8(out).unwrap().trim().to_owned();
    assert!(dir
        .path()
        .join("mail/topics/task")
        .join(format!("{id}.json"))
        .exists());

    am(&dir)
        .args(["watch", "task", "--all", "--count", "1", "--timeout-secs", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id))
        .stdout(predicate::str::contains("via daemon"));

    shutdown_daemon(&dir, daemon);
}

#[test]
fn live_watch_receives_new_messages() {
    let dir = TempDir::new().unwrap();
    let daemon = spawn_daemon(&dir);

    let mut watcher = Command::new(assert_cmd::cargo::cargo_bin!("am"))
        .env("AGENTMAIL_DIR", dir.path())
        .args(["watch", "task", "--all", "--count", "2", "--timeout-secs", "15"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    for body in ["one", "two"] {
        am(&dir)
            .args(["send", "--from", "alice", "task", body])
            .assert()
            .success();
    }

    let status = watcher.wait().unwrap();
    assert!(status.success(), "status: {status:?}");
    let mut stdout = String::new();
    watcher
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "stdout was: {stdout}");
    assert!(lines[0].ends_with("\tone"));
    assert!(lines[1].ends_with("\ttwo"));

    shutdown_daemon(&dir, daemon);
}

#[test]
fn register_and_list_agents_through_daemon() {
    let dir = TempDir::new().unwrap();
    let daemon = spawn_daemon(&dir);

    am(&dir)
        .args(["register", "alice", "--status", "reviewing"])
        .assert()
        .success();
    am(&dir)
        .args(["agents"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice\tonline"))
        .stdout(predicate::str::contains("reviewing"));

    shutdown_daemon(&dir, daemon);
}

#[test]
fn socket_is_private() {
    use std::os::unix::fs::PermissionsExt as _;

    let dir = TempDir::new().unwrap();
    let daemon = spawn_daemon(&dir);

    let mode = fs::metadata(dir.path().join("agentmail.sock"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    shutdown_daemon(&dir, daemon);
}

#[test]
fn late_daemon_reply_fails_the_send_without_a_second_copy() {
    let dir = TempDir::new().unwrap();
    let listener = UnixListener::bind(dir.path().join("agentmail.sock")).unwrap();

    // Takes the request, then stays silent past the client's read timeout.
    let stalled = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line).unwrap();
        std::thread::sleep(Duration::from_secs(4));
        line
    });

    am(&dir)
        .args(["send", "--from", "alice", "task", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no response"))
        .stderr(predicate::str::contains("may have been delivered"));

    assert!(!dir.path().join("mail/topics/task").exists());
    assert!(stalled.join().unwrap().contains("mail.send"));
}

#[test]
fn daemon_records_sender_host() {
    let dir = TempDir::new().unwrap();
    let daemon = spawn_daemon(&dir);

    am(&dir)
        .env("HOSTNAME", "build-7")
        .args(["send", "--from", "alice", "task", "hi"])
        .assert()
        .success();
    am(&dir)
        .args(["agents"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("build-7"));

    shutdown_daemon(&dir, daemon);
}

#[test]
fn watch_survives_daemon_restart_without_gaps() {
    let dir = TempDir::new().unwrap();
    let config_dir = dir.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.toml"), "[watch]\nrediscover-ms = 200\n").unwrap();

    let daemon = spawn_daemon(&dir);
    let mut watcher = Command::new(assert_cmd::cargo::cargo_bin!("am"))
        .env("AGENTMAIL_DIR", dir.path())
        .args(["watch", "task", "--all", "--count", "4", "--timeout-secs", "30"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut lines = BufReader::new(watcher.stdout.take().unwrap()).lines();
    std::thread::sleep(Duration::from_millis(300));

    // Every send lands in its own second so ids follow send order even
    // though each writer picks its own sequence offset.
    let pause = || std::thread::sleep(Duration::from_millis(1100));
    let send = |body: &str| {
        am(&dir)
            .args(["send", "--from", "alice", "task", body])
            .assert()
            .success();
    };

    send("a1");
    let first = lines.next().unwrap().unwrap();
    assert!(first.ends_with("\ta1"), "got: {first}");

    kill_daemon(daemon);
    pause();
    send("g1");
    pause();
    send("g2");
    pause();

    let respawned = Command::new(assert_cmd::cargo::cargo_bin!("am"))
        .env("AGENTMAIL_DIR", dir.path())
        .args(["server", "start", "--foreground"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    wait_for_ping(&dir);
    pause();
    send("b1");

    let mut got = vec![first];
    for line in lines.by_ref().take(3) {
        got.push(line.unwrap());
    }
    let status = watcher.wait().unwrap();
    assert!(status.success(), "status: {status:?}");
    assert!(lines.next().is_none(), "watch printed more than four messages");

    let bodies: Vec<&str> = got.iter().map(|l| l.rsplit('\t').next().unwrap()).collect();
    assert_eq!(bodies, ["a1", "g1", "g2", "b1"]);
    let ids: Vec<&str> = got.iter().map(|l| l.split('\t').next().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids out of order: {ids:?}");

    shutdown_daemon(&dir, respawned);
}
