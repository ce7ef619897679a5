//! End-to-end tests driving the daemon binary over its control socket.

mod support;

use serde_json::json;
use std::time::Duration;
use support::{TestDaemon, wait_for};
use tempfile::TempDir;

fn start_command(workdir: &std::path::Path, script: &str) -> serde_json::Value {
    json!({
        "command": "start",
        "path": workdir.to_string_lossy(),
        "run": "sh",
        "args": ["-c", script],
    })
}

fn status_of(daemon: &TestDaemon, id: &str) -> String {
    let data = daemon.request_ok(&json!({"command": "get", "id": id}));
    data["status"].as_str().unwrap().to_string()
}

fn pid_running(pid: u32) -> bool {
    // Signal 0 probes existence without touching the process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn health_answers_on_a_fresh_daemon() {
    let daemon = TestDaemon::spawn();
    let data = daemon.request_ok(&json!({"command": "health"}));
    assert_eq!(data["status"], "ok");
    assert_eq!(data["server_count"], 0);

    let data = daemon.request_ok(&json!({"command": "list"}));
    assert_eq!(data["servers"].as_array().unwrap().len(), 0);
}

#[test]
fn lifecycle_start_ready_logs_stop() {
    let daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();

    let data = daemon.request_ok(&start_command(
        &wt_a,
        "echo 'Local: http://127.0.0.2:3000/'; sleep 60",
    ));
    let id = data["id"].as_str().unwrap().to_string();
    let pid = data["pid"].as_u64().unwrap() as u32;
    assert_eq!(data["status"], "starting");
    assert_eq!(data["host"], "127.0.0.2");

    assert!(
        wait_for(Duration::from_secs(10), || status_of(&daemon, &id)
            == "running"),
        "server never became running"
    );

    let data = daemon.request_ok(&json!({"command": "logs", "id": id, "tail": 50}));
    let logs = data["logs"].as_array().unwrap();
    assert!(
        logs.iter()
            .any(|l| l["line"].as_str().unwrap().contains("Local: http://")),
        "{logs:?}"
    );

    daemon.request_ok(&json!({"command": "stop", "id": id}));
    assert!(
        wait_for(Duration::from_secs(5), || !pid_running(pid)),
        "child survived stop"
    );

    let data = daemon.request_ok(&json!({"command": "list"}));
    assert_eq!(data["servers"].as_array().unwrap().len(), 0);
}

#[test]
fn hosts_are_distinct_and_reused_after_stop() {
    let daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    let wt_b = worktrees.path().join("wt-b");
    let wt_c = worktrees.path().join("wt-c");
    for dir in [&wt_a, &wt_b, &wt_c] {
        std::fs::create_dir_all(dir).unwrap();
    }

    let a = daemon.request_ok(&start_command(&wt_a, "sleep 60"));
    let b = daemon.request_ok(&start_command(&wt_b, "sleep 60"));
    assert_eq!(a["host"], "127.0.0.2");
    assert_eq!(b["host"], "127.0.0.3");

    daemon.request_ok(&json!({"command": "stop", "id": a["id"]}));

    let c = daemon.request_ok(&start_command(&wt_c, "sleep 60"));
    assert_eq!(c["host"], "127.0.0.2", "freed host should be first-fit reused");

    daemon.request_ok(&json!({"command": "stop", "id": b["id"]}));
    daemon.request_ok(&json!({"command": "stop", "id": c["id"]}));
}

#[test]
fn failure_banner_marks_server_error() {
    let daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();

    let data = daemon.request_ok(&start_command(
        &wt_a,
        "echo \"Error: Cannot find module 'vite'\" >&2; sleep 60",
    ));
    let id = data["id"].as_str().unwrap().to_string();

    assert!(
        wait_for(Duration::from_secs(10), || status_of(&daemon, &id) == "error"),
        "server never transitioned to error"
    );

    daemon.request_ok(&json!({"command": "stop", "id": id}));
}

#[test]
fn exited_child_is_pruned_from_the_registry() {
    let daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();

    let data = daemon.request_ok(&start_command(&wt_a, "echo ready; sleep 1"));
    let id = data["id"].as_str().unwrap().to_string();

    assert!(
        wait_for(Duration::from_secs(10), || {
            let resp = daemon.request(&json!({"command": "get", "id": id}));
            resp["status"] == "error" && resp["message"]
                .as_str()
                .is_some_and(|m| m.contains("no server for id"))
        }),
        "dead server was never pruned"
    );
}

#[test]
fn invalid_target_and_bad_manifest_fail_fast() {
    let daemon = TestDaemon::spawn();

    let resp = daemon.request(&json!({
        "command": "start",
        "path": "/no/such/worktree",
    }));
    assert_eq!(resp["status"], "error");
    assert!(
        resp["message"].as_str().unwrap().contains("invalid target"),
        "{resp}"
    );

    // Default launcher is npm, which requires a package.json.
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();
    let resp = daemon.request(&json!({
        "command": "start",
        "path": wt_a.to_string_lossy(),
    }));
    assert_eq!(resp["status"], "error");
    assert!(
        resp["message"].as_str().unwrap().contains("package.json"),
        "{resp}"
    );
}

#[test]
fn daemon_restart_reattaches_running_servers() {
    let mut daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();

    let data = daemon.request_ok(&start_command(
        &wt_a,
        "echo 'listening on http://127.0.0.2:3000'; sleep 120",
    ));
    let id = data["id"].as_str().unwrap().to_string();
    let pid = data["pid"].as_u64().unwrap() as u32;

    assert!(
        wait_for(Duration::from_secs(10), || status_of(&daemon, &id)
            == "running"),
        "server never became running"
    );

    // The child must survive the daemon going away entirely.
    daemon.restart();
    assert!(pid_running(pid), "detached child died with the daemon");

    let data = daemon.request_ok(&json!({"command": "list"}));
    let servers = data["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1, "restarted daemon lost the record");
    assert_eq!(servers[0]["pid"].as_u64().unwrap() as u32, pid);
    assert_eq!(servers[0]["status"], "running");
    assert_eq!(servers[0]["host"], "127.0.0.2");

    // Rebuilt buffers hold the tail of the capture files.
    let data = daemon.request_ok(&json!({"command": "logs", "id": id, "tail": 50}));
    let logs = data["logs"].as_array().unwrap();
    assert!(
        logs.iter()
            .any(|l| l["line"].as_str().unwrap().contains("listening on")),
        "{logs:?}"
    );

    daemon.request_ok(&json!({"command": "stop", "id": id}));
    assert!(
        wait_for(Duration::from_secs(5), || !pid_running(pid)),
        "re-attached child survived stop"
    );
}

#[test]
fn daemon_restart_drops_dead_orphans() {
    let mut daemon = TestDaemon::spawn();
    let worktrees = TempDir::new().unwrap();
    let wt_a = worktrees.path().join("wt-a");
    std::fs::create_dir_all(&wt_a).unwrap();

    let data = daemon.request_ok(&start_command(&wt_a, "sleep 120"));
    let id = data["id"].as_str().unwrap().to_string();
    let pid = data["pid"].as_u64().unwrap() as u32;

    // Kill the child while the daemon is down, so only reconciliation can
    // notice.
    daemon.shutdown();
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    assert!(wait_for(Duration::from_secs(5), || !pid_running(pid)));

    daemon.restart();
    let resp = daemon.request(&json!({"command": "get", "id": id}));
    assert_eq!(resp["status"], "error");
    assert!(
        resp["message"].as_str().unwrap().contains("no server for id"),
        "{resp}"
    );

    // The dead orphan's host is back in the pool.
    let wt_b = worktrees.path().join("wt-b");
    std::fs::create_dir_all(&wt_b).unwrap();
    let b = daemon.request_ok(&start_command(&wt_b, "sleep 60"));
    assert_eq!(b["host"], "127.0.0.2");
    daemon.request_ok(&json!({"command": "stop", "id": b["id"]}));
}
