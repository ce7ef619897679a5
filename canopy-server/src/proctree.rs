//! Process-tree operations for detached children.
//!
//! There is no portable "kill process tree" primitive, and detached
//! children deliver no exit event to a supervisor that has restarted since
//! spawning them. Liveness is therefore a process-table poll, and stop is
//! an escalation ladder: signal the process group, then every same-session
//! process, then descendants bottom-up, then the pid itself; SIGTERM first,
//! SIGKILL once after a grace period, then give up.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Process-table check. Zombies count as dead: a zombie cannot be
/// usefully signaled and only awaits reaping.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), false);
    match sys.process(Pid::from_u32(pid)) {
        Some(proc_) => !matches!(proc_.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

fn full_snapshot() -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys
}

/// Send `sig` to one pid. Failures mean "already gone" and are ignored.
fn signal_pid(pid: u32, sig: libc::c_int) {
    unsafe {
        let _ = libc::kill(pid as libc::pid_t, sig);
    }
}

/// Send `sig` to a whole process group.
fn signal_group(pgid: u32, sig: libc::c_int) {
    unsafe {
        let _ = libc::kill(-(pgid as libc::pid_t), sig);
    }
}

/// All live descendants of `root`, ordered children-before-parents so a
/// bottom-up kill never re-parents grandchildren mid-walk.
fn descendants_bottom_up(sys: &System, root: u32) -> Vec<u32> {
    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, proc_) in sys.processes() {
        if let Some(parent) = proc_.parent() {
            children_of
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    // Discovery order puts every parent before its own descendants, so the
    // reversed list is safe to kill front-to-back.
    let mut ordered = Vec::new();
    let mut seen = std::collections::HashSet::from([root]);
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(children) = children_of.get(&pid) {
            for &child in children {
                if seen.insert(child) {
                    ordered.push(child);
                    queue.push(child);
                }
            }
        }
    }
    ordered.reverse();
    ordered
}

/// Pids sharing the root's session, excluding the root itself. Detached
/// children run `setsid`-style, so the session id is the root pid.
fn same_session(sys: &System, root: u32) -> Vec<u32> {
    sys.processes()
        .iter()
        .filter(|(pid, proc_)| {
            pid.as_u32() != root
                && proc_
                    .session_id()
                    .is_some_and(|sid| sid.as_u32() == root)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn signal_tree(sys: &System, root: u32, sig: libc::c_int) {
    signal_group(root, sig);
    for pid in same_session(sys, root) {
        signal_pid(pid, sig);
    }
    for pid in descendants_bottom_up(sys, root) {
        signal_pid(pid, sig);
    }
    signal_pid(root, sig);
}

/// Terminate `root` and everything under it. SIGTERM the full ladder,
/// wait `grace`, then SIGKILL the ladder exactly once if anything is left.
pub async fn kill_tree(root: u32, grace: Duration) {
    let sys = full_snapshot();
    signal_tree(&sys, root, libc::SIGTERM);

    tokio::time::sleep(grace).await;
    if !pid_alive(root) && descendants_bottom_up(&full_snapshot(), root).is_empty() {
        return;
    }

    let sys = full_snapshot();
    signal_tree(&sys, root, libc::SIGKILL);
}

/// Last-resort sweep: terminate leftover dev-tool processes still running
/// inside `dir`. Matches on process name so unrelated processes that
/// merely share the directory (editors, shells) are left alone.
/// Returns how many pids were signaled.
pub fn sweep_workdir(dir: &Path, names: &[&str]) -> usize {
    let sys = full_snapshot();
    let mut swept = 0;
    for (pid, proc_) in sys.processes() {
        let in_dir = proc_.cwd().is_some_and(|cwd| cwd == dir);
        if !in_dir {
            continue;
        }
        let name = proc_.name().to_string_lossy().to_lowercase();
        if names.iter().any(|n| name.contains(n)) {
            signal_pid(pid.as_u32(), libc::SIGTERM);
            swept += 1;
        }
    }
    swept
}
