//! Cross-platform process-tree termination
//!
//! Discovers every descendant of a root process *before* killing anything
//! (killing a parent orphans children and breaks traversal), then applies a
//! graceful-then-forceful two-phase kill and verifies no survivors remain.
//! Survivors are reported, never thrown — the session is already considered
//! stopped by the time this runs.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, info, warn};

/// One row of a process snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
}

/// Platform abstraction over process listing and signalling.
///
/// Production uses the OS backend; tests substitute a fake table so each
/// branch of the kill algorithm is exercised deterministically.
pub trait ProcessBackend: Send + Sync {
    /// Snapshot of all (pid, ppid) pairs currently visible.
    fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>>;

    /// Signal one process. `force` selects the non-catchable kill.
    fn terminate(&self, pid: u32, force: bool);

    /// Signal a whole process group rooted at `pgid`.
    fn terminate_group(&self, pgid: u32, force: bool);

    /// Is the process still alive?
    fn alive(&self, pid: u32) -> bool;
}

/// Result of one tree termination
#[derive(Debug, Clone)]
pub struct KillOutcome {
    /// No process of the tree survived the verification pass
    pub clean: bool,
    /// Pids still alive after the forceful phase
    pub survivors: Vec<u32>,
}

/// Walk parent→child links breadth-first from `root`, deduplicated.
/// The root itself is not included.
pub fn discover_descendants(root: u32, snapshot: &[ProcessEntry]) -> Vec<u32> {
    let mut found = Vec::new();
    let mut seen: HashSet<u32> = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        for entry in snapshot.iter().filter(|e| e.ppid == parent) {
            if seen.insert(entry.pid) {
                found.push(entry.pid);
                queue.push_back(entry.pid);
            }
        }
    }
    found
}

/// Two-phase process-tree killer
pub struct ProcessTreeReaper {
    backend: Box<dyn ProcessBackend>,
    grace: Duration,
}

impl ProcessTreeReaper {
    /// Reaper over the current platform's backend.
    pub fn new(grace: Duration) -> Self {
        Self {
            backend: Box::new(platform::OsBackend),
            grace,
        }
    }

    /// Reaper over an injected backend (tests).
    pub fn with_backend(backend: Box<dyn ProcessBackend>, grace: Duration) -> Self {
        Self { backend, grace }
    }

    /// Terminate `root` and its whole tree.
    pub async fn kill_tree(&self, root: u32) -> KillOutcome {
        // Phase 0: discovery, before any signal is sent.
        let descendants = match self.backend.snapshot() {
            Ok(snapshot) => discover_descendants(root, &snapshot),
            Err(e) => {
                warn!(
                    component = "reaper",
                    event = "reaper.snapshot_failed",
                    root = root,
                    error = %e,
                    "Process snapshot unavailable, killing root only"
                );
                Vec::new()
            }
        };

        debug!(
            component = "reaper",
            event = "reaper.discovered",
            root = root,
            descendants = ?descendants,
        );

        // Phase 1: graceful terminate, root plus its process group.
        self.backend.terminate(root, false);
        self.backend.terminate_group(root, false);

        // Phase 2: bounded grace period, leaving early once everything died.
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            let any_alive =
                self.backend.alive(root) || descendants.iter().any(|&p| self.backend.alive(p));
            if !any_alive || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200).min(self.grace)).await;
        }

        // Phase 3: force-kill root, group, and every discovered descendant
        // individually — group-kill is not guaranteed complete everywhere.
        self.backend.terminate(root, true);
        self.backend.terminate_group(root, true);
        for &pid in &descendants {
            self.backend.terminate(pid, true);
        }

        // Phase 4: verify by re-enumeration from the original root.
        let mut survivors: Vec<u32> = match self.backend.snapshot() {
            Ok(snapshot) => discover_descendants(root, &snapshot)
                .into_iter()
                .filter(|&p| self.backend.alive(p))
                .collect(),
            Err(_) => Vec::new(),
        };
        if self.backend.alive(root) {
            survivors.insert(0, root);
        }

        if survivors.is_empty() {
            info!(
                component = "reaper",
                event = "reaper.tree_killed",
                root = root,
                descendant_count = descendants.len(),
            );
            KillOutcome {
                clean: true,
                survivors,
            }
        } else {
            warn!(
                component = "reaper",
                event = "reaper.survivors",
                root = root,
                survivors = ?survivors,
                "Process tree kill left survivors, manual cleanup may be needed"
            );
            KillOutcome {
                clean: false,
                survivors,
            }
        }
    }
}

#[cfg(unix)]
mod platform {
    use super::{ProcessBackend, ProcessEntry};

    /// `ps`-snapshot + signal(2) backend
    pub struct OsBackend;

    impl ProcessBackend for OsBackend {
        fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>> {
            let output = std::process::Command::new("ps")
                .args(["-axo", "pid=,ppid="])
                .output()?;
            let text = String::from_utf8_lossy(&output.stdout);
            Ok(text
                .lines()
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let pid = fields.next()?.parse().ok()?;
                    let ppid = fields.next()?.parse().ok()?;
                    Some(ProcessEntry { pid, ppid })
                })
                .collect())
        }

        fn terminate(&self, pid: u32, force: bool) {
            let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }

        fn terminate_group(&self, pgid: u32, force: bool) {
            let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
            unsafe {
                libc::kill(-(pgid as i32), signal);
            }
        }

        fn alive(&self, pid: u32) -> bool {
            if pid == 0 {
                return false;
            }
            // kill(pid, 0) probes existence without sending a signal;
            // EPERM still means the process exists.
            unsafe {
                if libc::kill(pid as i32, 0) == 0 {
                    return true;
                }
            }
            matches!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(code) if code == libc::EPERM
            )
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::{ProcessBackend, ProcessEntry};

    /// `wmic` snapshot + `taskkill` backend
    pub struct OsBackend;

    impl ProcessBackend for OsBackend {
        fn snapshot(&self) -> std::io::Result<Vec<ProcessEntry>> {
            let output = std::process::Command::new("wmic")
                .args(["process", "get", "ProcessId,ParentProcessId", "/format:csv"])
                .output()?;
            let text = String::from_utf8_lossy(&output.stdout);
            Ok(text
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let mut fields = line.trim().split(',');
                    let _node = fields.next()?;
                    let ppid = fields.next()?.trim().parse().ok()?;
                    let pid = fields.next()?.trim().parse().ok()?;
                    Some(ProcessEntry { pid, ppid })
                })
                .collect())
        }

        fn terminate(&self, pid: u32, force: bool) {
            let mut cmd = std::process::Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            let _ = cmd.args(["/PID", &pid.to_string()]).output();
        }

        fn terminate_group(&self, pgid: u32, force: bool) {
            // Closest analogue: taskkill's own tree kill.
            let mut cmd = std::process::Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            let _ = cmd.args(["/T", "/PID", &pgid.to_string()]).output();
        }

        fn alive(&self, pid: u32) -> bool {
            std::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}")])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }
    }
}
