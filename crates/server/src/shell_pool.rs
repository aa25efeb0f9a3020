//! Interactive shell pool
//!
//! One pseudo-terminal per session, created lazily and reused for manual
//! command execution alongside the agent. Raw output is forwarded on the
//! event bus tagged with the owning session id; closing reaps the shell's
//! full process tree.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};

use drydock_protocol::DockEvent;

use crate::events::EventBus;
use crate::reaper::ProcessTreeReaper;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to create pseudo-terminal: {0}")]
    PtyCreate(String),

    #[error("no shell session for {0}")]
    NotFound(String),

    #[error("shell io error: {0}")]
    Io(#[from] std::io::Error),
}

struct ShellSession {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
}

/// Lazily-created interactive shells, one per session
pub struct ShellPool {
    shells: DashMap<String, Arc<ShellSession>>,
    events: EventBus,
    reaper: Arc<ProcessTreeReaper>,
}

impl ShellPool {
    pub fn new(events: EventBus, reaper: Arc<ProcessTreeReaper>) -> Self {
        Self {
            shells: DashMap::new(),
            events,
            reaper,
        }
    }

    /// Create the session's shell if it does not exist yet.
    pub fn ensure_session(&self, session_id: &str, cwd: &Path) -> Result<(), ShellError> {
        if self.shells.contains_key(session_id) {
            return Ok(());
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::PtyCreate(e.to_string()))?;

        let mut cmd = CommandBuilder::new(default_shell());
        cmd.cwd(cwd);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ShellError::PtyCreate(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        // Collect the exit status so a closed shell never lingers as a
        // zombie under this process.
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::PtyCreate(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShellError::PtyCreate(e.to_string()))?;

        info!(
            component = "shell_pool",
            event = "shell.created",
            session_id = %session_id,
            pid = ?pid,
            cwd = %cwd.display(),
        );

        // Blocking PTY reads stay off the async runtime.
        let events = self.events.clone();
        let sid = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        events.publish(DockEvent::TerminalOutput {
                            session_id: sid.clone(),
                            data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        });
                    }
                }
            }
            debug!(
                component = "shell_pool",
                event = "shell.reader_closed",
                session_id = %sid,
            );
        });

        self.shells.insert(
            session_id.to_string(),
            Arc::new(ShellSession {
                pid,
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
            }),
        );
        Ok(())
    }

    /// Send one command line (a carriage return is appended).
    pub fn send_command(&self, session_id: &str, line: &str) -> Result<(), ShellError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\r');
        self.send_raw_input(session_id, &bytes)
    }

    /// Write raw bytes (keystrokes, control sequences) to the terminal.
    pub fn send_raw_input(&self, session_id: &str, bytes: &[u8]) -> Result<(), ShellError> {
        let shell = self
            .shells
            .get(session_id)
            .ok_or_else(|| ShellError::NotFound(session_id.to_string()))?;
        let mut writer = shell
            .writer
            .lock()
            .map_err(|_| ShellError::NotFound(session_id.to_string()))?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ShellError> {
        let shell = self
            .shells
            .get(session_id)
            .ok_or_else(|| ShellError::NotFound(session_id.to_string()))?;
        let master = shell
            .master
            .lock()
            .map_err(|_| ShellError::NotFound(session_id.to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::PtyCreate(e.to_string()))?;
        Ok(())
    }

    /// Close the session's shell and reap its process tree.
    ///
    /// Survivors produce a zombie warning event, not a failure — the shell
    /// itself is gone either way.
    pub async fn close(&self, session_id: &str) {
        let Some((_, shell)) = self.shells.remove(session_id) else {
            return;
        };

        if let Some(pid) = shell.pid {
            let outcome = self.reaper.kill_tree(pid).await;
            if !outcome.clean {
                warn!(
                    component = "shell_pool",
                    event = "shell.zombies_detected",
                    session_id = %session_id,
                    survivors = ?outcome.survivors,
                );
                self.events.publish(DockEvent::ZombieProcessesDetected {
                    session_id: session_id.to_string(),
                    pids: outcome.survivors,
                });
            }
        }

        self.events.publish(DockEvent::TerminalClosed {
            session_id: session_id.to_string(),
        });
        info!(
            component = "shell_pool",
            event = "shell.closed",
            session_id = %session_id,
        );
    }

    /// Close every shell (server shutdown).
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.shells.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool() -> (ShellPool, EventBus) {
        let events = EventBus::new();
        let reaper = Arc::new(ProcessTreeReaper::new(Duration::from_secs(1)));
        (ShellPool::new(events.clone(), reaper), events)
    }

    #[tokio::test]
    async fn echo_round_trips_through_the_pty() {
        let (pool, events) = pool();
        let mut rx = events.subscribe();
        let cwd = std::env::temp_dir();

        pool.ensure_session("sess-1", &cwd).unwrap();
        pool.send_command("sess-1", "echo dry$((1000+234))dock").unwrap();

        let mut seen = String::new();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(DockEvent::TerminalOutput { session_id, data }) = rx.recv().await {
                    assert_eq!(session_id, "sess-1");
                    seen.push_str(&data);
                    // Match on the computed value so the echoed command
                    // itself cannot satisfy the assertion.
                    if seen.contains("dry1234dock") {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(found.is_ok(), "never saw command output; got: {seen}");

        pool.close("sess-1").await;
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_close_emits_terminal_closed() {
        let (pool, events) = pool();
        let cwd = std::env::temp_dir();

        pool.ensure_session("sess-2", &cwd).unwrap();
        pool.ensure_session("sess-2", &cwd).unwrap();

        let mut rx = events.subscribe();
        pool.close("sess-2").await;

        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(DockEvent::TerminalClosed { session_id }) => {
                        assert_eq!(session_id, "sess-2");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_session_errors() {
        let (pool, _events) = pool();
        let err = pool.send_command("missing", "ls").unwrap_err();
        assert!(matches!(err, ShellError::NotFound(_)));
    }
}
