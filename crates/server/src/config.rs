//! Server configuration
//!
//! CLI flags with `DRYDOCK_*` env fallbacks. Settings persistence lives
//! outside the core; everything here is resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Drydock — parallel coding-agent sessions over git worktrees
#[derive(Debug, Parser)]
#[command(name = "drydock", version, about)]
pub struct Cli {
    /// Approval gateway socket path
    #[arg(long, env = "DRYDOCK_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Seconds between the graceful and forceful kill phases
    #[arg(long, env = "DRYDOCK_KILL_GRACE_SECS", default_value_t = 5)]
    pub kill_grace_secs: u64,

    /// Concurrency ceiling for session-creation jobs
    #[arg(long, env = "DRYDOCK_JOB_CONCURRENCY", default_value_t = 3)]
    pub job_concurrency: usize,

    /// Agent binary override (otherwise resolved from DRYDOCK_AGENT_BIN,
    /// well-known locations, then PATH)
    #[arg(long)]
    pub agent_bin: Option<PathBuf>,
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub kill_grace: Duration,
    pub job_concurrency: usize,
    pub agent_bin: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_cli(cli: Cli) -> Self {
        let socket_path = cli.socket.unwrap_or_else(default_socket_path);
        Self {
            socket_path,
            kill_grace: Duration::from_secs(cli.kill_grace_secs),
            job_concurrency: cli.job_concurrency,
            agent_bin: cli.agent_bin,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            kill_grace: Duration::from_secs(5),
            job_concurrency: 3,
            agent_bin: None,
        }
    }
}

fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".drydock")
        .join("approval.sock")
}
