//! Drydock server
//!
//! Parallel coding-agent sessions over git worktrees: isolated working
//! copies, supervised agent processes, serialized history rewriting, and a
//! local approval gateway for tool calls.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use drydock::approval::{ApprovalGateway, PendingApprovals};
use drydock::config::{Cli, ServerConfig};
use drydock::events::EventBus;
use drydock::logging::init_logging;
use drydock::orchestrator::SessionOrchestrator;
use drydock::reaper::ProcessTreeReaper;
use drydock::shell_pool::ShellPool;
use drydock::store::{create_store_channel, MemoryStore};
use drydock_agent::AgentSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_cli(Cli::parse());
    let _logging = init_logging()?;

    info!(
        component = "main",
        event = "server.starting",
        socket = %config.socket_path.display(),
    );

    // The agent binary is resolved exactly once, at startup.
    let agent_bin = match config.agent_bin.clone() {
        Some(bin) => bin,
        None => drydock_agent::resolve_agent_binary()?,
    };

    let events = EventBus::new();
    let (store_tx, store_rx) = create_store_channel();
    tokio::spawn(MemoryStore::new().run(store_rx));

    let reaper = Arc::new(ProcessTreeReaper::new(config.kill_grace));
    let shells = ShellPool::new(events.clone(), reaper.clone());
    let pending = Arc::new(PendingApprovals::new());
    let supervisor = AgentSupervisor::new(agent_bin);

    let orchestrator = SessionOrchestrator::new(
        &config,
        events.clone(),
        store_tx,
        supervisor,
        reaper,
        shells,
        pending.clone(),
    );

    let gateway = ApprovalGateway::new(config.socket_path.clone(), pending, events.clone());
    tokio::spawn(gateway.run());

    info!(component = "main", event = "server.ready");

    tokio::signal::ctrl_c().await?;
    info!(component = "main", event = "server.shutting_down");

    // Stop everything still running before the process goes away.
    for session in orchestrator.list_sessions(false) {
        let _ = orchestrator.stop_session(&session.id).await;
    }
    orchestrator.stop_script().await;

    Ok(())
}
