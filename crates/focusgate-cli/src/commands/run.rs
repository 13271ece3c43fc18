use anyhow::Result;
use focusgate_core::{daemon_control::DaemonControl, AgentConfig, Daemon};

/// Run the agent in the foreground until Ctrl-C.
pub async fn run_agent(config: AgentConfig) -> Result<()> {
    let _instance = DaemonControl::new()?.acquire()?;
    log::info!("Starting focusgate agent...");

    let daemon = Daemon::new(config)?;
    if let Err(e) = daemon.run_with_signals().await {
        log::error!("Agent exited with a fatal error: {e:#}");
        return Err(e);
    }
    Ok(())
}
