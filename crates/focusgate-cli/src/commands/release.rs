use anyhow::Result;
use focusgate_core::{AgentConfig, Daemon};

/// Unblock every effective url and resume every monitored process once.
pub async fn release(config: AgentConfig) -> Result<()> {
    let daemon = Daemon::new(config)?;
    daemon.seed_policy().await;

    let mut enforcement = daemon.enforcement_loop()?;
    let resumed = enforcement.release_all();
    println!("Released: hosts entries removed, {resumed} process instance(s) resumed.");
    Ok(())
}
