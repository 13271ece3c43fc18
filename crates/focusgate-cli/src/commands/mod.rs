pub mod config;
pub mod probe;
pub mod processes;
pub mod release;
pub mod run;

use focusgate_core::{remote::ConfigClient, AgentConfig, PolicyConfig};

/// Policy the agent would enforce right now: the server's answer resolved
/// against the bootstrap sets, or the bootstrap sets alone if the server is
/// unreachable.
async fn effective_policy(config: &AgentConfig) -> PolicyConfig {
    let bootstrap = config.bootstrap_policy();
    let client = match ConfigClient::new(
        &config.config_endpoint,
        &config.client,
        config.fetch_timeout(),
    ) {
        Ok(client) => client,
        Err(e) => {
            log::warn!("{e:#}");
            return bootstrap;
        }
    };
    match client.fetch().await {
        Ok(pushed) => pushed.resolve(&bootstrap),
        Err(e) => {
            log::warn!("Configuration fetch failed, using bootstrap: {e:#}");
            bootstrap
        }
    }
}
