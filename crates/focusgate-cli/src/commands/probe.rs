use anyhow::Result;
use focusgate_core::{
    markup_requires_block,
    probe::{CdpProbe, PageProbe},
    AgentConfig,
};

/// Probe the monitored tab once and print the decision the agent would take.
pub async fn probe_page(config: &AgentConfig) -> Result<()> {
    let probe = CdpProbe::new(
        &config.debug_endpoint,
        &config.monitored_url,
        config.probe_timeout(),
    )?;

    println!("Debug endpoint: {}", config.debug_endpoint);
    println!("Monitored tab:  {}", config.monitored_url);

    match probe.fetch_page_markup().await {
        Ok(markup) => {
            let should_block = markup_requires_block(&markup, &config.markers);
            println!("Markup length:  {} bytes", markup.len());
            println!(
                "Interaction:    {}",
                if should_block { "none" } else { "in progress" }
            );
            println!(
                "Decision:       {}",
                if should_block { "block" } else { "allow" }
            );
        }
        Err(e) => {
            println!("Probe failed:   {e}");
            println!("Decision:       block (fail-safe)");
        }
    }
    Ok(())
}
