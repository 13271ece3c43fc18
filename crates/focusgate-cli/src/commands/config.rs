use anyhow::Result;
use focusgate_core::AgentConfig;

pub fn show_config(config: &AgentConfig) -> Result<()> {
    println!("# identity in use: {}", config.resolved_identity());
    print!("{}", config.to_toml_string()?);
    Ok(())
}
