//! Environments command: list the registry

use super::CommandResult;
use convenient_ports::Config;
use std::path::Path;

pub fn execute(config_path: Option<&Path>) -> CommandResult<()> {
    let config = Config::discover(config_path)?;
    let registry = config.registry()?;

    println!("🌍 Environments:");
    for environment in registry.environments() {
        let tags = if environment.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", environment.tags.join(", "))
        };
        println!("  {}{}: {}", environment.name, tags, environment.spec);
    }
    Ok(())
}
