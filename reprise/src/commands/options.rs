//! Options command: show the option combinations of a port

use super::{CommandResult, metadata_reader, option_filter};
use convenient_ports::{Config, MetadataReader, PackageId, generate_combinations};
use std::path::Path;

pub async fn execute(
    config_path: Option<&Path>,
    port: &str,
    include: Vec<String>,
    exclude: Vec<String>,
) -> CommandResult<()> {
    let config = Config::discover(config_path)?;
    let id: PackageId = port.parse()?;
    let reader = metadata_reader(&config, None)?;
    let package = reader.read(&id).await?;

    let combinations = generate_combinations(&package, &option_filter(include, exclude));
    println!("⚙️  {} option combinations of {}:", combinations.len(), id);
    for options in combinations {
        println!("  {options}");
    }
    Ok(())
}
