//! Plan command: show the job graph without building

use super::{CommandResult, PortArgs, prepare};
use convenient_ports::{Config, JobKind};
use std::path::Path;

pub async fn execute(config_path: Option<&Path>, args: PortArgs) -> CommandResult<()> {
    let config = Config::discover(config_path)?;
    let prepared = prepare(config, &args).await?;
    let graph = &prepared.graph;

    println!(
        "📋 {} jobs on {} environment(s)",
        graph.len(),
        prepared.environments.len()
    );
    for (number, layer) in graph.layers().iter().enumerate() {
        println!("\nLayer {} ({} jobs):", number + 1, layer.len());
        for id in layer {
            let Some(job) = graph.job(*id) else {
                continue;
            };
            let mut notes = Vec::new();
            if job.kind == JobKind::DeferredTest {
                notes.push("test only".to_string());
            } else if job.run_tests {
                notes.push("build + test".to_string());
            }
            if job.forced {
                notes.push("forced".to_string());
            }
            if let Some(flag) = job.package.skip_flag() {
                notes.push(format!("{}: {}", flag.kind, flag.reason));
            }
            if job.duplicate_of.is_some() {
                notes.push("repeat".to_string());
            }
            let waits = graph.dependencies(*id).len();
            if waits > 0 {
                notes.push(format!("after {waits}"));
            }
            if notes.is_empty() {
                println!("  • {job}");
            } else {
                println!("  • {job} ({})", notes.join(", "));
            }
        }
    }
    Ok(())
}
