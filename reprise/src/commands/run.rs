//! Run command: build and test ports

use super::{CommandResult, PortArgs, prepare};
use async_trait::async_trait;
use clap::Args;
use convenient_ports::error::InfraResult;
use convenient_ports::pool::{BaseImageProvider, ReleaseImageFetcher, cleanup_leftovers};
use convenient_ports::sandbox::{HostRuntime, JailRuntime, PhaseCommands, SandboxRuntime};
use convenient_ports::{
    EnvironmentDefinition, EnvironmentPool, RunInstance, SandboxExecutor, Scheduler,
    StorageLayout,
};
use convenient_zfs::{MemoryStore, SnapshotStore, ZfsStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub ports: PortArgs,

    /// Extra make variable for every build, repeatable
    #[arg(short = 'V', value_name = "KEY=VALUE", value_parser = parse_variable)]
    pub variables: Vec<(String, String)>,

    /// Number of parallel jobs (default: one per environment)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Start no new jobs after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Destroy clones of dead runs before starting
    #[arg(long)]
    pub cleanup_stale: bool,

    /// Run on the host without ZFS or jails, echoing phase commands
    #[arg(long)]
    pub dry_run: bool,

    /// Also write the JSON report to FILE
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

fn parse_variable(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("`{s}` is not KEY=VALUE")),
    }
}

/// Base provider for dry runs: an empty tree.
struct EmptyBase;

#[async_trait]
impl BaseImageProvider for EmptyBase {
    async fn populate(&self, definition: &EnvironmentDefinition, root: &Path) -> InfraResult<()> {
        info!(environment = %definition.name, root = %root.display(), "Dry run: empty base");
        tokio::fs::create_dir_all(root.join("etc")).await?;
        Ok(())
    }

    async fn install_packages(&self, _: &Path, packages: &[String]) -> InfraResult<()> {
        if !packages.is_empty() {
            info!(packages = %packages.join(" "), "Dry run: not installing base packages");
        }
        Ok(())
    }
}

/// Interrupts flip the channel to `true`; running phases are killed.
fn forward_interrupts() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            let _ = tx.send(true);
        }
    });
    rx
}

pub async fn execute(config_path: Option<&Path>, args: RunArgs) -> CommandResult<i32> {
    let mut config = convenient_ports::Config::discover(config_path)?;
    if let Some(workers) = args.workers {
        config.scheduler.workers = workers;
    }
    config.scheduler.fail_fast |= args.fail_fast;
    config.sandbox.variables.extend(args.variables.iter().cloned());
    if args.dry_run {
        config.sandbox.commands = PhaseCommands::dry_run();
    }

    println!("🔍 Resolving dependencies...");
    let prepared = prepare(config, &args.ports).await?;
    let mut config = prepared.config;
    config.scheduler.resolve_workers(prepared.environments.len());
    println!(
        "  ✓ {} jobs on {} environment(s) in {} layers",
        prepared.graph.len(),
        prepared.environments.len(),
        prepared.graph.layers().len()
    );
    if prepared.graph.is_empty() {
        println!("Nothing to do.");
        return Ok(0);
    }

    let (store, images, runtime): (
        Arc<dyn SnapshotStore>,
        Arc<dyn BaseImageProvider>,
        Arc<dyn SandboxRuntime>,
    ) = if args.dry_run {
        let root = std::env::temp_dir().join("reprise-dry-run");
        (
            Arc::new(MemoryStore::new(&root)?),
            Arc::new(EmptyBase),
            Arc::new(HostRuntime::new()),
        )
    } else {
        let zfs = ZfsStore::new();
        config.storage.select_pool(&zfs.pools().await?)?;
        (
            Arc::new(zfs),
            Arc::new(ReleaseImageFetcher::new(
                config.storage.mirror.as_str(),
                config.storage.image_cache.as_path(),
            )),
            Arc::new(JailRuntime::new()),
        )
    };

    let layout = StorageLayout::new(config.storage.dataset());
    let run = RunInstance::generate();
    if args.cleanup_stale {
        let destroyed = cleanup_leftovers(store.as_ref(), &layout, Some(&run)).await?;
        println!("🧹 Destroyed {} leftover run(s)", destroyed.len());
    }

    let pool = Arc::new(EnvironmentPool::new(
        store,
        images,
        layout,
        run.clone(),
        &prepared.environments,
        config.pool(),
    ));
    let logs_dir = pool.logs_dir().await?;
    println!("📋 Run {} (logs in {})", run, logs_dir.join(run.as_str()).display());

    let interrupt = forward_interrupts();
    let executor = Arc::new(SandboxExecutor::new(
        runtime,
        config.sandbox.clone(),
        interrupt.clone(),
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&pool),
        executor,
        prepared.index,
        config.scheduler.scheduler(),
        logs_dir.clone(),
        interrupt,
    );

    println!("\n🔨 Building...");
    let report = scheduler.run(&prepared.graph).await;
    if let Err(e) = pool.teardown().await {
        warn!(error = %e, "Failed to destroy run clones");
    }

    println!("\n{}", report);
    let json = report.to_json()?;
    let report_file = logs_dir.join(run.as_str()).join("report.json");
    if let Some(parent) = report_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&report_file, &json)?;
    if let Some(path) = &args.report {
        std::fs::write(path, &json).map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    }
    println!("Report: {}", report_file.display());

    Ok(report.exit_code())
}
