//! Reprise command-line interface
//!
//! - `run`: build and test ports in sandboxes
//! - `plan`: resolve the job graph without building
//! - `environments`: list the environment registry
//! - `cleanup`: destroy clones of dead runs
//! - `options`: list option combinations of a port

use clap::{Args, Parser, Subcommand};
use convenient_ports::metadata::{ManifestReader, PortsTreeReader};
use convenient_ports::{
    ArtifactIndex, Config, EnvironmentDefinition, JobGraph, MetadataReader, OptionFilter,
    PackageId, ResolveOptions, Resolver, VariantSelection, resolver::requested_variants,
};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub mod cleanup;
pub mod environments;
pub mod options;
pub mod plan;
pub mod run;

pub type CommandResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Reprise - build and test FreeBSD ports in throwaway jails
#[derive(Parser)]
#[command(name = "reprise")]
#[command(about = "Build and test FreeBSD ports in parallel, in throwaway ZFS-backed jails")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: $XDG_CONFIG_HOME/reprise/reprise.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More output (-vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and test ports
    Run(run::RunArgs),

    /// Resolve dependencies and print the job graph
    Plan(PortArgs),

    /// List configured environments
    Environments,

    /// Destroy clones left behind by other runs
    Cleanup {
        /// Only list what would be destroyed
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the option combinations of a port
    Options {
        /// Port origin, e.g. www/nginx
        port: String,

        /// Only vary these options
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,

        /// Never vary these options
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
}

/// Which ports, where, and how to resolve them.
#[derive(Args, Debug, Clone)]
pub struct PortArgs {
    /// Port origins; `.` is the port in the current directory
    pub ports: Vec<String>,

    /// Read ports from FILE, one per line (`-` for stdin)
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Environment or tag to use; repeatable, bare `-j` selects all
    #[arg(short = 'j', long = "jail", num_args = 0..=1, default_missing_value = "all")]
    pub environments: Vec<String>,

    /// Read package metadata from a JSON manifest instead of the ports tree
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Skip the test phase
    #[arg(long)]
    pub no_test: bool,

    /// Also build every option combination
    #[arg(long)]
    pub options: bool,

    /// Build only the option combinations, not the default variant
    #[arg(long, requires = "options")]
    pub exclude_default_options: bool,

    /// Only vary these options
    #[arg(long, value_delimiter = ',')]
    pub include_option: Vec<String>,

    /// Never vary these options
    #[arg(long, value_delimiter = ',')]
    pub exclude_option: Vec<String>,

    /// Rebuild these ports even if a package exists
    #[arg(long, value_delimiter = ',')]
    pub force: Vec<String>,
}

pub fn option_filter(include: Vec<String>, exclude: Vec<String>) -> OptionFilter {
    OptionFilter {
        include: (!include.is_empty()).then(|| include.into_iter().collect::<BTreeSet<_>>()),
        exclude: exclude.into_iter().collect(),
    }
}

pub fn metadata_reader(config: &Config, manifest: Option<&Path>) -> CommandResult<Box<dyn MetadataReader>> {
    Ok(match manifest {
        Some(path) => Box::new(ManifestReader::load(path)?),
        None => Box::new(PortsTreeReader::new(&config.sandbox.portsdir)),
    })
}

/// Everything a run needs before the first sandbox exists.
pub struct Prepared {
    pub config: Config,
    pub environments: Vec<Arc<EnvironmentDefinition>>,
    pub index: Arc<ArtifactIndex>,
    pub graph: JobGraph,
}

/// Load configuration, select environments, seed the artifact index and
/// resolve the job graph.
pub async fn prepare(config: Config, args: &PortArgs) -> CommandResult<Prepared> {
    let registry = config.registry()?;
    let environments = registry.resolve(&args.environments)?;
    info!(
        environments = %environments.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(", "),
        "Selected environments"
    );

    let ports = crate::ports::collect(&args.ports, args.file.as_deref(), &config.sandbox.portsdir)?;
    for port in crate::ports::repeated(&ports) {
        warn!(%port, "Port requested more than once, it will be built again");
    }

    let forced = args
        .force
        .iter()
        .map(|p| p.parse::<PackageId>())
        .collect::<Result<Vec<_>, _>>()?;
    let index = Arc::new(ArtifactIndex::with_forced(forced));
    for environment in &environments {
        if let Some(catalog) = config.repository.catalogs.get(&environment.name) {
            let file = File::open(catalog)
                .map_err(|e| format!("failed to open catalog {}: {}", catalog.display(), e))?;
            let _ = index.load_catalog(&environment.spec, BufReader::new(file))?;
        }
    }

    let reader = metadata_reader(&config, args.manifest.as_deref())?;
    let selection = VariantSelection {
        default: !args.exclude_default_options,
        combinations: args.options,
    };
    let filter = option_filter(args.include_option.clone(), args.exclude_option.clone());
    let variants = requested_variants(reader.as_ref(), &ports, &filter, selection).await?;

    let graph = Resolver::new(
        reader.as_ref(),
        &index,
        ResolveOptions {
            run_tests: !args.no_test,
        },
    )
    .resolve(&variants, &environments)
    .await?;

    Ok(Prepared {
        config,
        environments,
        index,
        graph,
    })
}
