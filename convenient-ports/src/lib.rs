//! Dependency-aware build and test scheduling for FreeBSD ports.
//!
//! A run goes through four stages:
//!
//! 1. [`metadata`] reads port metadata (dependencies, options, flags)
//! 2. [`resolver`] turns the requested variants into a [`JobGraph`], one job
//!    per (variant, environment spec), skipping what the [`ArtifactIndex`]
//!    already has
//! 3. [`scheduler`] dispatches ready jobs to workers, each running in a fresh
//!    clone from the [`EnvironmentPool`] inside a sandbox driven by the
//!    [`SandboxExecutor`]
//! 4. [`report`] summarizes every job's outcome
//!
//! # Example
//!
//! ```no_run
//! use convenient_ports::metadata::ManifestReader;
//! use convenient_ports::{ArtifactIndex, ResolveOptions, Resolver, Variant};
//!
//! # async fn example(environments: &[std::sync::Arc<convenient_ports::EnvironmentDefinition>]) -> Result<(), Box<dyn std::error::Error>> {
//! let reader = ManifestReader::load("ports.json".as_ref())?;
//! let index = ArtifactIndex::new();
//! let requests = vec![Variant::default_of("www/nginx".parse()?)];
//!
//! let graph = Resolver::new(&reader, &index, ResolveOptions { run_tests: true })
//!     .resolve(&requests, environments)
//!     .await?;
//! for layer in graph.layers() {
//!     println!("{} jobs can run in parallel", layer.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod config;
pub mod environment;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod options;
pub mod package;
pub mod pool;
pub mod report;
pub mod resolver;
pub mod sandbox;
pub mod scheduler;

pub use artifact::{ArtifactIndex, ArtifactMetadata, ArtifactState, Provenance};
pub use config::Config;
pub use environment::{EnvironmentDefinition, EnvironmentRegistry, EnvironmentSpec, Tunables};
pub use error::{
    ConfigError, ExecutionError, InfrastructureError, MetadataError, ResolveError,
};
pub use layout::{RunInstance, StorageLayout};
pub use metadata::MetadataReader;
pub use options::{OptionFilter, OptionSelection, Variant, generate_combinations};
pub use package::{Dependency, DependencyKind, FlagKind, Package, PackageFlag, PackageId};
pub use pool::{EnvironmentPool, PoolConfig, RecyclePolicy, ReleaseDisposition};
pub use report::{JobRecord, Outcome, RunReport, SkipReason, Summary};
pub use resolver::{Job, JobGraph, JobId, JobKind, ResolveOptions, Resolver, VariantSelection};
pub use sandbox::{SandboxConfig, SandboxExecutor, SandboxRuntime};
pub use scheduler::{Scheduler, SchedulerConfig};
