//! Error taxonomy.
//!
//! - [`ResolveError`]: the dependency graph cannot be built; aborts before any job runs
//! - [`InfrastructureError`]: storage or base image failure; fatal for the jobs of the
//!   affected environment, or for the whole run when [`InfrastructureError::is_host_global`]
//! - [`ExecutionError`]: a job phase failed, timed out or was interrupted
//! - [`MetadataError`] and [`ConfigError`]: input problems reported before scheduling

use crate::package::PackageId;
use crate::sandbox::Phase;
use convenient_zfs::StoreError;
use std::path::PathBuf;

/// Package metadata errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("unknown package: {0}")]
    UnknownPackage(PackageId),

    #[error("invalid package identifier `{0}`: expected category/name[@flavor]")]
    InvalidPackageId(String),

    #[error("invalid option selection `{0}`: expected +OPTION or -OPTION")]
    InvalidOption(String),

    #[error("failed to query metadata of {package}: {reason}")]
    Query { package: PackageId, reason: String },

    #[error("malformed catalog entry at line {line}: {reason}")]
    Catalog { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Dependency graph errors
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("dependency cycle without a test edge: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("graph error: {0}")]
    Graph(#[from] convenient_graph::GraphError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Storage pool and base image errors
#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error("storage operation failed: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to fetch base image {url}: {reason}")]
    BaseImageFetch { url: String, reason: String },

    #[error("base environment {environment} is unavailable: {reason}")]
    BaseUnavailable { environment: String, reason: String },

    #[error("no environment registered for spec {0}")]
    UnknownEnvironment(String),

    #[error("environment pool is shut down")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InfrastructureError {
    /// Whether the failure affects every environment, in which case the
    /// whole run must abort.
    pub fn is_host_global(&self) -> bool {
        match self {
            InfrastructureError::Storage(e) => e.is_host_global(),
            InfrastructureError::PoolClosed => true,
            _ => false,
        }
    }
}

pub type InfraResult<T> = Result<T, InfrastructureError>;

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("phase {phase} exited with status {status}")]
    PhaseFailed { phase: Phase, status: i32 },

    #[error("phase {phase} killed by signal")]
    Killed { phase: Phase },

    #[error("phase {phase} timed out after {limit_secs}s")]
    Timeout { phase: Phase, limit_secs: u64 },

    #[error("sanity check {check} failed with status {status}")]
    SanityCheck { check: String, status: i32 },

    #[error("phase {phase} interrupted")]
    Interrupted { phase: Phase },

    #[error("no package file known for dependency {0}")]
    MissingArtifact(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    /// The phase in which the failure happened, when it is tied to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ExecutionError::PhaseFailed { phase, .. }
            | ExecutionError::Killed { phase }
            | ExecutionError::Timeout { phase, .. }
            | ExecutionError::Interrupted { phase } => Some(*phase),
            ExecutionError::SanityCheck { .. } => Some(Phase::Stage),
            _ => None,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unknown environment or tag `{0}`")]
    UnknownEnvironment(String),

    #[error("invalid environment `{name}`: {reason}")]
    InvalidEnvironment { name: String, reason: String },

    #[error("name `{0}` is used both as an environment and as a tag")]
    NameCollision(String),

    #[error("`{0}` is reserved")]
    Reserved(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
