//! Sandboxed job execution.
//!
//! A [`SandboxRuntime`] knows how to mount filesystems into an environment,
//! start an isolated sandbox over it and run commands inside. The
//! [`SandboxExecutor`] drives one job's phases through a runtime, enforcing
//! timeouts, network isolation and the privilege mode.

use crate::error::ExecutionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub mod config;
pub mod executor;
pub mod host;
pub mod jail;
pub mod log;

pub use config::{NetworkPolicy, PackageCompression, PhaseCommands, PhaseTimeouts, SandboxConfig};
pub use executor::{DependencyArtifact, ExecutionRequest, SandboxExecutor};
pub use host::HostRuntime;
pub use jail::JailRuntime;

/// Job phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    DependencyInstall,
    Fetch,
    Extract,
    Patch,
    Build,
    Stage,
    Package,
    Test,
}

impl Phase {
    /// Phases of the build stage, after dependencies are installed and
    /// distfiles fetched.
    pub const BUILD_STAGE: [Phase; 5] = [
        Phase::Extract,
        Phase::Patch,
        Phase::Build,
        Phase::Stage,
        Phase::Package,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::DependencyInstall => "dependency-install",
            Phase::Fetch => "fetch",
            Phase::Extract => "extract",
            Phase::Patch => "patch",
            Phase::Build => "build",
            Phase::Stage => "stage",
            Phase::Package => "package",
            Phase::Test => "test",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Network access inside the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all
    Disabled,
    /// Loopback only
    #[default]
    Restricted,
    /// Host networking
    Unrestricted,
}

impl NetworkMode {
    /// `jail(8)` parameters for this mode.
    pub fn jail_params(self) -> [&'static str; 2] {
        match self {
            NetworkMode::Unrestricted => ["ip4=inherit", "ip6=inherit"],
            NetworkMode::Restricted => ["ip4.addr=127.0.0.1", "ip6.addr=::1"],
            NetworkMode::Disabled => ["ip4=disable", "ip6=disable"],
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Disabled => f.write_str("disabled"),
            NetworkMode::Restricted => f.write_str("restricted"),
            NetworkMode::Unrestricted => f.write_str("unrestricted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Devfs { ruleset: u32 },
    Nullfs { source: PathBuf, read_only: bool },
    Tmpfs { limit_bytes: u64 },
}

/// A filesystem mounted at `target`, a path relative to the environment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub target: PathBuf,
}

impl Mount {
    pub fn devfs(ruleset: u32) -> Self {
        Self {
            kind: MountKind::Devfs { ruleset },
            target: PathBuf::from("dev"),
        }
    }

    pub fn nullfs(source: impl Into<PathBuf>, target: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            kind: MountKind::Nullfs {
                source: source.into(),
                read_only,
            },
            target: target.into(),
        }
    }

    pub fn tmpfs(target: impl Into<PathBuf>, limit_bytes: u64) -> Self {
        Self {
            kind: MountKind::Tmpfs { limit_bytes },
            target: target.into(),
        }
    }

    /// `mount(8)` arguments for mounting under `root`.
    pub fn mount_args(&self, root: &Path) -> Vec<String> {
        let target = root.join(&self.target).display().to_string();
        match &self.kind {
            MountKind::Devfs { ruleset } => vec![
                "-t".into(),
                "devfs".into(),
                format!("-oruleset={ruleset}"),
                "dev".into(),
                target,
            ],
            MountKind::Nullfs { source, read_only } => {
                let mut args = vec!["-t".to_string(), "nullfs".to_string()];
                if *read_only {
                    args.extend(["-o".to_string(), "ro".to_string()]);
                }
                args.extend([source.display().to_string(), target]);
                args
            }
            MountKind::Tmpfs { limit_bytes } => vec![
                "-t".into(),
                "tmpfs".into(),
                format!("-osize={limit_bytes}"),
                "tmp".into(),
                target,
            ],
        }
    }
}

/// A command to run inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Run as this user instead of root
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    pub argv: Vec<String>,
}

/// A running sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub root: PathBuf,
    pub network: NetworkMode,
}

/// Isolation mechanism the executor runs phases in.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Mount filesystems below `root`, creating the mountpoints.
    async fn mount(&self, root: &Path, mounts: &[Mount]) -> ExecutionResult<()>;

    /// Start a sandbox over `root`.
    async fn start(
        &self,
        root: &Path,
        network: NetworkMode,
        hostname: &str,
    ) -> ExecutionResult<SandboxHandle>;

    /// Command that runs `invocation` inside the sandbox. The caller spawns it.
    fn command(&self, handle: &SandboxHandle, invocation: &Invocation) -> Command;

    /// Stop a sandbox, killing everything inside it.
    async fn stop(&self, handle: &SandboxHandle) -> ExecutionResult<()>;

    /// Stop leftover sandboxes and unmount everything below `root`.
    async fn cleanup(&self, root: &Path) -> ExecutionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::DependencyInstall.to_string(), "dependency-install");
        assert_eq!(Phase::Build.to_string(), "build");
        assert!(Phase::Fetch < Phase::Extract);
        assert!(Phase::Package < Phase::Test);
    }

    #[test]
    fn test_jail_network_params() {
        assert_eq!(NetworkMode::default(), NetworkMode::Restricted);
        assert_eq!(
            NetworkMode::Restricted.jail_params(),
            ["ip4.addr=127.0.0.1", "ip6.addr=::1"]
        );
        assert_eq!(NetworkMode::Disabled.jail_params(), ["ip4=disable", "ip6=disable"]);
    }

    #[test]
    fn test_mount_args() {
        let root = Path::new("/tank/i/x");
        assert_eq!(
            Mount::devfs(4).mount_args(root),
            vec!["-t", "devfs", "-oruleset=4", "dev", "/tank/i/x/dev"]
        );
        assert_eq!(
            Mount::nullfs("/usr/ports", "usr/ports", true).mount_args(root),
            vec!["-t", "nullfs", "-o", "ro", "/usr/ports", "/tank/i/x/usr/ports"]
        );
        assert_eq!(
            Mount::tmpfs("work", 1024).mount_args(root),
            vec!["-t", "tmpfs", "-osize=1024", "tmp", "/tank/i/x/work"]
        );
    }
}
