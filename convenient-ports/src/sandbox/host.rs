//! Runtime that runs phase commands as plain host processes.
//!
//! There is no isolation: mounts only create their mountpoints and the
//! network mode is recorded but not enforced. Used by dry runs and tests.

use super::{Invocation, Mount, NetworkMode, SandboxHandle, SandboxRuntime};
use crate::error::ExecutionResult;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Default)]
pub struct HostRuntime {
    started: AtomicUsize,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sandboxes started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for HostRuntime {
    async fn mount(&self, root: &Path, mounts: &[Mount]) -> ExecutionResult<()> {
        for mount in mounts {
            tokio::fs::create_dir_all(root.join(&mount.target)).await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        root: &Path,
        network: NetworkMode,
        _hostname: &str,
    ) -> ExecutionResult<SandboxHandle> {
        let id = self.started.fetch_add(1, Ordering::SeqCst);
        debug!(id, root = %root.display(), %network, "Host sandbox started");
        Ok(SandboxHandle {
            id: format!("host-{id}"),
            root: root.to_path_buf(),
            network,
        })
    }

    fn command(&self, handle: &SandboxHandle, invocation: &Invocation) -> Command {
        let (program, args) = match invocation.argv.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("true", &[][..]),
        };
        let mut command = Command::new(program);
        let _ = command
            .args(args)
            .current_dir(&handle.root)
            .env("SANDBOX_NETWORK", handle.network.to_string())
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(user) = &invocation.user {
            let _ = command.env("SANDBOX_USER", user);
        }
        command
    }

    async fn stop(&self, handle: &SandboxHandle) -> ExecutionResult<()> {
        debug!(id = %handle.id, "Host sandbox stopped");
        Ok(())
    }

    async fn cleanup(&self, _root: &Path) -> ExecutionResult<()> {
        Ok(())
    }
}
