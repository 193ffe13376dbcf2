//! `zfs(8)` backed snapshot store.

use crate::{SnapshotStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DESTROY_ATTEMPTS: usize = 5;
const DESTROY_BACKOFF: Duration = Duration::from_secs(1);

/// Snapshot store driving the `zfs` and `zpool` command line tools.
#[derive(Debug, Clone)]
pub struct ZfsStore {
    zfs: String,
    zpool: String,
}

impl Default for ZfsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsStore {
    pub fn new() -> Self {
        Self {
            zfs: "zfs".to_string(),
            zpool: "zpool".to_string(),
        }
    }

    /// Use alternative binaries, e.g. wrappers that go through `sudo`.
    pub fn with_commands(zfs: impl Into<String>, zpool: impl Into<String>) -> Self {
        Self {
            zfs: zfs.into(),
            zpool: zpool.into(),
        }
    }

    /// Names of all imported pools.
    pub async fn pools(&self) -> StoreResult<Vec<String>> {
        run(&self.zpool, &["list", "-H", "-o", "name"]).await
    }

    async fn zfs(&self, args: &[&str]) -> StoreResult<Vec<String>> {
        run(&self.zfs, args).await
    }
}

async fn run(program: &str, args: &[&str]) -> StoreResult<Vec<String>> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(%command, "Running storage command");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::Unavailable(format!("{program} not found")),
            _ => StoreError::Io(e),
        })?;

    if !output.status.success() {
        return Err(StoreError::Command {
            command,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

fn missing_dataset(err: &StoreError) -> bool {
    matches!(err, StoreError::Command { stderr, .. } if stderr.contains("does not exist"))
}

#[async_trait]
impl SnapshotStore for ZfsStore {
    async fn exists(&self, dataset: &str) -> StoreResult<bool> {
        Ok(self.get_property(dataset, "name").await?.is_some())
    }

    async fn create(&self, dataset: &str) -> StoreResult<()> {
        self.zfs(&["create", "-p", dataset]).await.map(drop)
    }

    async fn destroy(&self, dataset: &str) -> StoreResult<()> {
        if !self.exists(dataset).await? {
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            match self.zfs(&["destroy", "-R", "-f", dataset]).await {
                Ok(_) => return Ok(()),
                Err(e) if missing_dataset(&e) => return Ok(()),
                Err(e) if attempt < DESTROY_ATTEMPTS => {
                    warn!(dataset, attempt, error = %e, "Destroy failed, retrying");
                    tokio::time::sleep(DESTROY_BACKOFF).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn snapshot(&self, dataset: &str, name: &str) -> StoreResult<()> {
        self.zfs(&["snapshot", &format!("{dataset}@{name}")])
            .await
            .map(drop)
    }

    async fn rollback(&self, dataset: &str, name: &str) -> StoreResult<()> {
        self.zfs(&["rollback", "-R", "-f", &format!("{dataset}@{name}")])
            .await
            .map(drop)
    }

    async fn clone_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> StoreResult<()> {
        self.zfs(&["clone", "-p", &format!("{source}@{snapshot}"), target])
            .await
            .map(drop)
    }

    async fn get_property(&self, dataset: &str, property: &str) -> StoreResult<Option<String>> {
        match self
            .zfs(&["get", "-H", "-p", "-o", "value", property, dataset])
            .await
        {
            Ok(lines) => Ok(lines
                .into_iter()
                .next()
                .filter(|value| !value.is_empty() && value != "-")),
            Err(e) if missing_dataset(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_property(&self, dataset: &str, property: &str, value: &str) -> StoreResult<()> {
        self.zfs(&["set", &format!("{property}={value}"), dataset])
            .await
            .map(drop)
    }

    async fn children(&self, dataset: &str) -> StoreResult<Vec<String>> {
        let lines = match self
            .zfs(&["list", "-H", "-p", "-r", "-d", "1", "-o", "name", dataset])
            .await
        {
            Ok(lines) => lines,
            Err(e) if missing_dataset(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(lines.into_iter().filter(|name| name != dataset).collect())
    }

    async fn mountpoint(&self, dataset: &str) -> StoreResult<PathBuf> {
        let mountpoint = self.get_property(dataset, "mountpoint").await?;
        let mounted = self.get_property(dataset, "mounted").await?;

        match (mountpoint, mounted.as_deref()) {
            (Some(path), Some("yes")) if path.starts_with('/') => Ok(PathBuf::from(path)),
            _ => Err(StoreError::NotMounted(dataset.to_string())),
        }
    }
}
