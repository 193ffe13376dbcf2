//! FreeBSD jail runtime.
//!
//! Drives `mount(8)`, `jail(8)`, `jexec(8)` and `jls(8)`. Every sandbox is a
//! persistent jail over a clone's mountpoint, restarted whenever its network
//! mode changes.

use super::{Invocation, Mount, NetworkMode, SandboxHandle, SandboxRuntime};
use crate::error::{ExecutionError, ExecutionResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STOP_POLL: Duration = Duration::from_secs(1);
const STOP_ATTEMPTS: u32 = 30;

async fn run(program: &str, args: &[String]) -> ExecutionResult<String> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(%command, "Running sandbox command");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutionError::Sandbox(format!("{command}: {e}")))?;
    if !output.status.success() {
        return Err(ExecutionError::Sandbox(format!(
            "{command}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Mountpoints strictly below `root` from `mount -p` output, deepest first.
pub fn mounts_below(mount_table: &str, root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = mount_table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(PathBuf::from)
        .filter(|target| target != root && target.starts_with(root))
        .collect();
    mounts.sort();
    mounts.reverse();
    mounts
}

/// Jail ids whose path is `root` or below, from `jls --libxo json` output.
pub fn jails_below(jls_json: &str, root: &Path) -> ExecutionResult<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(jls_json)
        .map_err(|e| ExecutionError::Sandbox(format!("unreadable jail list: {e}")))?;
    let jails = value["jail-information"]["jail"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    Ok(jails
        .iter()
        .filter(|jail| {
            jail["path"]
                .as_str()
                .is_some_and(|path| Path::new(path).starts_with(root))
        })
        .filter_map(|jail| jail["jid"].as_u64().map(|jid| jid.to_string()))
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct JailRuntime;

impl JailRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn is_running(jid: &str) -> bool {
        Command::new("jls")
            .args(["-j", jid])
            .output()
            .await
            .is_ok_and(|output| output.status.success())
    }

    async fn remove(jid: &str) -> ExecutionResult<()> {
        let _ = run("jail", &["-r".to_string(), jid.to_string()]).await?;
        for _ in 0..STOP_ATTEMPTS {
            if !Self::is_running(jid).await {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        warn!(jid, "Jail still listed after removal");
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for JailRuntime {
    async fn mount(&self, root: &Path, mounts: &[Mount]) -> ExecutionResult<()> {
        for mount in mounts {
            tokio::fs::create_dir_all(root.join(&mount.target)).await?;
            let _ = run("mount", &mount.mount_args(root)).await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        root: &Path,
        network: NetworkMode,
        hostname: &str,
    ) -> ExecutionResult<SandboxHandle> {
        let mut args = vec![
            "-c".to_string(),
            "-i".to_string(),
            "persist".to_string(),
            format!("path={}", root.display()),
            format!("host.hostname={hostname}"),
        ];
        args.extend(network.jail_params().iter().map(|p| (*p).to_string()));

        let stdout = run("jail", &args).await?;
        let jid = stdout.trim();
        if jid.is_empty() || !jid.chars().all(|c| c.is_ascii_digit()) {
            return Err(ExecutionError::Sandbox(format!(
                "jail did not report a jail id: `{jid}`"
            )));
        }
        info!(jid, root = %root.display(), %network, "Jail started");
        Ok(SandboxHandle {
            id: jid.to_string(),
            root: root.to_path_buf(),
            network,
        })
    }

    fn command(&self, handle: &SandboxHandle, invocation: &Invocation) -> Command {
        let mut command = Command::new("jexec");
        if let Some(user) = &invocation.user {
            let _ = command.args(["-U", user]);
        }
        let user = invocation.user.as_deref().unwrap_or("root");
        let _ = command
            .arg(&handle.id)
            .args(["/usr/bin/env", "-i", "-L", user])
            .args([
                "HOME=/nonexistent".to_string(),
                "SHELL=/bin/sh".to_string(),
                format!("USER={user}"),
            ])
            .args(invocation.env.iter().map(|(k, v)| format!("{k}={v}")))
            .args(&invocation.argv);
        command
    }

    async fn stop(&self, handle: &SandboxHandle) -> ExecutionResult<()> {
        debug!(jid = %handle.id, "Stopping jail");
        Self::remove(&handle.id).await
    }

    async fn cleanup(&self, root: &Path) -> ExecutionResult<()> {
        let listing = run(
            "jls",
            &["--libxo".to_string(), "json".to_string()],
        )
        .await?;
        for jid in jails_below(&listing, root)? {
            warn!(%jid, root = %root.display(), "Removing leftover jail");
            Self::remove(&jid).await?;
        }

        let table = run("mount", &["-p".to_string()]).await?;
        for target in mounts_below(&table, root) {
            debug!(target = %target.display(), "Unmounting");
            let _ = run("umount", &["-f".to_string(), target.display().to_string()]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mounts_below_root_deepest_first() {
        let table = "\
tank/reprise/instances/r1/env-0\t/tank/reprise/instances/r1/env-0\tzfs\trw\t0\t0
devfs\t/tank/reprise/instances/r1/env-0/dev\tdevfs\trw\t0\t0
/usr/ports\t/tank/reprise/instances/r1/env-0/usr/ports\tnullfs\tro\t0\t0
tmpfs\t/tank/reprise/instances/r1/env-0/usr/ports/x\ttmpfs\trw\t0\t0
devfs\t/tank/reprise/instances/r1/env-01/dev\tdevfs\trw\t0\t0
devfs\t/dev\tdevfs\trw\t0\t0
";
        let mounts = mounts_below(table, Path::new("/tank/reprise/instances/r1/env-0"));
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/tank/reprise/instances/r1/env-0/usr/ports/x"),
                PathBuf::from("/tank/reprise/instances/r1/env-0/usr/ports"),
                PathBuf::from("/tank/reprise/instances/r1/env-0/dev"),
            ]
        );
    }

    #[test]
    fn test_jails_below_root() {
        let listing = r#"{"__version": "2", "jail-information": {"jail": [
            {"jid": 7, "hostname": "reprise", "path": "/tank/reprise/instances/r1/env-0"},
            {"jid": 9, "hostname": "www", "path": "/jails/www"}
        ]}}"#;
        let jails = jails_below(listing, Path::new("/tank/reprise/instances/r1")).unwrap();
        assert_eq!(jails, vec!["7".to_string()]);

        let empty = r#"{"__version": "2", "jail-information": {"jail": []}}"#;
        assert!(jails_below(empty, Path::new("/x")).unwrap().is_empty());
    }

    #[test]
    fn test_jexec_command_line() {
        let handle = SandboxHandle {
            id: "12".into(),
            root: PathBuf::from("/r"),
            network: NetworkMode::Restricted,
        };
        let invocation = Invocation {
            user: Some("nobody".into()),
            env: vec![("BATCH".into(), "1".into())],
            argv: vec!["make".into(), "build".into()],
        };
        let command = JailRuntime::new().command(&handle, &invocation);
        let std = command.as_std();
        let args: Vec<String> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(std.get_program(), "jexec");
        assert_eq!(
            args,
            vec![
                "-U", "nobody", "12", "/usr/bin/env", "-i", "-L", "nobody",
                "HOME=/nonexistent", "SHELL=/bin/sh", "USER=nobody", "BATCH=1", "make", "build"
            ]
        );
    }
}
