//! Runs one job's phases inside an acquired environment.

use super::config::render;
use super::log::JobLog;
use super::{Invocation, Mount, NetworkMode, Phase, SandboxConfig, SandboxHandle, SandboxRuntime};
use crate::artifact::{ArtifactMetadata, Provenance};
use crate::error::{ExecutionError, ExecutionResult};
use crate::options::Variant;
use crate::package::{Package, PackageFlag, PackageId};
use crate::pool::Environment;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// A package installed into the sandbox before a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyArtifact {
    pub package: PackageId,
    pub metadata: ArtifactMetadata,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub variant: Variant,
    pub package: Arc<Package>,
    /// Run the build stage and produce a package
    pub build: bool,
    /// Run the test phase
    pub test: bool,
    /// Installed before fetch, in order
    pub build_deps: Vec<DependencyArtifact>,
    /// Installed before the test phase
    pub test_deps: Vec<DependencyArtifact>,
    pub log_path: PathBuf,
}

/// `make.conf` for a variant.
pub fn make_conf(config: &SandboxConfig, variant: &Variant, ccache: bool) -> String {
    let mut lines = vec!["BUILD_ALL_PYTHON_FLAVORS=yes".to_string()];
    lines.extend(config.variables.iter().map(|(k, v)| format!("{k}={v}")));

    let with: Vec<&str> = variant.options.enabled().collect();
    if !with.is_empty() {
        lines.push(format!("WITH={}", with.join(" ")));
    }
    let without: Vec<&str> = variant.options.disabled().collect();
    if !without.is_empty() {
        lines.push(format!("WITHOUT={}", without.join(" ")));
    }
    if ccache {
        lines.push("WITH_CCACHE_BUILD=yes".to_string());
        lines.push("CCACHE_DIR=/ccache".to_string());
    }
    if let Some(line) = config.package_compression.make_conf_line() {
        lines.push(line.to_string());
    }

    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

fn title(phase: Phase) -> String {
    let name = phase.name().replace('-', " ");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{} phase", first.to_ascii_uppercase(), chars.as_str()),
        None => name,
    }
}

enum Stop {
    Timeout,
    Interrupt,
}

fn kill_group(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Process group already gone");
    }
}

async fn expire(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn interrupted(mut interrupt: watch::Receiver<bool>) {
    if interrupt.wait_for(|stop| *stop).await.is_err() {
        // sender gone: nobody can interrupt any more
        std::future::pending::<()>().await;
    }
}

/// The running sandbox of one job, restarted on network mode changes.
struct Session<'a> {
    runtime: &'a dyn SandboxRuntime,
    root: &'a Path,
    hostname: &'a str,
    handle: Option<SandboxHandle>,
}

impl Session<'_> {
    async fn enter(&mut self, network: NetworkMode) -> ExecutionResult<SandboxHandle> {
        if let Some(handle) = &self.handle {
            if handle.network == network {
                return Ok(handle.clone());
            }
            debug!(from = %handle.network, to = %network, "Restarting sandbox for network mode");
            if let Some(handle) = self.handle.take() {
                self.runtime.stop(&handle).await?;
            }
        }
        let handle = self.runtime.start(self.root, network, self.hostname).await?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn close(&mut self) -> ExecutionResult<()> {
        if let Some(handle) = self.handle.take() {
            self.runtime.stop(&handle).await?;
        }
        self.runtime.cleanup(self.root).await
    }
}

pub struct SandboxExecutor {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
    fetch_lock: Mutex<()>,
    interrupt: watch::Receiver<bool>,
}

impl SandboxExecutor {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        config: SandboxConfig,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runtime,
            config,
            fetch_lock: Mutex::new(()),
            interrupt,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The flag that short-circuits a package to SKIPPED, checked before
    /// any environment is acquired.
    pub fn preflight(package: &Package) -> Option<&PackageFlag> {
        package.skip_flag()
    }

    fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Run the requested stages. Returns the produced artifact when the
    /// build stage ran.
    pub async fn run(
        &self,
        env: &Environment,
        request: &ExecutionRequest,
    ) -> ExecutionResult<Option<ArtifactMetadata>> {
        let mut log = JobLog::create(&request.log_path)?;
        log.line(&format!(
            "{} on {} ({})",
            request.variant, env.definition.name, env.definition.spec
        ))?;

        let mut session = Session {
            runtime: self.runtime.as_ref(),
            root: &env.root,
            hostname: &self.config.hostname,
            handle: None,
        };
        let result = self.run_stages(env, request, &mut session, &mut log).await;

        let teardown = session.close().await;
        match (result, teardown) {
            (Ok(artifact), Ok(())) => Ok(artifact),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(t) = teardown {
                    warn!(root = %env.root.display(), error = %t, "Sandbox teardown failed");
                }
                let _ = log.line(&format!("Job failed: {e}"));
                Err(e)
            }
        }
    }

    fn mounts(&self, env: &Environment) -> Vec<Mount> {
        let tunables = &env.definition.tunables;
        let mut mounts = vec![
            Mount::devfs(tunables.devfs_ruleset),
            Mount::nullfs(&self.config.portsdir, "usr/ports", true),
            Mount::nullfs(&self.config.distdir, "distfiles", false),
            Mount::nullfs(&env.packages_dir, "packages", false),
        ];
        if tunables.tmpfs.work {
            mounts.push(Mount::tmpfs("work", tunables.tmpfs.limit_bytes()));
        }
        if tunables.tmpfs.localbase {
            mounts.push(Mount::tmpfs("usr/local", tunables.tmpfs.limit_bytes()));
        }
        if let Some(ccache) = self.ccache_dir(env) {
            mounts.push(Mount::nullfs(ccache, "ccache", false));
        }
        mounts
    }

    fn ccache_dir<'a>(&self, env: &'a Environment) -> Option<&'a Path> {
        env.ccache_dir.as_deref().filter(|_| self.config.ccache)
    }

    async fn run_stages(
        &self,
        env: &Environment,
        request: &ExecutionRequest,
        session: &mut Session<'_>,
        log: &mut JobLog,
    ) -> ExecutionResult<Option<ArtifactMetadata>> {
        let etc = env.root.join("etc");
        tokio::fs::create_dir_all(&etc).await?;
        let ccache = self.ccache_dir(env).is_some();
        tokio::fs::write(etc.join("make.conf"), make_conf(&self.config, &request.variant, ccache))
            .await?;
        self.runtime.mount(&env.root, &self.mounts(env)).await?;

        let package = &request.variant.package;
        let network = self.config.network;

        let handle = session.enter(network.for_phase(Phase::Fetch)).await?;
        self.install(&handle, log, "Dependency install phase", &request.build_deps)
            .await?;
        {
            let _fetching = self.fetch_lock.lock().await;
            self.make_phase(&handle, log, Phase::Fetch, package, None).await?;
        }

        let mut artifact = None;
        if request.build {
            let user = self.config.build_user();
            let handle = session.enter(network.build).await?;
            for phase in Phase::BUILD_STAGE {
                self.make_phase(&handle, log, phase, package, user.clone()).await?;
                if phase == Phase::Stage {
                    self.sanity_checks(&handle, log, package, user.clone()).await?;
                }
            }
            artifact = Some(self.probe_artifact(&handle, log, package).await?);
        }

        if request.test {
            if !request.test_deps.is_empty() {
                let handle = session.enter(network.fetch).await?;
                self.install(&handle, log, "Test dependency install phase", &request.test_deps)
                    .await?;
            }
            let handle = session.enter(network.test).await?;
            self.make_phase(&handle, log, Phase::Test, package, self.config.build_user())
                .await?;
        }

        Ok(artifact)
    }

    fn values(package: &PackageId) -> Vec<(&'static str, String)> {
        vec![
            ("port", format!("/usr/ports/{}", package.origin())),
            ("origin", package.origin().to_string()),
            ("flavor", package.flavor().unwrap_or_default().to_string()),
            ("stem", package.file_stem()),
        ]
    }

    fn render(template: &[String], values: &[(&'static str, String)]) -> Vec<String> {
        let borrowed: Vec<(&str, &str)> = values.iter().map(|(k, v)| (*k, v.as_str())).collect();
        render(template, &borrowed)
    }

    fn make_env(package: &PackageId) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = [
            ("BATCH", "1"),
            ("DISTDIR", "/distfiles"),
            ("WRKDIRPREFIX", "/work"),
            ("PACKAGES", "/packages"),
            ("PKG_ADD", "false"),
            ("USE_PACKAGE_DEPENDS_ONLY", "1"),
            ("_LICENSE_STATUS", "accepted"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
        if let Some(flavor) = package.flavor() {
            env.push(("FLAVOR".to_string(), flavor.to_string()));
        }
        env
    }

    async fn install(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        banner: &str,
        deps: &[DependencyArtifact],
    ) -> ExecutionResult<()> {
        if deps.is_empty() {
            return Ok(());
        }
        log.banner(banner)?;
        for dep in deps {
            let file = dep.metadata.package_file.as_str();
            let stem = Path::new(file)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| ExecutionError::MissingArtifact(dep.package.to_string()))?;
            let template = match dep.metadata.provenance {
                Provenance::JustBuilt => &self.config.commands.install_built,
                Provenance::Prebuilt => &self.config.commands.install_prebuilt,
            };
            let mut values = Self::values(&dep.package);
            values.push(("package_file", file.to_string()));
            values.push(("package", stem));

            let invocation = Invocation {
                user: None,
                env: vec![("ASSUME_ALWAYS_YES".to_string(), "yes".to_string())],
                argv: Self::render(template, &values),
            };
            self.execute(handle, log, Phase::DependencyInstall, invocation).await?;
        }
        Ok(())
    }

    async fn make_phase(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        phase: Phase,
        package: &PackageId,
        user: Option<String>,
    ) -> ExecutionResult<()> {
        let template = self.config.commands.for_phase(phase);
        if template.is_empty() {
            return Ok(());
        }
        log.banner(&title(phase))?;
        let invocation = Invocation {
            user,
            env: Self::make_env(package),
            argv: Self::render(template, &Self::values(package)),
        };
        info!(package = %package, %phase, "Phase started");
        self.execute(handle, log, phase, invocation).await
    }

    async fn sanity_checks(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        package: &PackageId,
        user: Option<String>,
    ) -> ExecutionResult<()> {
        let checks = [
            ("check-plist", &self.config.commands.check_plist),
            ("stage-qa", &self.config.commands.stage_qa),
        ];
        for (check, template) in checks {
            if template.is_empty() {
                continue;
            }
            log.banner(&format!("Sanity check {check}"))?;
            let invocation = Invocation {
                user: user.clone(),
                env: Self::make_env(package),
                argv: Self::render(template, &Self::values(package)),
            };
            self.execute(handle, log, Phase::Stage, invocation)
                .await
                .map_err(|e| match e {
                    ExecutionError::PhaseFailed { status, .. } => ExecutionError::SanityCheck {
                        check: check.to_string(),
                        status,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Run a command to completion, enforcing the phase timeout and the
    /// interrupt signal. Both kill the whole process group.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        phase: Phase,
        invocation: Invocation,
    ) -> ExecutionResult<()> {
        if self.is_interrupted() {
            return Err(ExecutionError::Interrupted { phase });
        }
        log.line(&format!("+ {}", invocation.argv.join(" ")))?;

        let (stdout, stderr) = log.stdio()?;
        let mut command = self.runtime.command(handle, &invocation);
        let _ = command
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let limit = self.config.timeouts.limit(phase);
        let waited: Result<ExitStatus, Stop> = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = expire(limit) => Err(Stop::Timeout),
            _ = interrupted(self.interrupt.clone()) => Err(Stop::Interrupt),
        };

        let status = match waited {
            Ok(status) => status,
            Err(stop) => {
                kill_group(&child);
                let _ = child.wait().await;
                return Err(match stop {
                    Stop::Timeout => {
                        let limit_secs = self.config.timeouts.seconds(phase);
                        log.line(&format!("Phase {phase} timed out after {limit_secs}s"))?;
                        warn!(%phase, limit_secs, "Phase timed out");
                        ExecutionError::Timeout { phase, limit_secs }
                    }
                    Stop::Interrupt => {
                        log.line("Interrupted")?;
                        ExecutionError::Interrupted { phase }
                    }
                });
            }
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(status) => Err(ExecutionError::PhaseFailed { phase, status }),
            None => Err(ExecutionError::Killed { phase }),
        }
    }

    async fn capture(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        invocation: Invocation,
    ) -> ExecutionResult<String> {
        let output = self
            .runtime
            .command(handle, &invocation)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            log.line(stderr.trim_end())?;
        }
        if !output.status.success() {
            return Err(ExecutionError::PhaseFailed {
                phase: Phase::Package,
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe_artifact(
        &self,
        handle: &SandboxHandle,
        log: &mut JobLog,
        package: &PackageId,
    ) -> ExecutionResult<ArtifactMetadata> {
        let commands = &self.config.commands;
        let mut values = Self::values(package);

        let name = if commands.package_name.is_empty() {
            package.file_stem()
        } else {
            let invocation = Invocation {
                user: None,
                env: Self::make_env(package),
                argv: Self::render(&commands.package_name, &values),
            };
            self.capture(handle, log, invocation).await?.trim().to_string()
        };
        if name.is_empty() {
            return Err(ExecutionError::MissingArtifact(package.to_string()));
        }
        let package_file = format!("All/{name}.pkg");
        values.push(("package_file", package_file.clone()));
        values.push(("package", name));

        let shared_libraries = if commands.shared_libraries.is_empty() {
            Vec::new()
        } else {
            let invocation = Invocation {
                user: None,
                env: Vec::new(),
                argv: Self::render(&commands.shared_libraries, &values),
            };
            self.capture(handle, log, invocation)
                .await?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        };

        info!(package = %package, file = %package_file, "Package built");
        Ok(ArtifactMetadata::just_built(package_file, shared_libraries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionSelection;
    use crate::sandbox::PackageCompression;
    use std::collections::BTreeMap;

    #[test]
    fn test_make_conf() {
        let config = SandboxConfig {
            variables: BTreeMap::from([("DEFAULT_VERSIONS".to_string(), "ssl=openssl".to_string())]),
            package_compression: PackageCompression::Fast,
            ..SandboxConfig::default()
        };
        let variant = Variant::new(
            "www/curl".parse().unwrap(),
            "+HTTP2 -DOCS +IDN".parse::<OptionSelection>().unwrap(),
        );
        assert_eq!(
            make_conf(&config, &variant, true),
            "BUILD_ALL_PYTHON_FLAVORS=yes\n\
             DEFAULT_VERSIONS=ssl=openssl\n\
             WITH=HTTP2 IDN\n\
             WITHOUT=DOCS\n\
             WITH_CCACHE_BUILD=yes\n\
             CCACHE_DIR=/ccache\n\
             PKG_COMPRESSION_LEVEL=fast\n"
        );

        let plain = Variant::default_of("www/curl".parse().unwrap());
        assert_eq!(
            make_conf(&SandboxConfig::default(), &plain, false),
            "BUILD_ALL_PYTHON_FLAVORS=yes\n"
        );
    }

    #[test]
    fn test_phase_titles() {
        assert_eq!(title(Phase::Fetch), "Fetch phase");
        assert_eq!(title(Phase::DependencyInstall), "Dependency install phase");
    }

    #[test]
    fn test_make_environment_carries_flavor() {
        let env = SandboxExecutor::make_env(&"devel/py-pytest@py311".parse().unwrap());
        assert!(env.contains(&("FLAVOR".to_string(), "py311".to_string())));
        assert!(env.contains(&("WRKDIRPREFIX".to_string(), "/work".to_string())));

        let plain = SandboxExecutor::make_env(&"www/curl".parse().unwrap());
        assert!(plain.iter().all(|(k, _)| k != "FLAVOR"));
    }
}
