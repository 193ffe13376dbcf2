//! Sandbox execution settings.

use super::{NetworkMode, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Compression of built packages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageCompression {
    None,
    Fast,
    #[default]
    Default,
    Best,
}

impl PackageCompression {
    /// `make.conf` line selecting this compression, if any.
    pub fn make_conf_line(self) -> Option<&'static str> {
        match self {
            PackageCompression::None => Some("PKG_NOCOMPRESS=yes"),
            PackageCompression::Fast => Some("PKG_COMPRESSION_LEVEL=fast"),
            PackageCompression::Best => Some("PKG_COMPRESSION_LEVEL=best"),
            PackageCompression::Default => None,
        }
    }
}

/// Per-phase limits in seconds; 0 means no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub dependency_install: u64,
    pub fetch: u64,
    pub extract: u64,
    pub patch: u64,
    pub build: u64,
    pub stage: u64,
    pub package: u64,
    pub test: u64,
}

impl PhaseTimeouts {
    pub fn seconds(&self, phase: Phase) -> u64 {
        match phase {
            Phase::DependencyInstall => self.dependency_install,
            Phase::Fetch => self.fetch,
            Phase::Extract => self.extract,
            Phase::Patch => self.patch,
            Phase::Build => self.build,
            Phase::Stage => self.stage,
            Phase::Package => self.package,
            Phase::Test => self.test,
        }
    }

    pub fn limit(&self, phase: Phase) -> Option<Duration> {
        match self.seconds(phase) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Network mode of each stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Dependency installation and distfile fetch
    pub fetch: NetworkMode,
    pub build: NetworkMode,
    pub test: NetworkMode,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            fetch: NetworkMode::Unrestricted,
            build: NetworkMode::Restricted,
            test: NetworkMode::Restricted,
        }
    }
}

impl NetworkPolicy {
    pub fn for_phase(&self, phase: Phase) -> NetworkMode {
        match phase {
            Phase::DependencyInstall | Phase::Fetch => self.fetch,
            Phase::Test => self.test,
            _ => self.build,
        }
    }
}

/// Command templates run inside the sandbox.
///
/// Placeholders: `{port}` (port directory inside the sandbox), `{origin}`,
/// `{flavor}`, `{stem}` (origin as a file name), and for the install
/// commands `{package_file}` and `{package}` (file name without suffix).
/// An empty command skips its step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseCommands {
    /// Installs a package built in this run from `/packages`
    pub install_built: Vec<String>,
    /// Installs a prebuilt package from the package repository
    pub install_prebuilt: Vec<String>,
    pub fetch: Vec<String>,
    pub extract: Vec<String>,
    pub patch: Vec<String>,
    pub build: Vec<String>,
    pub stage: Vec<String>,
    pub package: Vec<String>,
    pub test: Vec<String>,
    /// Manifest consistency check, run after stage
    pub check_plist: Vec<String>,
    /// Shared library completeness check, run after stage
    pub stage_qa: Vec<String>,
    /// Prints the package name; the file is `All/<name>.pkg`
    pub package_name: Vec<String>,
    /// Prints the shared libraries the built package requires, one per line
    pub shared_libraries: Vec<String>,
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

impl Default for PhaseCommands {
    fn default() -> Self {
        let make = |target: &str| argv(&["make", "-C", "{port}", target]);
        Self {
            install_built: argv(&["pkg", "add", "/packages/{package_file}"]),
            install_prebuilt: argv(&["pkg", "install", "-y", "{package}"]),
            fetch: make("checksum"),
            extract: make("extract"),
            patch: make("patch"),
            build: make("build"),
            stage: make("stage"),
            package: make("package"),
            test: make("test"),
            check_plist: make("check-plist"),
            stage_qa: make("stage-qa"),
            package_name: argv(&["make", "-C", "{port}", "-V", "PKGNAME"]),
            shared_libraries: argv(&["pkg", "query", "-F", "/packages/{package_file}", "%B"]),
        }
    }
}

impl PhaseCommands {
    /// Commands that only report what would run.
    pub fn dry_run() -> Self {
        let echo = |step: &str| argv(&["echo", step, "{origin}"]);
        Self {
            install_built: echo("install"),
            install_prebuilt: echo("install"),
            fetch: echo("fetch"),
            extract: echo("extract"),
            patch: echo("patch"),
            build: echo("build"),
            stage: echo("stage"),
            package: echo("package"),
            test: echo("test"),
            check_plist: Vec::new(),
            stage_qa: Vec::new(),
            package_name: Vec::new(),
            shared_libraries: Vec::new(),
        }
    }

    pub fn for_phase(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Fetch => &self.fetch,
            Phase::Extract => &self.extract,
            Phase::Patch => &self.patch,
            Phase::Build => &self.build,
            Phase::Stage => &self.stage,
            Phase::Package => &self.package,
            Phase::Test => &self.test,
            Phase::DependencyInstall => &self.install_built,
        }
    }
}

/// Replace `{key}` placeholders in every word of a command.
pub fn render(template: &[String], values: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|word| {
            values.iter().fold(word.clone(), |word, (key, value)| {
                word.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Ports tree on the host, mounted read-only at `/usr/ports`
    pub portsdir: PathBuf,
    /// Distfiles cache on the host, mounted at `/distfiles`
    pub distdir: PathBuf,
    pub timeouts: PhaseTimeouts,
    pub network: NetworkPolicy,
    /// Run build phases as root instead of `nobody`
    pub build_as_root: bool,
    pub ccache: bool,
    pub package_compression: PackageCompression,
    /// Extra `make.conf` variables
    pub variables: BTreeMap<String, String>,
    pub hostname: String,
    pub commands: PhaseCommands,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            portsdir: PathBuf::from("/usr/ports"),
            distdir: PathBuf::from("/usr/ports/distfiles"),
            timeouts: PhaseTimeouts::default(),
            network: NetworkPolicy::default(),
            build_as_root: false,
            ccache: false,
            package_compression: PackageCompression::default(),
            variables: BTreeMap::new(),
            hostname: "reprise".to_string(),
            commands: PhaseCommands::default(),
        }
    }
}

impl SandboxConfig {
    /// User the build stage runs as.
    pub fn build_user(&self) -> Option<String> {
        (!self.build_as_root).then(|| "nobody".to_string())
    }
}
