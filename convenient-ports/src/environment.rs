//! Environment specifications and the registry of named environments.

use crate::error::{ConfigError, ConfigResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error};

/// Bumped whenever base preparation changes, forcing every base to be rebuilt.
pub const BASE_EPOCH: u32 = 1;

/// Release used when the host does not run a `-RELEASE` kernel.
pub const FALLBACK_RELEASE: &str = "13.1-RELEASE";

/// Selector matching every registered environment.
pub const ALL: &str = "all";

/// Selector used when none is given.
pub const DEFAULT: &str = "default";

/// Architectures for which release base images are published.
pub const KNOWN_ARCHES: [&str; 7] = [
    "amd64",
    "i386",
    "aarch64",
    "armv7",
    "powerpc64",
    "powerpc64le",
    "riscv64",
];

static RELEASE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+-(RELEASE|BETA[0-9]+|RC[0-9]+)$").ok());

fn is_release(version: &str) -> bool {
    RELEASE_RE.as_ref().is_some_and(|re| re.is_match(version))
}

/// tmpfs mounts for the build directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpfsLayout {
    /// Mount tmpfs at `/work`
    pub work: bool,
    /// Mount tmpfs at `/usr/local`
    pub localbase: bool,
    /// Size cap per mount, 0 meaning unlimited
    pub limit_mb: u64,
}

impl TmpfsLayout {
    pub fn limit_bytes(&self) -> u64 {
        self.limit_mb * 1024 * 1024
    }
}

/// Settings that change what a sandbox looks like from the inside.
///
/// Every field takes part in the [`EnvironmentSpec`] hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub devfs_ruleset: u32,
    /// Name server written to `/etc/resolv.conf`
    pub resolver: String,
    /// pkg repository branch, `latest` or `quarterly`
    pub pkg_branch: String,
    /// Packages installed into the base image
    pub base_packages: Vec<String>,
    pub tmpfs: TmpfsLayout,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            devfs_ruleset: 4,
            resolver: "8.8.8.8".to_string(),
            pkg_branch: "latest".to_string(),
            base_packages: Vec::new(),
            tmpfs: TmpfsLayout::default(),
        }
    }
}

/// Identity of an environment's base configuration.
///
/// Two specs are equal iff release, architecture and every tunable match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub version: String,
    pub arch: String,
    pub tunables_hash: String,
}

impl EnvironmentSpec {
    pub fn new(version: &str, arch: &str, tunables: &Tunables) -> Self {
        let canonical = serde_json::json!({
            "epoch": BASE_EPOCH,
            "version": version,
            "arch": arch,
            "tunables": tunables,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let hash = hasher.finalize();

        Self {
            version: version.to_string(),
            arch: arch.to_string(),
            tunables_hash: hash.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// Abbreviated hash for display.
    pub fn short_hash(&self) -> &str {
        &self.tunables_hash[..self.tunables_hash.len().min(12)]
    }
}

impl fmt::Display for EnvironmentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.version, self.arch, self.short_hash())
    }
}

/// A named environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDefinition {
    pub name: String,
    pub spec: EnvironmentSpec,
    pub tunables: Tunables,
    pub tags: Vec<String>,
}

impl EnvironmentDefinition {
    pub fn new(
        name: impl Into<String>,
        version: &str,
        arch: &str,
        tunables: Tunables,
        tags: Vec<String>,
    ) -> ConfigResult<Self> {
        let name = name.into();
        let invalid = |reason: String| ConfigError::InvalidEnvironment {
            name: name.clone(),
            reason,
        };

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("names may only contain letters, digits, `-`, `_` and `.`".into()));
        }
        if !is_release(version) {
            return Err(invalid(format!("`{version}` is not a release version like 14.1-RELEASE")));
        }
        if !KNOWN_ARCHES.contains(&arch) {
            return Err(invalid(format!("unsupported architecture `{arch}`")));
        }

        Ok(Self {
            spec: EnvironmentSpec::new(version, arch, &tunables),
            name,
            tunables,
            tags,
        })
    }

    /// The environment matching the running host.
    ///
    /// Hosts running STABLE or CURRENT fall back to [`FALLBACK_RELEASE`].
    pub fn host_default(tunables: Tunables) -> ConfigResult<Self> {
        let uts = nix::sys::utsname::uname().map_err(|e| ConfigError::InvalidValue {
            key: "uname".into(),
            reason: e.to_string(),
        })?;
        let release = uts.release().to_string_lossy().into_owned();
        let machine = uts.machine().to_string_lossy().into_owned();
        let (version, arch) = host_release(&release, &machine);
        Self::new(DEFAULT, &version, &arch, tunables, Vec::new())
    }
}

/// Map `uname -r` / `uname -m` output to a release version and architecture.
pub fn host_release(release: &str, machine: &str) -> (String, String) {
    // patch levels share the base image of the release
    let release = match release.rsplit_once("-p") {
        Some((base, patch)) if patch.chars().all(|c| c.is_ascii_digit()) => base,
        _ => release,
    };
    let version = if is_release(release) && release.ends_with("-RELEASE") {
        release.to_string()
    } else {
        error!(
            %release,
            fallback = FALLBACK_RELEASE,
            "Unable to detect release from host version (is host STABLE or CURRENT?), falling back to default"
        );
        FALLBACK_RELEASE.to_string()
    };
    let arch = match machine {
        "arm64" => "aarch64",
        "x86_64" => "amd64",
        other => other,
    };
    (version, arch.to_string())
}

/// Validated lookup table of environments, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    environments: Vec<Arc<EnvironmentDefinition>>,
    tags: BTreeMap<String, Vec<usize>>,
}

impl EnvironmentRegistry {
    pub fn new(definitions: Vec<EnvironmentDefinition>) -> ConfigResult<Self> {
        let names: HashSet<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        if names.len() != definitions.len() {
            let mut seen = HashSet::new();
            if let Some(dup) = definitions.iter().find(|d| !seen.insert(d.name.as_str())) {
                return Err(ConfigError::NameCollision(dup.name.clone()));
            }
        }

        let mut tags: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            if definition.name == ALL {
                return Err(ConfigError::Reserved(ALL.to_string()));
            }
            for tag in &definition.tags {
                if tag == ALL {
                    return Err(ConfigError::Reserved(ALL.to_string()));
                }
                if names.contains(tag.as_str()) {
                    return Err(ConfigError::NameCollision(tag.clone()));
                }
                tags.entry(tag.clone()).or_default().push(index);
            }
            debug!(name = %definition.name, spec = %definition.spec, "Registered environment");
        }

        Ok(Self {
            environments: definitions.into_iter().map(Arc::new).collect(),
            tags,
        })
    }

    pub fn environments(&self) -> &[Arc<EnvironmentDefinition>] {
        &self.environments
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EnvironmentDefinition>> {
        self.environments.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    fn select(&self, selector: &str) -> ConfigResult<Vec<usize>> {
        if selector == ALL {
            return Ok((0..self.environments.len()).collect());
        }
        if let Some(index) = self.environments.iter().position(|d| d.name == selector) {
            return Ok(vec![index]);
        }
        if let Some(indices) = self.tags.get(selector) {
            return Ok(indices.clone());
        }
        if selector == DEFAULT {
            return Ok((0..self.environments.len()).collect());
        }
        Err(ConfigError::UnknownEnvironment(selector.to_string()))
    }

    /// Resolve names and tags to environments, in selector order.
    ///
    /// No selectors means `default`. Environments with identical specs
    /// collapse onto the first one selected.
    pub fn resolve<S: AsRef<str>>(
        &self,
        selectors: &[S],
    ) -> ConfigResult<Vec<Arc<EnvironmentDefinition>>> {
        let mut indices = Vec::new();
        if selectors.is_empty() {
            indices.extend(self.select(DEFAULT)?);
        }
        for selector in selectors {
            indices.extend(self.select(selector.as_ref())?);
        }

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for index in indices {
            let definition = &self.environments[index];
            if seen.insert(definition.spec.clone()) {
                result.push(Arc::clone(definition));
            } else {
                debug!(name = %definition.name, "Environment duplicates an earlier spec, skipping");
            }
        }
        Ok(result)
    }
}
