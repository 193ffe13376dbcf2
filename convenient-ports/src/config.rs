//! Configuration file.
//!
//! A single JSON document; every section and field has a default, so an
//! empty object is a valid configuration.

use crate::environment::{EnvironmentDefinition, EnvironmentRegistry, Tunables};
use crate::error::{ConfigError, ConfigResult};
use crate::pool::base_image::DEFAULT_MIRROR;
use crate::pool::{PoolConfig, RecyclePolicy};
use crate::sandbox::SandboxConfig;
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "reprise/reprise.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// ZFS pool holding every dataset; empty picks the only pool there is
    pub pool: String,
    /// Dataset below the pool, e.g. `reprise` for `zroot/reprise`
    pub root: String,
    /// Download cache for release base images
    pub image_cache: PathBuf,
    pub mirror: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: String::new(),
            root: "reprise".to_string(),
            image_cache: PathBuf::from("/var/cache/reprise"),
            mirror: DEFAULT_MIRROR.to_string(),
        }
    }
}

impl StorageConfig {
    /// Full name of the root dataset.
    pub fn dataset(&self) -> String {
        convenient_zfs::join(&self.pool, &self.root)
    }

    /// Check the configured pool against the imported ones, or pick the
    /// pool when none is configured and exactly one exists.
    pub fn select_pool(&mut self, available: &[String]) -> ConfigResult<()> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: "storage.pool".to_string(),
            reason,
        };
        if self.pool.is_empty() {
            match available {
                [only] => {
                    info!(pool = %only, "Using the only ZFS pool");
                    self.pool = only.clone();
                }
                [] => return Err(invalid("no ZFS pool is imported".to_string())),
                _ => {
                    return Err(invalid(format!(
                        "several pools exist ({}), pick one",
                        available.join(", ")
                    )));
                }
            }
        } else if !available.contains(&self.pool) {
            return Err(invalid(format!("pool `{}` does not exist", self.pool)));
        }
        Ok(())
    }
}

/// An entry of the `environments` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Overrides the top-level tunables for this environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunables: Option<Tunables>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Concurrent jobs, 0 for one per environment
    pub workers: usize,
    pub fail_fast: bool,
    /// Live clones allowed per environment, 0 for one per worker
    pub clones_per_environment: usize,
    pub recycle: RecyclePolicy,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: 0,
            fail_fast: false,
            clones_per_environment: 0,
            recycle: RecyclePolicy::default(),
        }
    }
}

impl SchedulerSection {
    /// Settle an unset worker count on one per selected environment.
    pub fn resolve_workers(&mut self, environments: usize) {
        if self.workers == 0 {
            self.workers = environments.max(1);
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers.max(1),
            fail_fast: self.fail_fast,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Package catalogs (`packagesite.yaml`) per environment name
    pub catalogs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    /// Defaults for every environment without its own tunables
    pub tunables: Tunables,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub scheduler: SchedulerSection,
    pub sandbox: SandboxConfig,
    pub repository: RepositoryConfig,
}

impl Config {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load `path`, or the first config file found in the search path, or
    /// the defaults when there is none.
    pub fn discover(path: Option<&Path>) -> ConfigResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        for candidate in search_path(
            std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        ) {
            if candidate.is_file() {
                return Self::load(&candidate);
            }
            debug!(path = %candidate.display(), "No config file");
        }
        Ok(Self::default())
    }

    /// Validate the configured environments. Without any, the host's
    /// release becomes the `default` environment.
    pub fn registry(&self) -> ConfigResult<EnvironmentRegistry> {
        if self.environments.is_empty() {
            let host = EnvironmentDefinition::host_default(self.tunables.clone())?;
            info!(spec = %host.spec, "No environments configured, using the host release");
            return EnvironmentRegistry::new(vec![host]);
        }

        let definitions = self
            .environments
            .iter()
            .map(|(name, env)| {
                EnvironmentDefinition::new(
                    name.as_str(),
                    &env.version,
                    &env.arch,
                    env.tunables.clone().unwrap_or_else(|| self.tunables.clone()),
                    env.tags.clone(),
                )
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        EnvironmentRegistry::new(definitions)
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            clones_per_environment: match self.scheduler.clones_per_environment {
                0 => self.scheduler.workers.max(1),
                clones => clones,
            },
            recycle: self.scheduler.recycle,
            ccache: self.sandbox.ccache,
        }
    }
}

fn search_path(xdg_config_home: Option<PathBuf>, home: Option<PathBuf>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = xdg_config_home.filter(|d| d.is_absolute()) {
        paths.push(dir.join(CONFIG_FILE));
    }
    if let Some(home) = home {
        paths.push(home.join(".config").join(CONFIG_FILE));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::NetworkMode;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "storage": { "pool": "tank" },
                "environments": {
                    "14-amd64": { "version": "14.1-RELEASE", "arch": "amd64", "tags": ["14"] },
                    "13-amd64": {
                        "version": "13.3-RELEASE",
                        "arch": "amd64",
                        "tunables": { "resolver": "1.1.1.1" }
                    }
                },
                "scheduler": { "workers": 4 },
                "sandbox": { "network": { "build": "disabled" }, "timeouts": { "build": 3600 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.storage.dataset(), "tank/reprise");
        assert_eq!(config.scheduler.scheduler().workers, 4);
        assert_eq!(config.pool().clones_per_environment, 4);
        assert!(!config.scheduler.fail_fast);
        assert_eq!(config.sandbox.network.build, NetworkMode::Disabled);
        assert_eq!(config.sandbox.network.fetch, NetworkMode::Unrestricted);
        assert_eq!(config.sandbox.portsdir, PathBuf::from("/usr/ports"));

        let registry = config.registry().unwrap();
        assert_eq!(registry.environments().len(), 2);
        let old = registry.get("13-amd64").unwrap();
        assert_eq!(old.tunables.resolver, "1.1.1.1");
        assert_eq!(old.tunables.devfs_ruleset, 4);
        assert_eq!(registry.resolve(&["14"]).unwrap()[0].name, "14-amd64");
    }

    #[test]
    fn test_workers_default_to_one_per_environment() {
        let mut config = Config::default();
        assert_eq!(config.scheduler.workers, 0);
        config.scheduler.resolve_workers(3);
        assert_eq!(config.scheduler.scheduler().workers, 3);
        assert_eq!(config.pool().clones_per_environment, 3);

        let mut config = Config::default();
        config.scheduler.resolve_workers(0);
        assert_eq!(config.scheduler.scheduler().workers, 1);

        let mut config = Config::default();
        config.scheduler.workers = 2;
        config.scheduler.resolve_workers(5);
        assert_eq!(config.scheduler.scheduler().workers, 2);
    }

    #[test]
    fn test_invalid_environment_is_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "environments": { "bad": { "version": "CURRENT", "arch": "amd64" } } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.registry(),
            Err(ConfigError::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reprise.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("reprise.json"));
        assert!(matches!(
            Config::load(&tmp.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_select_pool() {
        let pools = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();

        let mut storage = StorageConfig::default();
        storage.select_pool(&pools(&["tank"])).unwrap();
        assert_eq!(storage.dataset(), "tank/reprise");

        let mut storage = StorageConfig::default();
        assert!(storage.select_pool(&pools(&["tank", "zroot"])).is_err());
        assert!(storage.select_pool(&pools(&[])).is_err());

        let mut storage = StorageConfig {
            pool: "zroot".to_string(),
            ..StorageConfig::default()
        };
        assert!(storage.select_pool(&pools(&["tank"])).is_err());
        storage.select_pool(&pools(&["tank", "zroot"])).unwrap();
        assert_eq!(storage.pool, "zroot");
    }

    #[test]
    fn test_search_order() {
        let paths = search_path(Some("/xdg".into()), Some("/home/u".into()));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/xdg/reprise/reprise.json"),
                PathBuf::from("/home/u/.config/reprise/reprise.json"),
            ]
        );
        // relative XDG values are ignored
        assert_eq!(search_path(Some("rel".into()), None), Vec::<PathBuf>::new());
    }
}
