//! Dataset and log naming under the root dataset.
//!
//! ```text
//! <pool>/reprise/bases/<env>                     base image, @clean snapshot
//! <pool>/reprise/instances/<run-id>/<env>-<n>    per-run clones, @pristine snapshot
//! <pool>/reprise/packages/<env>                  built packages, shared across runs
//! <pool>/reprise/ccache
//! <pool>/reprise/logs
//! ```

use crate::options::Variant;
use convenient_zfs::join;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the snapshot a base is cloned from.
pub const CLEAN_SNAPSHOT: &str = "clean";
/// Name of the snapshot each clone is rolled back to when recycled.
pub const PRISTINE_SNAPSHOT: &str = "pristine";

pub const PROP_SPEC_HASH: &str = "reprise:spec_hash";
pub const PROP_VERSION: &str = "reprise:version";
pub const PROP_ARCH: &str = "reprise:arch";
pub const PROP_EPOCH: &str = "reprise:epoch";
/// Run instance that created a clone.
pub const PROP_RUN: &str = "reprise:run_instance";

/// Identity of one invocation, used to namespace its clones and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunInstance(String);

impl RunInstance {
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..12].to_string())
    }

    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: String,
}

impl StorageLayout {
    /// `root` is the dataset everything lives under, e.g. `tank/reprise`.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn bases(&self) -> String {
        join(&self.root, "bases")
    }

    pub fn base(&self, environment: &str) -> String {
        join(&self.bases(), environment)
    }

    pub fn instances(&self) -> String {
        join(&self.root, "instances")
    }

    pub fn run_instances(&self, run: &RunInstance) -> String {
        join(&self.instances(), run.as_str())
    }

    pub fn clone_name(&self, run: &RunInstance, environment: &str, slot: usize) -> String {
        join(&self.run_instances(run), &format!("{environment}-{slot}"))
    }

    pub fn packages(&self, environment: &str) -> String {
        join(&join(&self.root, "packages"), environment)
    }

    pub fn ccache(&self) -> String {
        join(&self.root, "ccache")
    }

    pub fn logs(&self) -> String {
        join(&self.root, "logs")
    }
}

/// `<logs>/<run-id>/<env>/<category>_<name>[_<digest>].log`
pub fn log_path(logs_root: &Path, run: &RunInstance, environment: &str, variant: &Variant) -> PathBuf {
    let mut file = variant.package.file_stem();
    if !variant.options.is_default() {
        file.push('_');
        file.push_str(&variant.options.digest());
    }
    file.push_str(".log");
    logs_root.join(run.as_str()).join(environment).join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_names() {
        let layout = StorageLayout::new("tank/reprise");
        let run = RunInstance::from_name("abc123");
        assert_eq!(layout.base("14-amd64"), "tank/reprise/bases/14-amd64");
        assert_eq!(
            layout.clone_name(&run, "14-amd64", 2),
            "tank/reprise/instances/abc123/14-amd64-2"
        );
        assert_eq!(layout.packages("14-amd64"), "tank/reprise/packages/14-amd64");
        assert_eq!(layout.ccache(), "tank/reprise/ccache");
    }

    #[test]
    fn test_run_instances_are_unique() {
        let a = RunInstance::generate();
        let b = RunInstance::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_path() {
        let run = RunInstance::from_name("r1");
        let plain = Variant::default_of("devel/py-pytest@py311".parse().unwrap());
        assert_eq!(
            log_path(Path::new("/logs"), &run, "14-amd64", &plain),
            PathBuf::from("/logs/r1/14-amd64/devel_py-pytest@py311.log")
        );

        let optioned = Variant::new(plain.package.clone(), "+SSL".parse().unwrap());
        let path = log_path(Path::new("/logs"), &run, "14-amd64", &optioned);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("devel_py-pytest@py311_"), "{name}");
        assert_ne!(path, log_path(Path::new("/logs"), &run, "14-amd64", &plain));
    }
}
