//! Index of built packages per (variant, environment spec).
//!
//! The index answers "is this dependency satisfied without rebuilding" on
//! the resolver's and scheduler's hot path, so it is a plain in-process map
//! behind one lock rather than a query against the package repository.

use crate::environment::EnvironmentSpec;
use crate::error::{MetadataError, MetadataResult};
use crate::options::Variant;
use crate::package::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::BufRead;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Present in a package repository before the run started
    Prebuilt,
    /// Produced by a job of this run
    JustBuilt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub provenance: Provenance,
    /// Package file, relative to the packages directory
    pub package_file: String,
    pub version: Option<String>,
    /// Shared libraries the package links against
    pub shared_libraries: Vec<String>,
}

impl ArtifactMetadata {
    pub fn just_built(package_file: impl Into<String>, shared_libraries: Vec<String>) -> Self {
        Self {
            provenance: Provenance::JustBuilt,
            package_file: package_file.into(),
            version: None,
            shared_libraries,
        }
    }
}

/// Result of [`ArtifactIndex::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    Prebuilt(ArtifactMetadata),
    BuiltThisRun(ArtifactMetadata),
}

impl ArtifactState {
    pub fn metadata(&self) -> Option<&ArtifactMetadata> {
        match self {
            ArtifactState::Absent => None,
            ArtifactState::Prebuilt(m) | ArtifactState::BuiltThisRun(m) => Some(m),
        }
    }
}

type Key = (Variant, EnvironmentSpec);

/// Thread-safe artifact index for one run.
#[derive(Debug, Default)]
pub struct ArtifactIndex {
    entries: RwLock<HashMap<Key, ArtifactMetadata>>,
    forced: HashSet<PackageId>,
}

impl ArtifactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index whose prebuilt entries for `forced` packages are ignored.
    pub fn with_forced(forced: impl IntoIterator<Item = PackageId>) -> Self {
        Self {
            entries: RwLock::default(),
            forced: forced.into_iter().collect(),
        }
    }

    pub fn is_forced(&self, package: &PackageId) -> bool {
        self.forced.contains(package)
    }

    pub fn forced(&self) -> &HashSet<PackageId> {
        &self.forced
    }

    pub fn lookup(&self, variant: &Variant, spec: &EnvironmentSpec) -> ArtifactState {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&(variant.clone(), spec.clone())) {
            None => ArtifactState::Absent,
            Some(m) if m.provenance == Provenance::Prebuilt => ArtifactState::Prebuilt(m.clone()),
            Some(m) => ArtifactState::BuiltThisRun(m.clone()),
        }
    }

    /// Whether a dependency on `variant` needs no job: it was built this run,
    /// or a prebuilt package exists and rebuilding was not forced.
    pub fn satisfies(&self, variant: &Variant, spec: &EnvironmentSpec) -> bool {
        match self.lookup(variant, spec) {
            ArtifactState::Absent => false,
            ArtifactState::Prebuilt(_) => !self.is_forced(&variant.package),
            ArtifactState::BuiltThisRun(_) => true,
        }
    }

    /// Record an artifact, replacing any previous entry.
    pub fn record(&self, variant: &Variant, spec: &EnvironmentSpec, metadata: ArtifactMetadata) {
        debug!(variant = %variant, spec = %spec, file = %metadata.package_file, "Recording artifact");
        let _ = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((variant.clone(), spec.clone()), metadata);
    }

    /// Drop the entry, returning what was there.
    pub fn invalidate(&self, variant: &Variant, spec: &EnvironmentSpec) -> Option<ArtifactMetadata> {
        debug!(variant = %variant, spec = %spec, "Invalidating artifact");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(variant.clone(), spec.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed prebuilt entries from a repository catalog (`packagesite.yaml`:
    /// one JSON object per line). Returns the number of entries loaded.
    pub fn load_catalog(&self, spec: &EnvironmentSpec, reader: impl BufRead) -> MetadataResult<usize> {
        let mut loaded = 0;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CatalogEntry =
                serde_json::from_str(&line).map_err(|e| MetadataError::Catalog {
                    line: index + 1,
                    reason: e.to_string(),
                })?;
            let package = entry.package_id().map_err(|e| MetadataError::Catalog {
                line: index + 1,
                reason: e.to_string(),
            })?;

            let metadata = ArtifactMetadata {
                provenance: Provenance::Prebuilt,
                package_file: format!("All/{}-{}.pkg", entry.name, entry.version),
                version: Some(entry.version),
                shared_libraries: entry.shlibs_required,
            };
            let _ = self
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((Variant::default_of(package), spec.clone()), metadata);
            loaded += 1;
        }
        info!(spec = %spec, packages = loaded, "Loaded repository catalog");
        Ok(loaded)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    version: String,
    origin: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    shlibs_required: Vec<String>,
}

impl CatalogEntry {
    fn package_id(&self) -> MetadataResult<PackageId> {
        match self.annotations.get("flavor") {
            Some(flavor) => PackageId::parse(&format!("{}@{}", self.origin, flavor)),
            None => PackageId::parse(&self.origin),
        }
    }
}
