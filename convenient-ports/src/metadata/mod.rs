//! Package metadata sources.
//!
//! The resolver only needs a way to turn a [`PackageId`] into a [`Package`];
//! where the data comes from is up to the [`MetadataReader`] implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::package::{Package, PackageId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub mod ports_tree;

pub use ports_tree::PortsTreeReader;

/// Source of package metadata.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    /// Read the metadata of one package.
    async fn read(&self, id: &PackageId) -> MetadataResult<Arc<Package>>;
}

/// Metadata from a JSON document: an array of packages.
///
/// ```json
/// [{"id": "www/app", "dependencies": [{"package": "devel/lib", "kind": "build"}]}]
/// ```
#[derive(Debug, Default, Clone)]
pub struct ManifestReader {
    packages: HashMap<PackageId, Arc<Package>>,
}

impl ManifestReader {
    pub fn new(packages: impl IntoIterator<Item = Package>) -> Self {
        Self {
            packages: packages
                .into_iter()
                .map(|p| (p.id.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> MetadataResult<Self> {
        let packages: Vec<Package> = serde_json::from_str(json)?;
        debug!(count = packages.len(), "Loaded package manifest");
        Ok(Self::new(packages))
    }

    pub fn load(path: &Path) -> MetadataResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[async_trait]
impl MetadataReader for ManifestReader {
    async fn read(&self, id: &PackageId) -> MetadataResult<Arc<Package>> {
        self.packages
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownPackage(id.clone()))
    }
}
