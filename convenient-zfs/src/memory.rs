//! Directory-backed snapshot store.
//!
//! Each dataset is a directory under a root path. Snapshots are full copies
//! kept under `<root>/.snapshots`, so clones and rollbacks behave like their
//! ZFS counterparts as far as file contents go. Every mutating call is
//! appended to an operation journal that tests can inspect, and individual
//! operations can be made to fail on demand.

use crate::{SnapshotStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Default)]
struct Dataset {
    properties: BTreeMap<String, String>,
    snapshots: BTreeSet<String>,
    origin: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<String, Dataset>,
    journal: Vec<String>,
    // operation name -> remaining injected failures
    failures: HashMap<String, usize>,
}

/// Snapshot store keeping datasets as plain directories.
#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a store rooted at `root`. The directory is created if missing.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_of(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    fn snapshot_path(&self, dataset: &str, name: &str) -> PathBuf {
        self.root.join(".snapshots").join(format!("{dataset}@{name}"))
    }

    /// Journal of mutating operations in call order, e.g. `clone a@clean b`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Number of journal entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    /// Make the next `times` calls of `operation` (`create`, `destroy`,
    /// `snapshot`, `rollback`, `clone`, `set`) fail.
    pub fn fail_next(&self, operation: &str, times: usize) {
        let _ = self.lock().failures.insert(operation.to_string(), times);
    }

    /// Names of all datasets currently present.
    pub fn datasets(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    fn begin(&self, inner: &mut Inner, operation: &str, entry: String) -> StoreResult<()> {
        if let Some(remaining) = inner.failures.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Command {
                command: entry,
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        debug!(root = %self.root.display(), %entry, "Memory store operation");
        inner.journal.push(entry);
        Ok(())
    }

    fn ensure_parents(&self, inner: &mut Inner, dataset: &str) -> StoreResult<()> {
        let mut prefix = String::new();
        let parts: Vec<&str> = dataset.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if !inner.datasets.contains_key(&prefix) {
                fs::create_dir_all(self.path_of(&prefix))?;
                let _ = inner.datasets.insert(prefix.clone(), Dataset::default());
            }
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> StoreResult<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            let _ = fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_tree(path: &Path) -> StoreResult<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn is_descendant(name: &str, ancestor: &str) -> bool {
    name == ancestor || name.starts_with(&format!("{ancestor}/"))
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn exists(&self, dataset: &str) -> StoreResult<bool> {
        Ok(self.lock().datasets.contains_key(dataset))
    }

    async fn create(&self, dataset: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.datasets.contains_key(dataset) {
            return Err(StoreError::AlreadyExists(dataset.to_string()));
        }
        self.begin(&mut inner, "create", format!("create {dataset}"))?;
        self.ensure_parents(&mut inner, dataset)?;
        fs::create_dir_all(self.path_of(dataset))?;
        let _ = inner.datasets.insert(dataset.to_string(), Dataset::default());
        Ok(())
    }

    async fn destroy(&self, dataset: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.datasets.contains_key(dataset) {
            return Ok(());
        }
        self.begin(&mut inner, "destroy", format!("destroy {dataset}"))?;

        // descendants plus clones of any of their snapshots, transitively
        let mut doomed: BTreeSet<String> = inner
            .datasets
            .keys()
            .filter(|name| is_descendant(name, dataset))
            .cloned()
            .collect();
        loop {
            let dependents: Vec<String> = inner
                .datasets
                .iter()
                .filter(|(name, ds)| {
                    !doomed.contains(*name)
                        && ds.origin.as_deref().is_some_and(|origin| {
                            let source = origin.split('@').next().unwrap_or(origin);
                            doomed.contains(source)
                        })
                })
                .flat_map(|(name, _)| {
                    inner
                        .datasets
                        .keys()
                        .filter(|candidate| is_descendant(candidate, name))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect();
            if dependents.is_empty() {
                break;
            }
            doomed.extend(dependents);
        }

        for name in doomed.iter().rev() {
            if let Some(ds) = inner.datasets.remove(name) {
                for snapshot in &ds.snapshots {
                    remove_tree(&self.snapshot_path(name, snapshot))?;
                }
            }
            remove_tree(&self.path_of(name))?;
        }
        Ok(())
    }

    async fn snapshot(&self, dataset: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.datasets.contains_key(dataset) {
            return Err(StoreError::NotFound(dataset.to_string()));
        }
        self.begin(&mut inner, "snapshot", format!("snapshot {dataset}@{name}"))?;
        copy_tree(&self.path_of(dataset), &self.snapshot_path(dataset, name))?;
        if let Some(ds) = inner.datasets.get_mut(dataset) {
            let _ = ds.snapshots.insert(name.to_string());
        }
        Ok(())
    }

    async fn rollback(&self, dataset: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let known = inner
            .datasets
            .get(dataset)
            .ok_or_else(|| StoreError::NotFound(dataset.to_string()))?
            .snapshots
            .contains(name);
        if !known {
            return Err(StoreError::SnapshotNotFound(format!("{dataset}@{name}")));
        }
        self.begin(&mut inner, "rollback", format!("rollback {dataset}@{name}"))?;
        let path = self.path_of(dataset);
        remove_tree(&path)?;
        copy_tree(&self.snapshot_path(dataset, name), &path)?;
        Ok(())
    }

    async fn clone_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let known = inner
            .datasets
            .get(source)
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?
            .snapshots
            .contains(snapshot);
        if !known {
            return Err(StoreError::SnapshotNotFound(format!("{source}@{snapshot}")));
        }
        if inner.datasets.contains_key(target) {
            return Err(StoreError::AlreadyExists(target.to_string()));
        }
        self.begin(
            &mut inner,
            "clone",
            format!("clone {source}@{snapshot} {target}"),
        )?;
        self.ensure_parents(&mut inner, target)?;
        copy_tree(&self.snapshot_path(source, snapshot), &self.path_of(target))?;
        let _ = inner.datasets.insert(
            target.to_string(),
            Dataset {
                origin: Some(format!("{source}@{snapshot}")),
                ..Dataset::default()
            },
        );
        Ok(())
    }

    async fn get_property(&self, dataset: &str, property: &str) -> StoreResult<Option<String>> {
        let inner = self.lock();
        let Some(ds) = inner.datasets.get(dataset) else {
            return Ok(None);
        };
        Ok(match property {
            "name" => Some(dataset.to_string()),
            "origin" => ds.origin.clone(),
            "mountpoint" => Some(self.path_of(dataset).display().to_string()),
            "mounted" => Some("yes".to_string()),
            _ => ds.properties.get(property).cloned(),
        })
    }

    async fn set_property(&self, dataset: &str, property: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.datasets.contains_key(dataset) {
            return Err(StoreError::NotFound(dataset.to_string()));
        }
        self.begin(&mut inner, "set", format!("set {property}={value} {dataset}"))?;
        if let Some(ds) = inner.datasets.get_mut(dataset) {
            let _ = ds
                .properties
                .insert(property.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn children(&self, dataset: &str) -> StoreResult<Vec<String>> {
        let prefix = format!("{dataset}/");
        Ok(self
            .lock()
            .datasets
            .keys()
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }

    async fn mountpoint(&self, dataset: &str) -> StoreResult<PathBuf> {
        if self.lock().datasets.contains_key(dataset) {
            Ok(self.path_of(dataset))
        } else {
            Err(StoreError::NotFound(dataset.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_makes_parents() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path()).unwrap();

        store.create("tank/reprise/bases/a").await.unwrap();

        assert!(store.exists("tank").await.unwrap());
        assert!(store.exists("tank/reprise/bases").await.unwrap());
        assert!(tmp.path().join("tank/reprise/bases/a").is_dir());
        assert_eq!(
            store.children("tank/reprise").await.unwrap(),
            vec!["tank/reprise/bases".to_string()]
        );
        assert!(matches!(
            store.create("tank/reprise/bases/a").await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_properties() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path()).unwrap();
        store.create("tank/a").await.unwrap();

        assert_eq!(store.get_property("tank/a", "reprise:x").await.unwrap(), None);
        store.set_property("tank/a", "reprise:x", "1").await.unwrap();
        assert_eq!(
            store.get_property("tank/a", "reprise:x").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(store.get_property("tank/missing", "name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path()).unwrap();
        store.fail_next("create", 1);

        assert!(store.create("tank/a").await.is_err());
        assert!(store.create("tank/a").await.is_ok());
        assert_eq!(store.count("create"), 1);
    }
}
