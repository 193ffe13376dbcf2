//! Copy-on-write snapshot store.
//!
//! Sandboxes are provisioned by cloning a snapshot of a prepared base
//! dataset and discarded by destroying the clone. This crate hides the
//! storage backend behind the [`SnapshotStore`] trait:
//!
//! - [`ZfsStore`] drives the `zfs` and `zpool` binaries
//! - [`MemoryStore`] keeps datasets as plain directories, copying trees on
//!   snapshot and clone; it is meant for dry runs and tests
//!
//! Dataset names are slash-separated ZFS-style paths (`tank/reprise/bases/14-amd64`).
//! Every operation is atomic per dataset name, so distinct names can be
//! manipulated concurrently without further locking.

use async_trait::async_trait;
use std::path::PathBuf;

pub mod memory;
pub mod zfs;

pub use memory::MemoryStore;
pub use zfs::ZfsStore;

/// Snapshot store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("dataset already exists: {0}")]
    AlreadyExists(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("dataset {0} is not mounted")]
    NotMounted(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the failure concerns the storage pool as a whole rather than
    /// one dataset.
    pub fn is_host_global(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations on a copy-on-write dataset hierarchy.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Whether the dataset exists.
    async fn exists(&self, dataset: &str) -> StoreResult<bool>;

    /// Create a dataset, creating missing parents.
    async fn create(&self, dataset: &str) -> StoreResult<()>;

    /// Destroy a dataset with its descendants, snapshots and dependent
    /// clones. Destroying a missing dataset is not an error.
    async fn destroy(&self, dataset: &str) -> StoreResult<()>;

    /// Take a snapshot `dataset@name`.
    async fn snapshot(&self, dataset: &str, name: &str) -> StoreResult<()>;

    /// Roll the dataset back to `dataset@name`, discarding later changes.
    async fn rollback(&self, dataset: &str, name: &str) -> StoreResult<()>;

    /// Create `target` as a writable clone of `source@snapshot`, creating
    /// missing parents of `target`.
    async fn clone_snapshot(&self, source: &str, snapshot: &str, target: &str)
    -> StoreResult<()>;

    /// Read a property. Unset user properties and missing datasets yield `None`.
    async fn get_property(&self, dataset: &str, property: &str) -> StoreResult<Option<String>>;

    /// Set a property.
    async fn set_property(&self, dataset: &str, property: &str, value: &str) -> StoreResult<()>;

    /// Names of the direct child datasets.
    async fn children(&self, dataset: &str) -> StoreResult<Vec<String>>;

    /// Where the dataset is mounted on the host.
    async fn mountpoint(&self, dataset: &str) -> StoreResult<PathBuf>;
}

/// Join dataset path components with `/`, ignoring empty components.
pub fn join(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/')),
    }
}

/// Last path component of a dataset name.
pub fn leaf(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or(dataset)
}
