//! Environment pool: base snapshots and per-run clones.
//!
//! Each [`EnvironmentSpec`] has one base dataset whose `@clean` snapshot is
//! cloned for every sandbox. The base carries the spec hash as a dataset
//! property; a mismatch on first acquire means the base is stale and is
//! rebuilt from the release image before any clone is taken.
//!
//! Clones are named per run instance, so concurrent runs against the same
//! pool never collide, and leftovers of crashed runs are easy to find.

use crate::environment::{BASE_EPOCH, EnvironmentDefinition, EnvironmentSpec};
use crate::error::{InfraResult, InfrastructureError};
use crate::layout::{
    CLEAN_SNAPSHOT, PRISTINE_SNAPSHOT, PROP_ARCH, PROP_EPOCH, PROP_RUN, PROP_SPEC_HASH,
    PROP_VERSION, RunInstance, StorageLayout,
};
use convenient_zfs::{SnapshotStore, leaf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

pub mod base_image;

pub use base_image::{BaseImageProvider, ReleaseImageFetcher};

/// What happens to a clone after its job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecyclePolicy {
    /// Roll clean clones back to `@pristine` and reuse them; destroy
    /// clones whose job failed, timed out or was interrupted
    #[default]
    RecreateOnFailure,
    AlwaysRecreate,
    AlwaysRecycle,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live clones per spec
    pub clones_per_environment: usize,
    pub recycle: RecyclePolicy,
    /// Provide the shared compiler cache dataset
    pub ccache: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            clones_per_environment: 1,
            recycle: RecyclePolicy::default(),
            ccache: false,
        }
    }
}

/// State a job left its environment in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    /// Every phase completed
    Clean,
    /// A phase failed or was killed; the filesystem state is unknown
    Tainted,
}

/// A mounted clone bound to one job.
#[derive(Debug)]
pub struct Environment {
    pub dataset: String,
    /// Mountpoint of the clone on the host
    pub root: PathBuf,
    pub definition: Arc<EnvironmentDefinition>,
    /// Host directory holding packages built for this environment
    pub packages_dir: PathBuf,
    pub ccache_dir: Option<PathBuf>,
    _permit: OwnedSemaphorePermit,
}

impl Environment {
    pub fn name(&self) -> &str {
        leaf(&self.dataset)
    }
}

#[derive(Debug, Clone)]
enum BaseState {
    Unchecked,
    Ready { packages_dir: PathBuf },
    Failed(String),
}

struct SpecSlot {
    definition: Arc<EnvironmentDefinition>,
    base: tokio::sync::Mutex<BaseState>,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct CloneBook {
    idle: HashMap<EnvironmentSpec, Vec<String>>,
    next_slot: HashMap<EnvironmentSpec, usize>,
}

pub struct EnvironmentPool {
    store: Arc<dyn SnapshotStore>,
    images: Arc<dyn BaseImageProvider>,
    layout: StorageLayout,
    run: RunInstance,
    config: PoolConfig,
    specs: HashMap<EnvironmentSpec, SpecSlot>,
    clones: Mutex<CloneBook>,
    ccache_dir: tokio::sync::OnceCell<Option<PathBuf>>,
    closed: AtomicBool,
}

impl EnvironmentPool {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        images: Arc<dyn BaseImageProvider>,
        layout: StorageLayout,
        run: RunInstance,
        definitions: &[Arc<EnvironmentDefinition>],
        config: PoolConfig,
    ) -> Self {
        let permits = config.clones_per_environment.max(1);
        let specs = definitions
            .iter()
            .map(|definition| {
                (
                    definition.spec.clone(),
                    SpecSlot {
                        definition: Arc::clone(definition),
                        base: tokio::sync::Mutex::new(BaseState::Unchecked),
                        permits: Arc::new(Semaphore::new(permits)),
                    },
                )
            })
            .collect();

        Self {
            store,
            images,
            layout,
            run,
            config,
            specs,
            clones: Mutex::new(CloneBook::default()),
            ccache_dir: tokio::sync::OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn run(&self) -> &RunInstance {
        &self.run
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    fn book(&self) -> std::sync::MutexGuard<'_, CloneBook> {
        self.clones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host directory for job logs, creating the logs dataset if needed.
    pub async fn logs_dir(&self) -> InfraResult<PathBuf> {
        let logs = self.layout.logs();
        if !self.store.exists(&logs).await? {
            self.store.create(&logs).await?;
        }
        Ok(self.store.mountpoint(&logs).await?)
    }

    /// Get an environment for `spec`, waiting while the per-spec clone cap is
    /// reached. The base is validated, and rebuilt if stale, on first use.
    pub async fn acquire(&self, spec: &EnvironmentSpec) -> InfraResult<Environment> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(InfrastructureError::PoolClosed);
        }
        let slot = self
            .specs
            .get(spec)
            .ok_or_else(|| InfrastructureError::UnknownEnvironment(spec.to_string()))?;

        let permit = Arc::clone(&slot.permits)
            .acquire_owned()
            .await
            .map_err(|_| InfrastructureError::PoolClosed)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(InfrastructureError::PoolClosed);
        }

        let packages_dir = self.ensure_base(slot).await?;
        let ccache_dir = self.ensure_ccache().await?;

        let reused = self.book().idle.get_mut(spec).and_then(Vec::pop);
        let dataset = match reused {
            Some(dataset) => {
                debug!(%dataset, "Reusing idle clone");
                dataset
            }
            None => self.create_clone(slot).await?,
        };

        let root = self.store.mountpoint(&dataset).await?;
        Ok(Environment {
            dataset,
            root,
            definition: Arc::clone(&slot.definition),
            packages_dir,
            ccache_dir,
            _permit: permit,
        })
    }

    /// Return an environment. Depending on the recycle policy and the
    /// disposition the clone is rolled back for reuse or destroyed.
    pub async fn release(&self, env: Environment, disposition: ReleaseDisposition) -> InfraResult<()> {
        let recycle = match (self.config.recycle, disposition) {
            (RecyclePolicy::AlwaysRecycle, _) => true,
            (RecyclePolicy::AlwaysRecreate, _) => false,
            (RecyclePolicy::RecreateOnFailure, ReleaseDisposition::Clean) => true,
            (RecyclePolicy::RecreateOnFailure, ReleaseDisposition::Tainted) => false,
        };

        if recycle && !self.closed.load(Ordering::SeqCst) {
            match self.store.rollback(&env.dataset, PRISTINE_SNAPSHOT).await {
                Ok(()) => {
                    debug!(dataset = %env.dataset, "Clone rolled back for reuse");
                    self.book()
                        .idle
                        .entry(env.definition.spec.clone())
                        .or_default()
                        .push(env.dataset.clone());
                    return Ok(());
                }
                Err(e) => warn!(dataset = %env.dataset, error = %e, "Rollback failed, destroying clone"),
            }
        }

        debug!(dataset = %env.dataset, ?disposition, "Destroying clone");
        self.store.destroy(&env.dataset).await?;
        Ok(())
    }

    /// Destroy every clone of this run. Base snapshots are kept.
    pub async fn teardown(&self) -> InfraResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        for slot in self.specs.values() {
            slot.permits.close();
        }
        let instances = self.layout.run_instances(&self.run);
        info!(%instances, "Destroying run clones");
        self.book().idle.clear();
        self.store.destroy(&instances).await?;
        Ok(())
    }

    async fn ensure_base(&self, slot: &SpecSlot) -> InfraResult<PathBuf> {
        let mut state = slot.base.lock().await;
        match &*state {
            BaseState::Ready { packages_dir } => return Ok(packages_dir.clone()),
            BaseState::Failed(reason) => {
                return Err(InfrastructureError::BaseUnavailable {
                    environment: slot.definition.name.clone(),
                    reason: reason.clone(),
                });
            }
            BaseState::Unchecked => {}
        }

        match self.prepare_base(&slot.definition).await {
            Ok(packages_dir) => {
                *state = BaseState::Ready {
                    packages_dir: packages_dir.clone(),
                };
                Ok(packages_dir)
            }
            Err(e) => {
                *state = BaseState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn base_is_current(&self, dataset: &str, spec: &EnvironmentSpec) -> InfraResult<bool> {
        let expected = [
            (PROP_SPEC_HASH, spec.tunables_hash.clone()),
            (PROP_EPOCH, BASE_EPOCH.to_string()),
            (PROP_VERSION, spec.version.clone()),
            (PROP_ARCH, spec.arch.clone()),
        ];
        for (property, value) in expected {
            let actual = self.store.get_property(dataset, property).await?;
            if actual.as_deref() != Some(value.as_str()) {
                debug!(dataset, property, ?actual, expected = %value, "Base property mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn prepare_base(&self, definition: &EnvironmentDefinition) -> InfraResult<PathBuf> {
        let packages = self.layout.packages(&definition.name);
        if !self.store.exists(&packages).await? {
            self.store.create(&packages).await?;
        }
        let packages_dir = self.store.mountpoint(&packages).await?;

        let dataset = self.layout.base(&definition.name);
        if self.store.exists(&dataset).await? {
            if self.base_is_current(&dataset, &definition.spec).await? {
                info!(environment = %definition.name, "Reusing base");
                return Ok(packages_dir);
            }
            info!(environment = %definition.name, "Base is incomplete or outdated, recreating");
            self.store.destroy(&dataset).await?;
        }

        info!(environment = %definition.name, spec = %definition.spec, "Creating base");
        self.store.create(&dataset).await?;
        if let Err(e) = self.populate_base(definition, &dataset).await {
            // an unfinished base has no properties and would be rebuilt anyway
            if let Err(cleanup) = self.store.destroy(&dataset).await {
                warn!(%dataset, error = %cleanup, "Failed to remove unfinished base");
            }
            return Err(e);
        }

        self.store.snapshot(&dataset, CLEAN_SNAPSHOT).await?;
        // properties last: their presence marks the base as complete
        let spec = &definition.spec;
        self.store.set_property(&dataset, PROP_SPEC_HASH, &spec.tunables_hash).await?;
        self.store.set_property(&dataset, PROP_VERSION, &spec.version).await?;
        self.store.set_property(&dataset, PROP_ARCH, &spec.arch).await?;
        self.store
            .set_property(&dataset, PROP_EPOCH, &BASE_EPOCH.to_string())
            .await?;

        info!(environment = %definition.name, "Base ready");
        Ok(packages_dir)
    }

    async fn populate_base(&self, definition: &EnvironmentDefinition, dataset: &str) -> InfraResult<()> {
        let root = self.store.mountpoint(dataset).await?;
        self.images.populate(definition, &root).await?;
        base_image::prepare_base_tree(&root, &definition.tunables)?;
        self.images
            .install_packages(&root, &definition.tunables.base_packages)
            .await
    }

    async fn ensure_ccache(&self) -> InfraResult<Option<PathBuf>> {
        if !self.config.ccache {
            return Ok(None);
        }
        let dir = self
            .ccache_dir
            .get_or_try_init(|| async {
                let dataset = self.layout.ccache();
                if !self.store.exists(&dataset).await? {
                    self.store.create(&dataset).await?;
                }
                Ok::<_, InfrastructureError>(Some(self.store.mountpoint(&dataset).await?))
            })
            .await?;
        Ok(dir.clone())
    }

    async fn create_clone(&self, slot: &SpecSlot) -> InfraResult<String> {
        let spec = &slot.definition.spec;
        let index = {
            let mut book = self.book();
            let next = book.next_slot.entry(spec.clone()).or_insert(0);
            let index = *next;
            *next += 1;
            index
        };

        let base = self.layout.base(&slot.definition.name);
        let dataset = self.layout.clone_name(&self.run, &slot.definition.name, index);
        info!(%dataset, "Cloning environment");

        self.store.clone_snapshot(&base, CLEAN_SNAPSHOT, &dataset).await?;
        let tagged = async {
            self.store.set_property(&dataset, PROP_RUN, self.run.as_str()).await?;
            self.store.snapshot(&dataset, PRISTINE_SNAPSHOT).await
        }
        .await;
        if let Err(e) = tagged {
            let _ = self.store.destroy(&dataset).await;
            return Err(e.into());
        }
        Ok(dataset)
    }
}

/// Destroy clones left behind by other run instances.
///
/// Returns the run instance datasets that were destroyed.
pub async fn cleanup_leftovers(
    store: &dyn SnapshotStore,
    layout: &StorageLayout,
    current: Option<&RunInstance>,
) -> InfraResult<Vec<String>> {
    let mut destroyed = Vec::new();
    for run_dataset in store.children(&layout.instances()).await? {
        if current.is_some_and(|run| leaf(&run_dataset) == run.as_str()) {
            continue;
        }
        info!(dataset = %run_dataset, "Destroying leftover clones");
        store.destroy(&run_dataset).await?;
        destroyed.push(run_dataset);
    }
    Ok(destroyed)
}
