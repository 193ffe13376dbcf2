//! Dependency resolution: requested variants to a graph of jobs.
//!
//! One job exists per (variant, environment spec). Build ordering edges
//! come from EXTRACT, PATCH, BUILD and RUN dependencies; dependencies with a
//! usable artifact are not expanded. TEST dependencies gate the depending
//! job in a second pass. When such a gate would close a cycle, because the
//! test dependency itself needs the package under test, the test runs in a
//! separate job ordered after both the build and the test dependency.

use crate::artifact::ArtifactIndex;
use crate::environment::{EnvironmentDefinition, EnvironmentSpec};
use crate::error::{ResolveError, ResolveResult, MetadataResult};
use crate::metadata::MetadataReader;
use crate::options::{OptionFilter, Variant, generate_combinations};
use crate::package::{DependencyKind, Package, PackageId};
use convenient_graph::{DAG, GraphError, NodeId};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub type JobId = NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Build the variant and, when requested, test it
    Build,
    /// Test a variant built by an earlier job
    DeferredTest,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub kind: JobKind,
    pub variant: Variant,
    pub environment: Arc<EnvironmentDefinition>,
    pub package: Arc<Package>,
    /// Named in the request rather than pulled in as a dependency
    pub requested: bool,
    /// Rebuild even if an artifact exists
    pub forced: bool,
    pub run_tests: bool,
    /// Variants installed before the build, in dependency order
    pub build_deps: Vec<Variant>,
    /// Variants installed before the test phase
    pub test_deps: Vec<Variant>,
    /// Earlier job of the same variant and spec whose outcome this one reuses
    pub duplicate_of: Option<JobId>,
}

impl Job {
    pub fn spec(&self) -> &EnvironmentSpec {
        &self.environment.spec
    }

    pub fn builds(&self) -> bool {
        self.kind == JobKind::Build
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.variant, self.environment.name)?;
        if self.kind == JobKind::DeferredTest {
            f.write_str(" (test)")?;
        }
        Ok(())
    }
}

/// Jobs with their ordering constraints.
#[derive(Debug, Clone)]
pub struct JobGraph {
    dag: DAG<Job, DependencyKind>,
    layers: Vec<Vec<JobId>>,
    priorities: HashMap<JobId, usize>,
}

impl JobGraph {
    fn new(dag: DAG<Job, DependencyKind>) -> ResolveResult<Self> {
        let layers = dag.layers();
        let priorities = dag
            .node_ids()
            .map(|id| dag.transitive_dependent_count(id).map(|count| (id, count)))
            .collect::<Result<HashMap<_, _>, GraphError>>()?;
        Ok(Self {
            dag,
            layers,
            priorities,
        })
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.dag.node(id).ok()
    }

    /// Jobs in creation order.
    pub fn jobs(&self) -> impl Iterator<Item = (JobId, &Job)> + '_ {
        self.dag
            .node_ids()
            .filter_map(|id| self.dag.node(id).ok().map(|job| (id, job)))
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs that must succeed before `id` may run.
    pub fn dependencies(&self, id: JobId) -> Vec<JobId> {
        self.dag.dependencies(id).unwrap_or_default()
    }

    pub fn dependents(&self, id: JobId) -> Vec<JobId> {
        self.dag.dependents(id).unwrap_or_default()
    }

    /// Number of jobs transitively waiting on `id`.
    pub fn priority(&self, id: JobId) -> usize {
        self.priorities.get(&id).copied().unwrap_or_default()
    }

    pub fn layers(&self) -> &[Vec<JobId>] {
        &self.layers
    }

    pub fn topological_order(&self) -> Vec<JobId> {
        self.dag.topological_sort()
    }
}

/// Which variants of each requested package to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSelection {
    pub default: bool,
    pub combinations: bool,
}

impl Default for VariantSelection {
    fn default() -> Self {
        Self {
            default: true,
            combinations: false,
        }
    }
}

/// Expand requested packages into variants: the default selection and/or
/// every generated option combination.
pub async fn requested_variants(
    reader: &dyn MetadataReader,
    packages: &[PackageId],
    filter: &OptionFilter,
    selection: VariantSelection,
) -> MetadataResult<Vec<Variant>> {
    let mut variants = Vec::new();
    for id in packages {
        if selection.default {
            variants.push(Variant::default_of(id.clone()));
        }
        if selection.combinations {
            let package = reader.read(id).await?;
            let combinations = generate_combinations(&package, filter);
            debug!(package = %id, count = combinations.len(), "Generated option combinations");
            variants.extend(
                combinations
                    .into_iter()
                    .map(|options| Variant::new(id.clone(), options)),
            );
        }
    }
    Ok(variants)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Test requested packages; dependencies are never tested
    pub run_tests: bool,
}

pub struct Resolver<'a> {
    reader: &'a dyn MetadataReader,
    index: &'a ArtifactIndex,
    options: ResolveOptions,
}

type Key = (Variant, EnvironmentSpec);

struct Builder<'r> {
    reader: &'r dyn MetadataReader,
    index: &'r ArtifactIndex,
    options: ResolveOptions,
    dag: DAG<Job, DependencyKind>,
    nodes: HashMap<Key, JobId>,
}

impl<'a> Resolver<'a> {
    pub fn new(reader: &'a dyn MetadataReader, index: &'a ArtifactIndex, options: ResolveOptions) -> Self {
        Self {
            reader,
            index,
            options,
        }
    }

    /// Build the job graph for `requests` on every environment.
    ///
    /// # Errors
    ///
    /// - `ResolveError::Metadata` when a package cannot be read
    /// - `ResolveError::DependencyCycle` when build dependencies form a cycle
    pub async fn resolve(
        &self,
        requests: &[Variant],
        environments: &[Arc<EnvironmentDefinition>],
    ) -> ResolveResult<JobGraph> {
        let mut builder = Builder {
            reader: self.reader,
            index: self.index,
            options: self.options,
            dag: DAG::new(),
            nodes: HashMap::new(),
        };
        for environment in environments {
            builder.resolve_environment(requests, environment).await?;
        }

        let graph = JobGraph::new(builder.dag)?;
        info!(
            jobs = graph.len(),
            layers = graph.layers().len(),
            "Resolved job graph"
        );
        Ok(graph)
    }
}

impl Builder<'_> {
    fn job_mut(&mut self, id: JobId) -> ResolveResult<&mut Job> {
        Ok(self.dag.node_mut(id)?)
    }

    fn job(&self, id: JobId) -> ResolveResult<&Job> {
        Ok(self.dag.node(id)?)
    }

    fn cycle(&self, err: GraphError) -> ResolveError {
        match err {
            GraphError::CycleDetected { to, path, .. } => {
                let name = |id: &JobId| {
                    self.dag
                        .node(*id)
                        .map(|job| job.variant.package.to_string())
                        .unwrap_or_else(|_| id.to_string())
                };
                let mut cycle: Vec<String> = path.iter().map(name).collect();
                cycle.push(name(&to));
                ResolveError::DependencyCycle { cycle }
            }
            other => ResolveError::Graph(other),
        }
    }

    async fn add_job(
        &mut self,
        variant: Variant,
        environment: &Arc<EnvironmentDefinition>,
        requested: bool,
    ) -> ResolveResult<JobId> {
        let package = self.reader.read(&variant.package).await?;
        let forced = self.index.is_forced(&variant.package);
        let key = (variant.clone(), environment.spec.clone());
        let id = self.dag.add_node(Job {
            kind: JobKind::Build,
            variant,
            environment: Arc::clone(environment),
            package,
            requested,
            forced,
            run_tests: requested && self.options.run_tests,
            build_deps: Vec::new(),
            test_deps: Vec::new(),
            duplicate_of: None,
        });
        let _ = self.nodes.insert(key, id);
        Ok(id)
    }

    async fn resolve_environment(
        &mut self,
        requests: &[Variant],
        environment: &Arc<EnvironmentDefinition>,
    ) -> ResolveResult<()> {
        let mut queue = VecDeque::new();
        let mut requested = Vec::new();

        for variant in requests {
            let key = (variant.clone(), environment.spec.clone());
            match self.nodes.get(&key).copied() {
                Some(first) if self.job(first)?.requested => {
                    let id = self.add_job(variant.clone(), environment, true).await?;
                    let _ = self.nodes.insert(key, first);
                    let job = self.job_mut(id)?;
                    job.duplicate_of = Some(first);
                    job.run_tests = false;
                    self.dag
                        .add_edge(first, id, DependencyKind::Build)
                        .map_err(|e| self.cycle(e))?;
                    debug!(variant = %variant, env = %environment.name, "Duplicate request");
                }
                Some(existing) => {
                    let run_tests = self.options.run_tests;
                    let job = self.job_mut(existing)?;
                    job.requested = true;
                    job.run_tests = run_tests;
                    requested.push(existing);
                }
                None => {
                    let id = self.add_job(variant.clone(), environment, true).await?;
                    queue.push_back(id);
                    requested.push(id);
                }
            }
        }
        self.expand(&mut queue, environment).await?;

        for id in requested {
            if self.job(id)?.run_tests {
                self.gate_tests(id, environment).await?;
            }
        }
        Ok(())
    }

    /// Breadth-first expansion of build ordering dependencies.
    async fn expand(
        &mut self,
        queue: &mut VecDeque<JobId>,
        environment: &Arc<EnvironmentDefinition>,
    ) -> ResolveResult<()> {
        let spec = &environment.spec;
        while let Some(id) = queue.pop_front() {
            let job = self.job(id)?;
            let package = Arc::clone(&job.package);
            if let Some(flag) = package.skip_flag() {
                debug!(package = %package.id, %flag.kind, "Not expanding flagged package");
                continue;
            }

            let mut build_deps = Vec::new();
            for dep in package.build_dependencies() {
                if dep.package == package.id {
                    continue;
                }
                let variant = Variant::default_of(dep.package.clone());
                build_deps.push(variant.clone());
                if self.index.satisfies(&variant, spec) {
                    continue;
                }

                let key = (variant.clone(), spec.clone());
                let dep_id = match self.nodes.get(&key).copied() {
                    Some(dep_id) => dep_id,
                    None => {
                        let dep_id = self.add_job(variant, environment, false).await?;
                        queue.push_back(dep_id);
                        dep_id
                    }
                };
                self.dag
                    .add_edge(dep_id, id, dep.kind)
                    .map_err(|e| self.cycle(e))?;
            }
            self.job_mut(id)?.build_deps = build_deps;
        }
        Ok(())
    }

    async fn gate_tests(&mut self, id: JobId, environment: &Arc<EnvironmentDefinition>) -> ResolveResult<()> {
        let spec = environment.spec.clone();
        let job = self.job(id)?;
        let package = Arc::clone(&job.package);
        if package.skip_flag().is_some() {
            return Ok(());
        }

        let mut test_deps = Vec::new();
        let mut gates = Vec::new();
        for dep in package.test_dependencies() {
            if *dep == package.id {
                // satisfied by this job's own build
                continue;
            }
            let variant = Variant::default_of(dep.clone());
            test_deps.push(variant.clone());
            if self.index.satisfies(&variant, &spec) {
                continue;
            }

            let key = (variant.clone(), spec.clone());
            let dep_id = match self.nodes.get(&key).copied() {
                Some(dep_id) => dep_id,
                None => {
                    let dep_id = self.add_job(variant, environment, false).await?;
                    let mut queue = VecDeque::from([dep_id]);
                    self.expand(&mut queue, environment).await?;
                    dep_id
                }
            };
            gates.push(dep_id);
        }

        if gates.is_empty() {
            self.job_mut(id)?.test_deps = test_deps;
            return Ok(());
        }

        let job = self.job_mut(id)?;
        job.run_tests = false;
        let mut deferred_job = job.clone();
        deferred_job.kind = JobKind::DeferredTest;
        deferred_job.run_tests = true;
        deferred_job.forced = false;
        deferred_job.test_deps = std::iter::once(job.variant.clone()).chain(test_deps).collect();

        let gates_len = gates.len();
        let test_id = self.dag.add_node(deferred_job);
        self.dag.add_edge(id, test_id, DependencyKind::Build)?;
        for gate in gates {
            self.dag.add_edge(gate, test_id, DependencyKind::Test)?;
        }
        debug!(job = %self.job(test_id)?, gates = gates_len, "Test split from its build");
        Ok(())
    }
}
