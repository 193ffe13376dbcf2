//! Job scheduler with priority dispatch.
//!
//! The scheduler is the single coordinator of a run. Ready jobs queue for
//! one of the worker slots, which are handed out by priority: jobs with the
//! most transitive dependents go first, ties broken by job order. A job
//! holds its slot while it waits for an environment from the pool, so
//! clones are handed out in the same order.

use crate::artifact::{ArtifactIndex, ArtifactMetadata};
use crate::error::{ExecutionError, ExecutionResult, InfrastructureError};
use crate::layout::log_path;
use crate::options::Variant;
use crate::pool::{Environment, EnvironmentPool, ReleaseDisposition};
use crate::report::{JobRecord, Outcome, RunReport, SkipReason};
use crate::resolver::{Job, JobGraph, JobId, JobKind};
use crate::sandbox::{DependencyArtifact, ExecutionRequest, SandboxExecutor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{self, AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once
    pub workers: usize,
    /// Stop dispatching after the first failure
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            fail_fast: false,
        }
    }
}

/// Job priority for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPriority {
    /// Number of jobs transitively waiting on this one (higher first)
    pub dependents: usize,

    /// Position in the graph (lower first)
    pub order: Reverse<usize>,
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dependents
            .cmp(&other.dependents)
            .then(self.order.cmp(&other.order))
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ready job waiting for a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledJob {
    id: JobId,
    priority: JobPriority,
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum Event {
    Acquired {
        id: JobId,
        env: Environment,
    },
    AcquireFailed {
        id: JobId,
        error: InfrastructureError,
    },
    Finished {
        id: JobId,
        result: ExecutionResult<Option<ArtifactMetadata>>,
        duration: Duration,
        release_error: Option<InfrastructureError>,
    },
}

#[derive(Debug, Clone)]
enum Finish {
    Succeeded,
    Failed(String),
    TimedOut(String),
    Skipped(SkipReason),
}

/// Bookkeeping of one run.
struct RunState<'g> {
    graph: &'g JobGraph,
    waiting_on: HashMap<JobId, usize>,
    records: HashMap<JobId, JobRecord>,
    logs: HashMap<JobId, PathBuf>,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g JobGraph) -> Self {
        let waiting_on = graph
            .jobs()
            .map(|(id, _)| (id, graph.dependencies(id).len()))
            .collect();
        Self {
            graph,
            waiting_on,
            records: HashMap::new(),
            logs: HashMap::new(),
        }
    }

    fn is_done(&self, id: JobId) -> bool {
        self.records.contains_key(&id)
    }

    fn priority(&self, id: JobId) -> JobPriority {
        JobPriority {
            dependents: self.graph.priority(id),
            order: Reverse(id.index()),
        }
    }

    fn finish(&mut self, id: JobId, finish: Finish, duration: Duration) {
        let graph = self.graph;
        let Some(job) = graph.job(id) else {
            return;
        };
        let (outcome, skip_reason, error) = match finish {
            Finish::Succeeded => (Outcome::Succeeded, None, None),
            Finish::Failed(e) => (Outcome::Failed, None, Some(e)),
            Finish::TimedOut(e) => (Outcome::TimedOut, None, Some(e)),
            Finish::Skipped(reason) => (Outcome::Skipped, Some(reason), None),
        };
        match outcome {
            Outcome::Succeeded => info!(job = %job, "✓ Job succeeded"),
            Outcome::Skipped => debug!(job = %job, "Job skipped"),
            _ => warn!(job = %job, ?outcome, error = error.as_deref().unwrap_or_default(), "✗ Job did not succeed"),
        }

        let record = JobRecord {
            id: id.index(),
            package: job.variant.package.to_string(),
            variant: job.variant.options.to_string(),
            environment: job.environment.name.clone(),
            spec: job.spec().to_string(),
            kind: match job.kind {
                JobKind::Build => "build".to_string(),
                JobKind::DeferredTest => "test".to_string(),
            },
            outcome,
            skip_reason,
            error,
            duration_s: duration.as_secs_f64(),
            log: self.logs.get(&id).cloned(),
        };
        let _ = self.records.insert(id, record);
    }

    /// Mark `id` succeeded and return the dependents that became ready.
    fn succeed(&mut self, id: JobId, duration: Duration) -> Vec<JobId> {
        self.finish(id, Finish::Succeeded, duration);
        let mut ready = Vec::new();
        for dependent in self.graph.dependents(id) {
            if let Some(count) = self.waiting_on.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 && !self.records.contains_key(&dependent) {
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// Skip every job transitively depending on `root`.
    fn cascade(&mut self, root: JobId) {
        let Some(package) = self.graph.job(root).map(|job| job.variant.to_string()) else {
            return;
        };
        let mut stack: Vec<(JobId, JobId)> = self
            .graph
            .dependents(root)
            .into_iter()
            .map(|d| (root, d))
            .collect();
        while let Some((parent, id)) = stack.pop() {
            if self.is_done(id) {
                continue;
            }
            let duplicate = self
                .graph
                .job(id)
                .is_some_and(|job| job.duplicate_of == Some(parent));
            let reason = if duplicate {
                SkipReason::Duplicate { of: package.clone() }
            } else {
                SkipReason::Dependency {
                    package: package.clone(),
                }
            };
            self.finish(id, Finish::Skipped(reason), Duration::ZERO);
            stack.extend(self.graph.dependents(id).into_iter().map(|d| (id, d)));
        }
    }
}

pub struct Scheduler {
    pool: Arc<EnvironmentPool>,
    executor: Arc<SandboxExecutor>,
    index: Arc<ArtifactIndex>,
    config: SchedulerConfig,
    logs_dir: PathBuf,
    interrupt: watch::Receiver<bool>,
}

async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    if interrupt.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Scheduler {
    pub fn new(
        pool: Arc<EnvironmentPool>,
        executor: Arc<SandboxExecutor>,
        index: Arc<ArtifactIndex>,
        config: SchedulerConfig,
        logs_dir: PathBuf,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            executor,
            index,
            config,
            logs_dir,
            interrupt,
        }
    }

    /// Run every job of `graph` and report the outcomes.
    ///
    /// Clones are released as jobs finish; destroying the run's clones is
    /// left to [`EnvironmentPool::teardown`].
    pub async fn run(&self, graph: &JobGraph) -> RunReport {
        let started = Utc::now();
        let workers = self.config.workers.max(1);
        info!(jobs = graph.len(), workers, run = %self.pool.run(), "Starting run");

        let mut state = RunState::new(graph);
        let mut ready: VecDeque<JobId> = graph
            .topological_order()
            .into_iter()
            .filter(|id| graph.dependencies(*id).is_empty())
            .collect();
        let mut pending: BinaryHeap<ScheduledJob> = BinaryHeap::new();
        let mut tasks: JoinSet<Event> = JoinSet::new();
        // tasks holding a worker slot, by task id
        let mut acquiring: HashMap<task::Id, (JobId, AbortHandle)> = HashMap::new();
        let mut running: HashMap<task::Id, JobId> = HashMap::new();
        let mut halt: Option<SkipReason> = None;
        let mut interrupt = self.interrupt.clone();

        loop {
            while let Some(id) = ready.pop_front() {
                if halt.is_some() || state.is_done(id) {
                    continue;
                }
                ready.extend(self.start(&mut state, &mut pending, id));
            }

            if halt.is_some() {
                pending.clear();
            }

            while acquiring.len() + running.len() < workers {
                let Some(next) = pending.pop() else {
                    break;
                };
                if let Some(handle) = self.acquire(graph, &mut tasks, next.id) {
                    let _ = acquiring.insert(handle.id(), (next.id, handle));
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next_with_id() => joined,
                _ = interrupted(&mut interrupt), if halt != Some(SkipReason::Interrupted) => {
                    warn!("Interrupted, cancelling running jobs");
                    halt = Some(SkipReason::Interrupted);
                    for (_, handle) in acquiring.values() {
                        handle.abort();
                    }
                    continue;
                }
            };
            let (task, event) = match joined {
                Some(Ok(joined)) => joined,
                Some(Err(e)) => {
                    let job = running
                        .remove(&e.id())
                        .or_else(|| acquiring.remove(&e.id()).map(|(job, _)| job));
                    match job {
                        Some(id) if e.is_panic() => {
                            error!(job = id.index(), error = %e, "Job task panicked");
                            state.finish(id, Finish::Failed(format!("job task panicked: {e}")), Duration::ZERO);
                            state.cascade(id);
                            if self.config.fail_fast && halt.is_none() {
                                halt = Some(SkipReason::FailFast);
                            }
                        }
                        Some(id) => debug!(job = id.index(), "Environment request cancelled"),
                        None => error!(error = %e, "Unknown task failed"),
                    }
                    continue;
                }
                None => break,
            };

            match event {
                Event::Acquired { id, env } => {
                    let _ = acquiring.remove(&task);
                    if halt.is_some() {
                        if let Err(e) = self.pool.release(env, ReleaseDisposition::Clean).await {
                            warn!(error = %e, "Failed to release unused environment");
                        }
                    } else if let Some(handle) = self.dispatch(&mut state, &mut tasks, id, env).await {
                        let _ = running.insert(handle.id(), id);
                    }
                }
                Event::AcquireFailed { id, error } => {
                    let _ = acquiring.remove(&task);
                    error!(job = id.index(), error = %error, "Environment unavailable");
                    if error.is_host_global() && halt.is_none() {
                        halt = Some(SkipReason::Aborted {
                            reason: error.to_string(),
                        });
                    }
                    state.finish(id, Finish::Failed(error.to_string()), Duration::ZERO);
                    state.cascade(id);
                    if self.config.fail_fast && halt.is_none() {
                        halt = Some(SkipReason::FailFast);
                    }
                }
                Event::Finished {
                    id,
                    result,
                    duration,
                    release_error,
                } => {
                    let _ = running.remove(&task);
                    if let Some(e) = release_error {
                        warn!(job = id.index(), error = %e, "Failed to release environment");
                        if e.is_host_global() && halt.is_none() {
                            halt = Some(SkipReason::Aborted {
                                reason: e.to_string(),
                            });
                        }
                    }
                    let failed = self.complete(&mut state, &mut ready, id, result, duration, &mut halt);
                    if failed && self.config.fail_fast && halt.is_none() {
                        info!("Fail-fast: no further jobs will be started");
                        halt = Some(SkipReason::FailFast);
                    }
                }
            }
        }

        let reason = halt.unwrap_or(SkipReason::Aborted {
            reason: "job never became ready".to_string(),
        });
        for (id, _) in graph.jobs() {
            if !state.is_done(id) {
                state.finish(id, Finish::Skipped(reason.clone()), Duration::ZERO);
            }
        }

        let report = RunReport::new(
            self.pool.run().as_str(),
            started,
            state.records.into_values().collect(),
        );
        info!(
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            timed_out = report.summary.timed_out,
            skipped = report.summary.skipped(),
            "Run finished"
        );
        report
    }

    /// Handle a job whose dependencies are satisfied: resolve it on the spot
    /// or queue it for a worker. Returns jobs that became ready without
    /// running anything.
    fn start(
        &self,
        state: &mut RunState<'_>,
        pending: &mut BinaryHeap<ScheduledJob>,
        id: JobId,
    ) -> Vec<JobId> {
        let graph = state.graph;
        let Some(job) = graph.job(id) else {
            return Vec::new();
        };

        if let Some(first) = job.duplicate_of {
            debug!(job = %job, "Reusing outcome of identical job");
            if let Some(log) = state.logs.get(&first).cloned() {
                let _ = state.logs.insert(id, log);
            }
            return state.succeed(id, Duration::ZERO);
        }

        if let Some(flag) = SandboxExecutor::preflight(&job.package) {
            info!(job = %job, flag = %flag.kind, reason = %flag.reason, "Skipping flagged package");
            let reason = SkipReason::Flagged {
                flag: flag.kind.to_string(),
                reason: flag.reason.clone(),
            };
            state.finish(id, Finish::Skipped(reason), Duration::ZERO);
            state.cascade(id);
            return Vec::new();
        }

        let mut log = log_path(&self.logs_dir, self.pool.run(), &job.environment.name, &job.variant);
        if job.kind == JobKind::DeferredTest {
            let _ = log.set_extension("test.log");
        }
        let _ = state.logs.insert(id, log);

        pending.push(ScheduledJob {
            id,
            priority: state.priority(id),
        });
        Vec::new()
    }

    /// Request an environment for a job that was granted a worker slot.
    fn acquire(&self, graph: &JobGraph, tasks: &mut JoinSet<Event>, id: JobId) -> Option<AbortHandle> {
        let job = graph.job(id)?;
        let pool = Arc::clone(&self.pool);
        let spec = job.spec().clone();
        debug!(job = %job, "Waiting for environment");
        Some(tasks.spawn(async move {
            match pool.acquire(&spec).await {
                Ok(env) => Event::Acquired { id, env },
                Err(error) => Event::AcquireFailed { id, error },
            }
        }))
    }

    fn artifacts(&self, job: &Job, variants: &[Variant]) -> ExecutionResult<Vec<DependencyArtifact>> {
        variants
            .iter()
            .map(|variant| {
                self.index
                    .lookup(variant, job.spec())
                    .metadata()
                    .cloned()
                    .map(|metadata| DependencyArtifact {
                        package: variant.package.clone(),
                        metadata,
                    })
                    .ok_or_else(|| ExecutionError::MissingArtifact(variant.to_string()))
            })
            .collect()
    }

    /// Start a job in its environment. Returns the task running it.
    async fn dispatch(
        &self,
        state: &mut RunState<'_>,
        tasks: &mut JoinSet<Event>,
        id: JobId,
        env: Environment,
    ) -> Option<AbortHandle> {
        let graph = state.graph;
        let job = graph.job(id)?;
        let deps = self
            .artifacts(job, &job.build_deps)
            .and_then(|build| Ok((build, self.artifacts(job, &job.test_deps)?)));
        let (build_deps, test_deps) = match deps {
            Ok(deps) => deps,
            Err(e) => {
                if let Err(release) = self.pool.release(env, ReleaseDisposition::Clean).await {
                    warn!(error = %release, "Failed to release environment");
                }
                state.finish(id, Finish::Failed(e.to_string()), Duration::ZERO);
                state.cascade(id);
                return None;
            }
        };

        let request = ExecutionRequest {
            variant: job.variant.clone(),
            package: Arc::clone(&job.package),
            build: job.builds(),
            test: job.run_tests,
            build_deps,
            test_deps,
            log_path: state.logs.get(&id).cloned().unwrap_or_default(),
        };
        info!(job = %job, env = %env.name(), "Job started");

        let pool = Arc::clone(&self.pool);
        let executor = Arc::clone(&self.executor);
        Some(tasks.spawn(async move {
            let started = Instant::now();
            let result = executor.run(&env, &request).await;
            let duration = started.elapsed();
            let disposition = if result.is_ok() {
                ReleaseDisposition::Clean
            } else {
                ReleaseDisposition::Tainted
            };
            let release_error = pool.release(env, disposition).await.err();
            Event::Finished {
                id,
                result,
                duration,
                release_error,
            }
        }))
    }

    /// Record the outcome of a finished job. Returns whether it failed.
    fn complete(
        &self,
        state: &mut RunState<'_>,
        ready: &mut VecDeque<JobId>,
        id: JobId,
        result: ExecutionResult<Option<ArtifactMetadata>>,
        duration: Duration,
        halt: &mut Option<SkipReason>,
    ) -> bool {
        let graph = state.graph;
        let Some(job) = graph.job(id) else {
            return false;
        };
        match result {
            Ok(artifact) => {
                if let Some(artifact) = artifact {
                    self.index.record(&job.variant, job.spec(), artifact);
                }
                ready.extend(state.succeed(id, duration));
                false
            }
            Err(e) => {
                if job.forced && job.builds() {
                    // the stale artifact must not satisfy anything now
                    let _ = self.index.invalidate(&job.variant, job.spec());
                }
                if let ExecutionError::Infrastructure(infra) = &e {
                    if infra.is_host_global() && halt.is_none() {
                        *halt = Some(SkipReason::Aborted {
                            reason: infra.to_string(),
                        });
                    }
                }
                let finish = if e.is_timeout() {
                    Finish::TimedOut(e.to_string())
                } else {
                    Finish::Failed(e.to_string())
                };
                state.finish(id, finish, duration);
                state.cascade(id);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut heap = BinaryHeap::new();
        let entry = |dependents: usize, order: usize| JobPriority {
            dependents,
            order: Reverse(order),
        };
        heap.push(entry(0, 0));
        heap.push(entry(3, 2));
        heap.push(entry(3, 1));
        heap.push(entry(1, 3));

        let popped: Vec<_> = std::iter::from_fn(|| heap.pop()).collect();
        assert_eq!(popped, vec![entry(3, 1), entry(3, 2), entry(1, 3), entry(0, 0)]);
    }
}
