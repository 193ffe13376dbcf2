//! End-to-end runs of the scheduler over the directory-backed snapshot store
//! and host processes, with `sh -c` phase commands writing to a journal.

use async_trait::async_trait;
use convenient_ports::error::InfraResult;
use convenient_ports::metadata::ManifestReader;
use convenient_ports::pool::BaseImageProvider;
use convenient_ports::sandbox::{HostRuntime, PhaseCommands, PhaseTimeouts};
use convenient_ports::{
    ArtifactIndex, ArtifactState, DependencyKind, EnvironmentDefinition, EnvironmentPool,
    FlagKind, Outcome, Package, PackageId, PoolConfig, ResolveOptions, Resolver, RunInstance,
    RunReport, SandboxConfig, SandboxExecutor, Scheduler, SchedulerConfig, SkipReason,
    StorageLayout, Tunables, Variant,
};
use convenient_zfs::{MemoryStore, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

#[derive(Default)]
struct FakeImages {
    populated: AtomicUsize,
    /// Time taken to unpack a base
    delay: Duration,
    broken: bool,
}

#[async_trait]
impl BaseImageProvider for FakeImages {
    async fn populate(&self, _: &EnvironmentDefinition, root: &Path) -> InfraResult<()> {
        let _ = self.populated.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        assert!(!self.broken, "image provider crashed");
        std::fs::create_dir_all(root.join("etc"))?;
        Ok(())
    }
}

struct Harness {
    tmp: TempDir,
    store: Arc<MemoryStore>,
    images: Arc<FakeImages>,
    environment: Arc<EnvironmentDefinition>,
    journal: PathBuf,
}

struct RunSettings {
    commands: PhaseCommands,
    timeouts: PhaseTimeouts,
    scheduler: SchedulerConfig,
    run_tests: bool,
    index: ArtifactIndex,
    interrupt_after: Option<Duration>,
}

impl Harness {
    fn new() -> Self {
        Self::with_images(FakeImages::default())
    }

    fn with_images(images: FakeImages) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(tmp.path().join("pool")).unwrap());
        let journal = tmp.path().join("journal");
        std::fs::write(&journal, "").unwrap();
        let environment = Arc::new(
            EnvironmentDefinition::new("14-amd64", "14.1-RELEASE", "amd64", Tunables::default(), vec![])
                .unwrap(),
        );
        Self {
            tmp,
            store,
            images: Arc::new(images),
            environment,
            journal,
        }
    }

    /// `sh -c` command appending `<step> <origin>` to the journal.
    fn step(&self, step: &str) -> Vec<String> {
        self.script(&format!("echo {step} {{origin}} >> {}", self.journal.display()))
    }

    fn script(&self, script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn commands(&self) -> PhaseCommands {
        PhaseCommands {
            install_built: self.script(&format!(
                "echo install {{package_file}} >> {}",
                self.journal.display()
            )),
            install_prebuilt: self.script(&format!(
                "echo install-prebuilt {{package}} >> {}",
                self.journal.display()
            )),
            fetch: self.step("fetch"),
            extract: self.step("extract"),
            patch: self.step("patch"),
            build: self.step("build"),
            stage: self.step("stage"),
            package: self.step("package"),
            test: self.step("test"),
            check_plist: Vec::new(),
            stage_qa: Vec::new(),
            package_name: Vec::new(),
            shared_libraries: Vec::new(),
        }
    }

    fn settings(&self) -> RunSettings {
        RunSettings {
            commands: self.commands(),
            timeouts: PhaseTimeouts::default(),
            scheduler: SchedulerConfig::default(),
            run_tests: true,
            index: ArtifactIndex::new(),
            interrupt_after: None,
        }
    }

    fn journal(&self) -> Vec<String> {
        std::fs::read_to_string(&self.journal)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn position(&self, line: &str) -> usize {
        let journal = self.journal();
        journal
            .iter()
            .position(|l| l == line)
            .unwrap_or_else(|| panic!("`{line}` not in {journal:?}"))
    }

    async fn run(
        &self,
        name: &str,
        reader: &ManifestReader,
        wanted: &[&str],
        settings: RunSettings,
    ) -> (RunReport, Arc<ArtifactIndex>) {
        let requests: Vec<Variant> = wanted.iter().map(|w| Variant::default_of(id(w))).collect();
        let environments = vec![Arc::clone(&self.environment)];
        let index = Arc::new(settings.index);
        let graph = Resolver::new(
            reader,
            &index,
            ResolveOptions {
                run_tests: settings.run_tests,
            },
        )
        .resolve(&requests, &environments)
        .await
        .unwrap();

        let pool = Arc::new(EnvironmentPool::new(
            Arc::clone(&self.store) as Arc<dyn SnapshotStore>,
            Arc::clone(&self.images) as Arc<dyn BaseImageProvider>,
            StorageLayout::new("tank/reprise"),
            RunInstance::from_name(name),
            &environments,
            PoolConfig {
                clones_per_environment: settings.scheduler.workers,
                ..PoolConfig::default()
            },
        ));

        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        if let Some(after) = settings.interrupt_after {
            let sender = Arc::clone(&tx);
            let _ = tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = sender.send(true);
            });
        }

        let config = SandboxConfig {
            timeouts: settings.timeouts,
            commands: settings.commands,
            ..SandboxConfig::default()
        };
        let executor = Arc::new(SandboxExecutor::new(Arc::new(HostRuntime::new()), config, rx.clone()));
        let scheduler = Scheduler::new(
            Arc::clone(&pool),
            executor,
            Arc::clone(&index),
            settings.scheduler,
            self.tmp.path().join("logs"),
            rx,
        );

        let report = scheduler.run(&graph).await;
        pool.teardown().await.unwrap();
        drop(tx);
        (report, index)
    }
}

fn id(s: &str) -> PackageId {
    s.parse().unwrap()
}

fn outcome(report: &RunReport, package: &str) -> Outcome {
    report
        .jobs
        .iter()
        .find(|j| j.package == package)
        .unwrap_or_else(|| panic!("no job for {package}"))
        .outcome
}

fn skip_reason(report: &RunReport, package: &str) -> Option<SkipReason> {
    report
        .jobs
        .iter()
        .find(|j| j.package == package)
        .and_then(|j| j.skip_reason.clone())
}

#[tokio::test]
async fn test_dependencies_build_first_and_only_requested_ports_are_tested() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app"))
            .with_dependency(id("devel/lib"), DependencyKind::Build)
            .with_dependency(id("devel/rt"), DependencyKind::Run),
        Package::new(id("devel/lib")).with_dependency(id("devel/rt"), DependencyKind::Extract),
        Package::new(id("devel/rt")),
    ]);

    let (report, index) = h.run("r1", &reader, &["www/app"], h.settings()).await;

    assert_eq!(report.summary.succeeded, 3, "{report}");
    assert_eq!(report.exit_code(), 0);
    assert!(h.position("package devel/rt") < h.position("install All/devel_rt.pkg"));
    assert!(h.position("install All/devel_rt.pkg") < h.position("fetch devel/lib"));
    assert!(h.position("package devel/lib") < h.position("fetch www/app"));
    assert!(h.position("package www/app") < h.position("test www/app"));
    assert!(!h.journal().iter().any(|l| l == "test devel/lib"));

    let app = index.lookup(&Variant::default_of(id("www/app")), &h.environment.spec);
    assert!(matches!(app, ArtifactState::BuiltThisRun(_)));

    // every job wrote its log
    for job in &report.jobs {
        let log = std::fs::read_to_string(job.log.as_ref().unwrap()).unwrap();
        assert!(log.contains("= Fetch phase ="), "{log}");
    }
}

#[tokio::test]
async fn test_test_cycle_runs_the_test_in_a_later_job() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("devel/py-pytest")).with_dependency(id("devel/py-plugin"), DependencyKind::Test),
        Package::new(id("devel/py-plugin")).with_dependency(id("devel/py-pytest"), DependencyKind::Run),
    ]);

    let (report, _) = h.run("r1", &reader, &["devel/py-pytest"], h.settings()).await;

    assert_eq!(report.summary.succeeded, 3, "{report}");
    assert_eq!(report.jobs.iter().filter(|j| j.kind == "test").count(), 1);
    assert!(h.position("package devel/py-plugin") < h.position("test devel/py-pytest"));
    // the deferred job installs the package under test and its test dependency
    let journal = h.journal();
    let test = h.position("test devel/py-pytest");
    assert!(journal[..test].iter().any(|l| l == "install All/devel_py-plugin.pkg"));
    assert_eq!(journal.iter().filter(|l| *l == "build devel/py-pytest").count(), 1);
}

#[tokio::test]
async fn test_worker_limit_bounds_parallel_jobs() {
    let h = Harness::new();
    let reader = ManifestReader::new(
        ["devel/a", "devel/b", "devel/c", "devel/d"]
            .map(|p| Package::new(id(p))),
    );
    let journal = h.journal.display().to_string();
    let mut settings = h.settings();
    settings.commands.build = h.script(&format!(
        "echo start >> {journal}; sleep 0.3; echo end >> {journal}"
    ));
    settings.scheduler = SchedulerConfig {
        workers: 2,
        fail_fast: false,
    };

    let (report, _) = h
        .run("r1", &reader, &["devel/a", "devel/b", "devel/c", "devel/d"], settings)
        .await;
    assert_eq!(report.summary.succeeded, 4, "{report}");

    let mut running = 0i32;
    let mut peak = 0;
    for line in h.journal() {
        match line.as_str() {
            "start" => running += 1,
            "end" => running -= 1,
            _ => {}
        }
        peak = peak.max(running);
    }
    assert!(peak <= 2, "peak concurrency {peak}");
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_fail_fast_starts_nothing_after_a_failure() {
    let h = Harness::new();
    let reader = ManifestReader::new(["devel/bad", "devel/b", "devel/c"].map(|p| Package::new(id(p))));
    let mut settings = h.settings();
    settings.commands.build = h.script("case {origin} in devel/bad) exit 2;; esac");
    settings.scheduler = SchedulerConfig {
        workers: 1,
        fail_fast: true,
    };

    let (report, _) = h.run("r1", &reader, &["devel/bad", "devel/b", "devel/c"], settings).await;

    assert_eq!(outcome(&report, "devel/bad"), Outcome::Failed);
    assert!(report.jobs[0].error.as_deref().unwrap().contains("phase build exited with status 2"));
    assert_eq!(skip_reason(&report, "devel/b"), Some(SkipReason::FailFast));
    assert_eq!(skip_reason(&report, "devel/c"), Some(SkipReason::FailFast));
    assert_eq!(report.summary.skipped_not_run, 2);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_fail_fast_lets_running_jobs_finish() {
    let h = Harness::new();
    let ports = ["devel/bad", "devel/b", "devel/c", "devel/d"];
    let reader = ManifestReader::new(ports.map(|p| Package::new(id(p))));
    let mut settings = h.settings();
    settings.commands.build = h.script("case {origin} in devel/bad) exit 1;; devel/b|devel/c) sleep 1;; esac");
    settings.scheduler = SchedulerConfig {
        workers: 3,
        fail_fast: true,
    };

    let (report, _) = h.run("r1", &reader, &ports, settings).await;

    assert_eq!(outcome(&report, "devel/bad"), Outcome::Failed);
    assert_eq!(outcome(&report, "devel/b"), Outcome::Succeeded, "{report}");
    assert_eq!(outcome(&report, "devel/c"), Outcome::Succeeded, "{report}");
    assert_eq!(skip_reason(&report, "devel/d"), Some(SkipReason::FailFast));
    assert!(!h.journal().iter().any(|l| l.ends_with("devel/d")));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_workers_go_to_jobs_with_the_most_dependents() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("devel/a")),
        Package::new(id("www/x")).with_dependency(id("devel/b"), DependencyKind::Build),
        Package::new(id("devel/b")),
    ]);
    let mut settings = h.settings();
    settings.scheduler.workers = 1;

    let (report, _) = h.run("r1", &reader, &["devel/a", "www/x"], settings).await;

    assert_eq!(report.summary.succeeded, 3, "{report}");
    assert!(h.position("build devel/b") < h.position("build devel/a"));
}

#[tokio::test]
async fn test_failed_test_dependency_does_not_block_the_build() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("devel/bad"), DependencyKind::Test),
        Package::new(id("devel/bad")),
    ]);
    let mut settings = h.settings();
    settings.commands.build = h.script(&format!(
        "case {{origin}} in devel/bad) exit 1;; esac; echo build {{origin}} >> {}",
        h.journal.display()
    ));

    let (report, _) = h.run("r1", &reader, &["www/app"], settings).await;

    let job = |kind: &str| {
        report
            .jobs
            .iter()
            .find(|j| j.package == "www/app" && j.kind == kind)
            .unwrap_or_else(|| panic!("no {kind} job in {report}"))
    };
    assert_eq!(job("build").outcome, Outcome::Succeeded);
    assert_eq!(
        job("test").skip_reason,
        Some(SkipReason::Dependency {
            package: "devel/bad".to_string()
        })
    );
    assert_eq!(outcome(&report, "devel/bad"), Outcome::Failed);
    assert!(h.journal().iter().any(|l| l == "build www/app"));
    assert!(!h.journal().iter().any(|l| l == "test www/app"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_ignored_package_skips_dependents_without_failing() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("net/gone"), DependencyKind::Build),
        Package::new(id("net/gone")).with_flag(FlagKind::Ignore, "unfetchable"),
        Package::new(id("devel/other")),
    ]);

    let (report, _) = h
        .run("r1", &reader, &["www/app", "devel/other"], h.settings())
        .await;

    assert_eq!(
        skip_reason(&report, "net/gone"),
        Some(SkipReason::Flagged {
            flag: "IGNORE".to_string(),
            reason: "unfetchable".to_string()
        })
    );
    assert_eq!(
        skip_reason(&report, "www/app"),
        Some(SkipReason::Dependency {
            package: "net/gone".to_string()
        })
    );
    assert_eq!(outcome(&report, "devel/other"), Outcome::Succeeded);
    assert_eq!(report.summary.skipped_flagged, 1);
    assert_eq!(report.summary.skipped_dependency, 1);
    assert_eq!(report.exit_code(), 0);
    assert!(!h.journal().iter().any(|l| l.ends_with("net/gone")));
}

#[tokio::test]
async fn test_failed_forced_rebuild_drops_the_prebuilt_package() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("devel/lib"), DependencyKind::Build),
        Package::new(id("devel/lib")),
    ]);
    let mut settings = h.settings();
    settings.index = ArtifactIndex::with_forced([id("devel/lib")]);
    settings
        .index
        .load_catalog(
            &h.environment.spec,
            r#"{"name":"lib","version":"1.0","origin":"devel/lib"}"#.as_bytes(),
        )
        .unwrap();
    settings.commands.build = h.script("case {origin} in devel/lib) exit 1;; esac");

    let (report, index) = h.run("r1", &reader, &["www/app"], settings).await;

    assert_eq!(outcome(&report, "devel/lib"), Outcome::Failed);
    assert_eq!(outcome(&report, "www/app"), Outcome::Skipped);
    assert_eq!(
        index.lookup(&Variant::default_of(id("devel/lib")), &h.environment.spec),
        ArtifactState::Absent
    );
}

#[tokio::test]
async fn test_prebuilt_dependency_is_installed_not_built() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("devel/lib"), DependencyKind::Build),
        Package::new(id("devel/lib")),
    ]);
    let settings = h.settings();
    settings
        .index
        .load_catalog(
            &h.environment.spec,
            r#"{"name":"lib","version":"1.0","origin":"devel/lib"}"#.as_bytes(),
        )
        .unwrap();

    let (report, _) = h.run("r1", &reader, &["www/app"], settings).await;

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.summary.succeeded, 1);
    assert!(h.position("install-prebuilt lib-1.0") < h.position("fetch www/app"));
    assert!(!h.journal().iter().any(|l| l == "build devel/lib"));
}

#[tokio::test]
async fn test_timeout_kills_the_phase() {
    let h = Harness::new();
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("devel/slow"), DependencyKind::Build),
        Package::new(id("devel/slow")),
    ]);
    let mut settings = h.settings();
    settings.commands.build = h.script("case {origin} in devel/slow) sleep 30;; esac");
    settings.timeouts.build = 1;

    let started = Instant::now();
    let (report, _) = h.run("r1", &reader, &["www/app"], settings).await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome(&report, "devel/slow"), Outcome::TimedOut);
    assert_eq!(
        skip_reason(&report, "www/app"),
        Some(SkipReason::Dependency {
            package: "devel/slow".to_string()
        })
    );
    assert_eq!(report.summary.timed_out, 1);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_interrupt_stops_running_and_pending_jobs() {
    let h = Harness::new();
    let reader = ManifestReader::new(["devel/slow", "devel/later"].map(|p| Package::new(id(p))));
    let mut settings = h.settings();
    settings.commands.build = h.script("sleep 30");
    settings.scheduler.workers = 1;
    settings.interrupt_after = Some(Duration::from_millis(500));

    let started = Instant::now();
    let (report, _) = h.run("r1", &reader, &["devel/slow", "devel/later"], settings).await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome(&report, "devel/slow"), Outcome::Failed);
    assert!(report.jobs[0].error.as_deref().unwrap().contains("interrupted"));
    assert_eq!(skip_reason(&report, "devel/later"), Some(SkipReason::Interrupted));
}

#[tokio::test]
async fn test_interrupt_cancels_jobs_waiting_for_a_base() {
    let h = Harness::with_images(FakeImages {
        delay: Duration::from_secs(60),
        ..FakeImages::default()
    });
    let reader = ManifestReader::new(["devel/a", "devel/b"].map(|p| Package::new(id(p))));
    let mut settings = h.settings();
    settings.scheduler.workers = 1;
    settings.interrupt_after = Some(Duration::from_millis(300));

    let started = Instant::now();
    let (report, _) = h.run("r1", &reader, &["devel/a", "devel/b"], settings).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(skip_reason(&report, "devel/a"), Some(SkipReason::Interrupted));
    assert_eq!(skip_reason(&report, "devel/b"), Some(SkipReason::Interrupted));
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn test_crashed_environment_request_fails_only_its_job() {
    let h = Harness::with_images(FakeImages {
        broken: true,
        ..FakeImages::default()
    });
    let reader = ManifestReader::new([
        Package::new(id("www/app")).with_dependency(id("devel/lib"), DependencyKind::Build),
        Package::new(id("devel/lib")),
        Package::new(id("devel/other")),
    ]);
    let mut settings = h.settings();
    settings.scheduler.workers = 1;

    let (report, _) = h.run("r1", &reader, &["www/app", "devel/other"], settings).await;

    for package in ["devel/lib", "devel/other"] {
        let job = report.jobs.iter().find(|j| j.package == package).unwrap();
        assert_eq!(job.outcome, Outcome::Failed, "{report}");
        assert!(job.error.as_deref().unwrap().contains("panicked"));
    }
    assert_eq!(
        skip_reason(&report, "www/app"),
        Some(SkipReason::Dependency {
            package: "devel/lib".to_string()
        })
    );
    assert!(h.journal().is_empty());
}

#[tokio::test]
async fn test_base_is_reused_by_later_runs() {
    let h = Harness::new();
    let reader = ManifestReader::new([Package::new(id("devel/lib"))]);

    let (first, _) = h.run("r1", &reader, &["devel/lib"], h.settings()).await;
    let (second, _) = h.run("r2", &reader, &["devel/lib"], h.settings()).await;

    assert_eq!(first.exit_code(), 0);
    assert_eq!(second.exit_code(), 0);
    assert_eq!(h.images.populated.load(Ordering::SeqCst), 1);
    assert!(!h.store.exists("tank/reprise/instances/r1").await.unwrap());
    assert!(!h.store.exists("tank/reprise/instances/r2").await.unwrap());
}

#[tokio::test]
async fn test_repeated_request_reuses_the_first_outcome() {
    let h = Harness::new();
    let reader = ManifestReader::new([Package::new(id("devel/lib"))]);

    let (report, _) = h.run("r1", &reader, &["devel/lib", "devel/lib"], h.settings()).await;

    assert_eq!(report.jobs.len(), 2);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(h.journal().iter().filter(|l| *l == "build devel/lib").count(), 1);
    assert_eq!(report.jobs[0].log, report.jobs[1].log);
}
