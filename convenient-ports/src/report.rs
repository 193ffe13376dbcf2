//! Run report (JSON, Markdown, terminal summary)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl Outcome {
    fn marker(self) -> &'static str {
        match self {
            Outcome::Succeeded => "✓",
            Outcome::Failed => "✗",
            Outcome::Skipped => "-",
            Outcome::TimedOut => "⏱",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::TimedOut => "timed out",
        })
    }
}

/// Why a job did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The package carries BROKEN or IGNORE
    Flagged { flag: String, reason: String },
    /// A dependency failed or was skipped
    Dependency { package: String },
    FailFast,
    Interrupted,
    /// Same variant and environment as a failed job
    Duplicate { of: String },
    /// The run stopped on a host-wide failure
    Aborted { reason: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Flagged { flag, reason } => write!(f, "{flag}: {reason}"),
            SkipReason::Dependency { package } => write!(f, "dependency {package} did not build"),
            SkipReason::FailFast => f.write_str("fail-fast"),
            SkipReason::Interrupted => f.write_str("interrupted"),
            SkipReason::Duplicate { of } => write!(f, "duplicate of {of}"),
            SkipReason::Aborted { reason } => write!(f, "run aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: usize,
    pub package: String,
    /// Option selection, `default` for the default variant
    pub variant: String,
    pub environment: String,
    pub spec: String,
    /// `build` or `test` for deferred test jobs
    pub kind: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

impl JobRecord {
    fn detail(&self) -> String {
        match (&self.skip_reason, &self.error) {
            (Some(reason), _) => reason.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Counts per outcome, with skips split by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped_flagged: usize,
    pub skipped_dependency: usize,
    pub skipped_not_run: usize,
}

impl Summary {
    pub fn skipped(&self) -> usize {
        self.skipped_flagged + self.skipped_dependency + self.skipped_not_run
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.skipped()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub summary: Summary,
    pub jobs: Vec<JobRecord>,
}

impl RunReport {
    pub fn new(run: impl Into<String>, started: DateTime<Utc>, mut jobs: Vec<JobRecord>) -> Self {
        jobs.sort_by_key(|job| job.id);
        let mut summary = Summary::default();
        for job in &jobs {
            match (job.outcome, &job.skip_reason) {
                (Outcome::Succeeded, _) => summary.succeeded += 1,
                (Outcome::Failed, _) => summary.failed += 1,
                (Outcome::TimedOut, _) => summary.timed_out += 1,
                (Outcome::Skipped, Some(SkipReason::Flagged { .. })) => summary.skipped_flagged += 1,
                (Outcome::Skipped, Some(SkipReason::Dependency { .. } | SkipReason::Duplicate { .. })) => {
                    summary.skipped_dependency += 1
                }
                (Outcome::Skipped, _) => summary.skipped_not_run += 1,
            }
        }
        Self {
            run: run.into(),
            started,
            finished: Utc::now(),
            summary,
            jobs,
        }
    }

    /// 1 if any job failed or timed out, else 0.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.summary.failed + self.summary.timed_out > 0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_markdown(&self) -> String {
        let rows = self
            .jobs
            .iter()
            .map(|j| {
                format!(
                    "| {} | {} | {} | {} | {:.1}s | {} |",
                    j.package,
                    j.variant,
                    j.environment,
                    j.outcome,
                    j.duration_s,
                    j.detail()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "# Run {}\n\n\
             - **Succeeded**: {}\n\
             - **Failed**: {}\n\
             - **Timed out**: {}\n\
             - **Skipped**: {}\n\n\
             | Package | Variant | Environment | Outcome | Duration | Detail |\n\
             |---------|---------|-------------|---------|----------|--------|\n\
             {}\n",
            self.run,
            self.summary.succeeded,
            self.summary.failed,
            self.summary.timed_out,
            self.summary.skipped(),
            rows
        )
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .jobs
            .iter()
            .map(|j| j.package.len() + j.variant.len() + j.environment.len())
            .max()
            .unwrap_or(0)
            + 6;
        for job in &self.jobs {
            let name = if job.variant == "default" {
                format!("{} on {}", job.package, job.environment)
            } else {
                format!("{} [{}] on {}", job.package, job.variant, job.environment)
            };
            write!(
                f,
                "  {} {:<width$} {:>8.1}s  {}",
                job.outcome.marker(),
                name,
                job.duration_s,
                job.outcome
            )?;
            let detail = job.detail();
            if !detail.is_empty() {
                write!(f, " ({detail})")?;
            }
            writeln!(f)?;
        }

        let s = &self.summary;
        writeln!(
            f,
            "\n{} jobs: {} succeeded, {} failed, {} timed out, {} skipped ({} flagged, {} dependency, {} not run)",
            s.total(),
            s.succeeded,
            s.failed,
            s.timed_out,
            s.skipped(),
            s.skipped_flagged,
            s.skipped_dependency,
            s.skipped_not_run
        )
    }
}
