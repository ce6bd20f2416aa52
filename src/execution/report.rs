//! Append-only execution records
//!
//! Step and job records are written once when the work finishes and never
//! mutated afterwards; the run summary is the aggregate handed to the
//! reporting sink and the exit-code logic.

use crate::core::job::JobStatus;
use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Severity of an output-matcher annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationLevel {
    Notice,
    Warning,
    Error,
}

impl std::fmt::Display for AnnotationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnnotationLevel::Notice => "notice",
            AnnotationLevel::Warning => "warning",
            AnnotationLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Advisory metadata extracted from step output. Never control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub level: AnnotationLevel,
    pub message: String,
}

/// How a single step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded,
    Failed(FailureKind),
    Skipped,
}

/// Record of one step execution (or the decision not to execute it).
#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub outcome: StepOutcome,

    /// Real exit code of the spawned process; unset for skipped steps and
    /// for failures that never spawned one.
    pub exit_code: Option<i32>,

    pub duration: Duration,

    /// Captured combined output, secret-redacted and truncated.
    pub log: String,

    pub annotations: Vec<Annotation>,
}

impl StepResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        StepResult {
            name: name.into(),
            outcome: StepOutcome::Skipped,
            exit_code: None,
            duration: Duration::ZERO,
            log: String::new(),
            annotations: Vec::new(),
        }
    }

    pub fn failed_without_spawn(name: impl Into<String>, kind: FailureKind) -> Self {
        let log = kind.to_string();
        StepResult {
            name: name.into(),
            outcome: StepOutcome::Failed(kind),
            exit_code: None,
            duration: Duration::ZERO,
            log,
            annotations: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed(_))
    }
}

/// Record of one job instance run.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Instance id, e.g. `test (3.6, ubuntu-18.04)`.
    pub job: String,

    pub status: JobStatus,

    /// Per-step records in declared order. Empty for jobs that were skipped
    /// before any step ran.
    pub steps: Vec<StepResult>,

    /// Job-level failure reason when no single step carries it
    /// (bad condition expression, cancellation before a step).
    pub failure: Option<FailureKind>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    /// A job decided Skipped without running anything.
    pub fn skipped(job: impl Into<String>) -> Self {
        let now = Utc::now();
        JobReport {
            job: job.into(),
            status: JobStatus::Skipped,
            steps: Vec::new(),
            failure: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Steps that actually spawned work (not skipped).
    pub fn executed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome != StepOutcome::Skipped)
            .count()
    }
}

/// Terminal status of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Aggregate of one pipeline run, handed to the reporting sink at the end.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<JobReport>,
}

impl RunSummary {
    /// Process exit code contract: 0 iff the run succeeded.
    /// (Configuration errors exit with a distinct code before a summary
    /// exists; see main.)
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
        }
    }

    pub fn report(&self, job: &str) -> Option<&JobReport> {
        self.reports.iter().find(|r| r.job == job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_report_has_no_steps() {
        let report = JobReport::skipped("deploy");
        assert_eq!(report.status, JobStatus::Skipped);
        assert!(report.steps.is_empty());
        assert_eq!(report.executed_steps(), 0);
    }

    #[test]
    fn test_executed_steps_ignores_skipped() {
        let mut report = JobReport::skipped("test");
        report.status = JobStatus::Failed;
        report.steps = vec![
            StepResult {
                name: "a".to_string(),
                outcome: StepOutcome::Failed(FailureKind::NonZeroExit(1)),
                exit_code: Some(1),
                duration: Duration::from_millis(5),
                log: String::new(),
                annotations: Vec::new(),
            },
            StepResult::skipped("b"),
        ];
        assert_eq!(report.executed_steps(), 1);
    }

    #[test]
    fn test_exit_code_contract() {
        let mut summary = RunSummary {
            run_id: Uuid::new_v4(),
            pipeline: "ci".to_string(),
            status: RunStatus::Succeeded,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            reports: vec![],
        };
        assert_eq!(summary.exit_code(), 0);
        summary.status = RunStatus::Failed;
        assert_eq!(summary.exit_code(), 1);
    }
}
