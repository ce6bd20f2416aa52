//! CLI output formatting

use crate::core::job::JobStatus;
use crate::execution::{RunEvent, RunStatus, RunSummary, StepOutcome};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a job status for display
pub fn format_job_status(status: JobStatus) -> String {
    match status {
        JobStatus::Pending => style("PENDING").dim().to_string(),
        JobStatus::Ready => style("READY").cyan().to_string(),
        JobStatus::Running => style("RUNNING").yellow().to_string(),
        JobStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        JobStatus::Failed => style("FAILED").red().to_string(),
        JobStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format a run event for display
pub fn format_run_event(event: &RunEvent) -> String {
    match event {
        RunEvent::RunStarted { run_id, pipeline } => format!(
            "{} Starting pipeline {} ({})",
            ROCKET,
            style(pipeline).bold(),
            style(&run_id.to_string()[..8]).dim()
        ),
        RunEvent::JobStarted { job } => {
            format!("{} {}", SPINNER, style(job).cyan())
        }
        RunEvent::JobCompleted { job, status } => {
            let icon = match status {
                JobStatus::Succeeded => CHECK,
                JobStatus::Failed => CROSS,
                _ => INFO,
            };
            format!("{} {} {}", icon, style(job).bold(), format_job_status(*status))
        }
        RunEvent::JobSkipped { job, reason } => {
            format!("{} {} skipped ({})", INFO, style(job).dim(), style(reason).dim())
        }
        RunEvent::StepStarted { job, step } => {
            format!("   {} {} / {}", SPINNER, style(job).dim(), style(step).cyan())
        }
        RunEvent::StepFinished { job, step, outcome } => {
            let (icon, rendered) = match outcome {
                StepOutcome::Succeeded => (CHECK, style("ok").green().to_string()),
                StepOutcome::Failed(kind) => (CROSS, style(kind).red().to_string()),
                StepOutcome::Skipped => (INFO, style("skipped").dim().to_string()),
            };
            format!("   {} {} / {} {}", icon, style(job).dim(), step, rendered)
        }
        RunEvent::Annotation {
            job,
            level,
            message,
        } => format!(
            "   {} [{}] {}: {}",
            WARN,
            style(level).yellow(),
            style(job).dim(),
            message
        ),
        RunEvent::RunCompleted { run_id, status } => {
            let rendered = match status {
                RunStatus::Succeeded => style("succeeded").green().to_string(),
                RunStatus::Failed => style("failed").red().to_string(),
            };
            format!(
                "{} Pipeline ({}) {}",
                INFO,
                style(&run_id.to_string()[..8]).dim(),
                rendered
            )
        }
    }
}

/// Final per-job table printed after the run
pub fn format_summary(summary: &RunSummary) -> String {
    let mut lines = Vec::with_capacity(summary.reports.len() + 2);

    let icon = match summary.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
    };
    lines.push(format!(
        "{} {} {}",
        icon,
        style(&summary.pipeline).bold(),
        match summary.status {
            RunStatus::Succeeded => style("succeeded").green().to_string(),
            RunStatus::Failed => style("failed").red().to_string(),
        }
    ));

    for report in &summary.reports {
        let duration = report
            .finished_at
            .signed_duration_since(report.started_at)
            .to_std()
            .unwrap_or_default();
        lines.push(format!(
            "  {} {} ({} steps, {})",
            format_job_status(report.status),
            style(&report.job).bold(),
            report.executed_steps(),
            style(format_duration(duration)).dim()
        ));
        if let Some(failure) = &report.failure {
            lines.push(format!("      {}", style(failure).red()));
        }
    }

    lines.join("\n")
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(std::time::Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(std::time::Duration::from_secs(90)), "1m 30s");
        assert_eq!(
            format_duration(std::time::Duration::from_secs(3700)),
            "1h 1m 40s"
        );
    }
}
