//! Error taxonomy
//!
//! `ConfigError` is fatal before any job runs. `ExpressionError` is fatal to
//! the owning job only. `FailureKind` classifies step-level failures; it
//! propagates to job status but never crosses a job boundary except as a
//! Skipped status through the dependency graph.

use thiserror::Error;

/// Malformed pipeline definition. Aborts the run before any job starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' needs unknown job '{needed}'")]
    UnknownNeed { job: String, needed: String },

    #[error("dependency cycle involving job '{0}'")]
    Cycle(String),

    #[error("invalid matrix for job '{job}': {reason}")]
    InvalidMatrix { job: String, reason: String },

    #[error("invalid step in job '{job}': {reason}")]
    InvalidStep { job: String, reason: String },

    #[error("invalid pipeline definition: {0}")]
    Invalid(String),

    #[error("failed to parse pipeline definition")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read pipeline definition")]
    Io(#[from] std::io::Error),
}

/// Bad conditional or interpolation syntax, or a reference to something the
/// run context does not know about.
///
/// Never treated as "false": a config bug must not silently skip a gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("syntax error in expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("function '{function}' expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },
}

/// Why a step (and, by propagation, its job) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The spawned process exited non-zero.
    NonZeroExit(i32),
    /// The runner could not spawn the step or resolve its action.
    Environment(String),
    /// The job's wall-clock deadline elapsed.
    Timeout,
    /// The run was cancelled while the step was in flight.
    Cancelled,
    /// A run-condition or interpolation failed to evaluate.
    Expression(ExpressionError),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NonZeroExit(code) => write!(f, "exited with code {}", code),
            FailureKind::Environment(reason) => write!(f, "environment error: {}", reason),
            FailureKind::Timeout => write!(f, "timed out"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Expression(e) => write!(f, "expression error: {}", e),
        }
    }
}

impl FailureKind {
    /// Expression failures and cancellation override continue-on-error:
    /// a broken condition must fail the job rather than let it limp on.
    pub fn overrides_continue_on_error(&self) -> bool {
        matches!(self, FailureKind::Expression(_) | FailureKind::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::NonZeroExit(2).to_string(), "exited with code 2");
        assert_eq!(FailureKind::Timeout.to_string(), "timed out");
    }

    #[test]
    fn test_expression_failure_overrides_continue_on_error() {
        let kind = FailureKind::Expression(ExpressionError::UnknownIdentifier(
            "github.evt".to_string(),
        ));
        assert!(kind.overrides_continue_on_error());
        assert!(!FailureKind::NonZeroExit(1).overrides_continue_on_error());
    }
}
