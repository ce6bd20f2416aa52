//! Job templates, concrete job instances, and the pipeline definition

use crate::core::matrix::MatrixSpec;
use crate::core::step::StepTemplate;
use std::collections::HashMap;
use std::time::Duration;

/// A named job as declared in the pipeline definition.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,

    /// Target runner label; may contain `${{ }}` placeholders
    /// (e.g. `${{ matrix.os }}`).
    pub runs_on: String,

    /// Run-condition for the whole job.
    pub condition: Option<String>,

    /// Names of jobs that must succeed before this one becomes ready.
    pub needs: Vec<String>,

    pub matrix: Option<MatrixSpec>,

    pub steps: Vec<StepTemplate>,

    pub env: HashMap<String, String>,

    /// Wall-clock budget for one instance of this job.
    pub timeout: Duration,
}

impl JobTemplate {
    /// Expand into concrete instances: one per matrix combination, or a
    /// single instance identical to the template when there is no matrix.
    pub fn instances(&self) -> Vec<JobInstance> {
        let combinations = match &self.matrix {
            Some(matrix) => matrix.expand(),
            None => vec![Vec::new()],
        };

        combinations
            .into_iter()
            .map(|bindings| JobInstance::new(self, bindings))
            .collect()
    }
}

/// Status of a job instance. Transitions are monotonic:
/// Pending -> Ready -> Running -> {Succeeded, Failed}, or any non-terminal
/// state -> Skipped. No instance re-enters Ready after leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Ready => 1,
            JobStatus::Running => 2,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped => 3,
        }
    }

    fn allows(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Skipped {
            return true;
        }
        next.rank() == self.rank() + 1
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A concrete job derived from a template and one matrix combination.
/// Ephemeral: created at expansion, mutated by the scheduler and engine,
/// discarded at run end.
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Display id: the template name, plus matrix values in parentheses
    /// when matrixed, e.g. `test (3.6, ubuntu-18.04)`. Not unique - an
    /// include repeating a cartesian combination shares it. The scheduler
    /// and engine address instances by position instead.
    pub id: String,

    /// Name of the template this instance came from.
    pub template: String,

    pub runs_on: String,
    pub condition: Option<String>,
    pub needs: Vec<String>,

    /// Resolved matrix variable bindings, in axis declaration order.
    pub matrix: Vec<(String, String)>,

    pub steps: Vec<StepTemplate>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,

    pub status: JobStatus,
}

impl JobInstance {
    fn new(template: &JobTemplate, bindings: Vec<(String, String)>) -> Self {
        let id = if bindings.is_empty() {
            template.name.clone()
        } else {
            let values: Vec<&str> = bindings.iter().map(|(_, v)| v.as_str()).collect();
            format!("{} ({})", template.name, values.join(", "))
        };

        JobInstance {
            id,
            template: template.name.clone(),
            runs_on: template.runs_on.clone(),
            condition: template.condition.clone(),
            needs: template.needs.clone(),
            matrix: bindings,
            steps: template.steps.clone(),
            env: template.env.clone(),
            timeout: template.timeout,
            status: JobStatus::Pending,
        }
    }

    /// Apply a status transition, refusing anything non-monotonic.
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.allows(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                job = %self.id,
                from = %self.status,
                to = %next,
                "refusing non-monotonic status transition"
            );
            false
        }
    }
}

/// The loaded pipeline: named job templates, immutable once validated.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,

    /// Pipeline-level environment, lowest precedence in the merge.
    pub env: HashMap<String, String>,

    /// Upper bound on concurrently running job instances.
    pub max_parallel: usize,

    pub jobs: HashMap<String, JobTemplate>,

    /// Job names in declaration order.
    pub order: Vec<String>,
}

impl PipelineDefinition {
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.get(name)
    }

    /// Expand every template into instances, in declaration order.
    pub fn expand(&self) -> Vec<JobInstance> {
        self.order
            .iter()
            .filter_map(|name| self.jobs.get(name))
            .flat_map(|template| template.instances())
            .collect()
    }
}
