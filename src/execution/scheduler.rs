//! Run state and dependency-aware scheduling
//!
//! `PipelineRun` is the mutable state of one run: every expanded job
//! instance plus the reports collected so far. `JobScheduler` decides which
//! instances become ready, which get skipped because a dependency went
//! wrong, and which to launch next under the parallelism cap.
//!
//! Instances are addressed by their position in the expansion, not by
//! display id: duplicate matrix `include` combinations produce instances
//! with identical ids, and each must still run exactly once.
//!
//! Dependencies are declared between job *names*; an instance is gated on
//! every instance of each needed job. One failing matrix leg therefore
//! skips all dependents of that job.

use crate::core::job::{JobInstance, JobStatus, PipelineDefinition};
use crate::execution::report::{JobReport, RunStatus};
use uuid::Uuid;

#[derive(Debug)]
pub struct PipelineRun {
    pub name: String,
    pub run_id: Uuid,

    /// Expanded instances in declaration order (matrix legs adjacent).
    /// Positions are stable for the lifetime of the run and serve as the
    /// instance identity.
    pub instances: Vec<JobInstance>,

    /// Completed reports, appended as instances reach a terminal state.
    pub reports: Vec<JobReport>,
}

impl PipelineRun {
    pub fn new(definition: &PipelineDefinition, run_id: Uuid) -> Self {
        PipelineRun {
            name: definition.name.clone(),
            run_id,
            instances: definition.expand(),
            reports: Vec::new(),
        }
    }

    /// First instance with the given display id. Display lookup only; ids
    /// are not unique when includes duplicate a combination.
    pub fn instance(&self, id: &str) -> Option<&JobInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn instances_of<'a>(
        &'a self,
        template: &'a str,
    ) -> impl Iterator<Item = &'a JobInstance> + 'a {
        self.instances.iter().filter(move |i| i.template == template)
    }

    pub fn all_terminal(&self) -> bool {
        self.instances.iter().all(|i| i.status.is_terminal())
    }

    /// Failed iff any instance failed. Skipped and succeeded instances both
    /// count toward success.
    pub fn overall_status(&self) -> RunStatus {
        if self.instances.iter().any(|i| i.status == JobStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

pub struct JobScheduler {
    max_parallel: usize,
}

impl JobScheduler {
    pub fn new(max_parallel: usize) -> Self {
        // A cap of zero would deadlock the run loop.
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Skip every pending instance that depends on a failed or skipped job,
    /// to a fixpoint so skips cascade down chains. Returns the indexes
    /// skipped, in instance order.
    pub fn propagate_skips(&self, run: &mut PipelineRun) -> Vec<usize> {
        let mut skipped = Vec::new();

        loop {
            let doomed: Vec<usize> = run
                .instances
                .iter()
                .enumerate()
                .filter(|(_, i)| i.status == JobStatus::Pending)
                .filter(|(_, i)| {
                    i.needs.iter().any(|needed| {
                        run.instances_of(needed).any(|dep| {
                            matches!(dep.status, JobStatus::Failed | JobStatus::Skipped)
                        })
                    })
                })
                .map(|(idx, _)| idx)
                .collect();

            if doomed.is_empty() {
                break;
            }
            for idx in doomed {
                if run.instances[idx].transition(JobStatus::Skipped) {
                    skipped.push(idx);
                }
            }
        }

        skipped
    }

    /// Promote pending instances whose needed jobs have fully succeeded.
    pub fn mark_ready(&self, run: &mut PipelineRun) {
        let ready: Vec<usize> = run
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == JobStatus::Pending)
            .filter(|(_, i)| {
                i.needs.iter().all(|needed| {
                    let mut instances = run.instances_of(needed).peekable();
                    instances.peek().is_some()
                        && instances.all(|dep| dep.status == JobStatus::Succeeded)
                })
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in ready {
            run.instances[idx].transition(JobStatus::Ready);
        }
    }

    /// Indexes of the next instances to launch, bounded by the parallelism
    /// cap minus what is already running.
    pub fn next_batch(&self, run: &PipelineRun, running: usize) -> Vec<usize> {
        let remaining = self.max_parallel.saturating_sub(running);
        if remaining == 0 {
            return Vec::new();
        }

        run.instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == JobStatus::Ready)
            .take(remaining)
            .map(|(idx, _)| idx)
            .collect()
    }
}
