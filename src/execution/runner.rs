//! Job runner - executes one job instance's steps in order
//!
//! Steps run strictly sequentially: each may depend on filesystem and
//! environment state left by the previous one. The first failure (unless
//! marked continue-on-error) skips everything after it; the failing step
//! still keeps its real exit code. The job's wall-clock deadline and run
//! cancellation both surface as step failures with their own kinds.

use crate::core::cache::CacheStore;
use crate::core::context::RunContext;
use crate::core::expr;
use crate::core::job::{JobInstance, JobStatus};
use crate::error::FailureKind;
use crate::execution::engine::{Cancellation, EventSink, RunEvent};
use crate::execution::executor::{ActionResolver, StepExecutor, StepOutput};
use crate::execution::report::{JobReport, StepOutcome, StepResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobRunner<R> {
    executor: Arc<StepExecutor<R>>,
    cache: Option<Arc<dyn CacheStore>>,
    events: EventSink,
    cancellation: Arc<Cancellation>,
}

impl<R: ActionResolver> JobRunner<R> {
    pub fn new(
        executor: Arc<StepExecutor<R>>,
        cache: Option<Arc<dyn CacheStore>>,
        events: EventSink,
        cancellation: Arc<Cancellation>,
    ) -> Self {
        Self {
            executor,
            cache,
            events,
            cancellation,
        }
    }

    /// Run every step of the instance and produce its report.
    pub async fn run(&self, instance: &JobInstance, base_ctx: &RunContext) -> JobReport {
        let started_at = Utc::now();
        let ctx = base_ctx.for_job(&instance.matrix, &instance.env);

        if let Some(condition) = &instance.condition {
            match expr::evaluate_bool(condition, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    info!(job = %instance.id, "job condition false, skipping");
                    return JobReport {
                        job: instance.id.clone(),
                        status: JobStatus::Skipped,
                        steps: Vec::new(),
                        failure: None,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
                Err(e) => {
                    warn!(job = %instance.id, error = %e, "job condition failed to evaluate");
                    return JobReport {
                        job: instance.id.clone(),
                        status: JobStatus::Failed,
                        steps: Vec::new(),
                        failure: Some(FailureKind::Expression(e)),
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
            }
        }

        // The runner label may reference matrix variables.
        let runs_on = match expr::interpolate(&instance.runs_on, &ctx) {
            Ok(label) => label,
            Err(e) => {
                warn!(job = %instance.id, error = %e, "runner label failed to interpolate");
                return JobReport {
                    job: instance.id.clone(),
                    status: JobStatus::Failed,
                    steps: Vec::new(),
                    failure: Some(FailureKind::Expression(e)),
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        };
        info!(job = %instance.id, runner = %runs_on, "starting job");

        let deadline = tokio::time::Instant::now() + instance.timeout;
        let mut steps: Vec<StepResult> = Vec::with_capacity(instance.steps.len());
        let mut cache_saves = Vec::new();
        let mut failure: Option<FailureKind> = None;

        for step in &instance.steps {
            if failure.is_some() {
                let record = StepResult::skipped(&step.name);
                self.events.emit(RunEvent::StepFinished {
                    job: instance.id.clone(),
                    step: step.name.clone(),
                    outcome: record.outcome.clone(),
                });
                steps.push(record);
                continue;
            }

            if self.cancellation.is_cancelled() {
                let record =
                    StepResult::failed_without_spawn(&step.name, FailureKind::Cancelled);
                failure = Some(FailureKind::Cancelled);
                steps.push(record);
                continue;
            }

            self.events.emit(RunEvent::StepStarted {
                job: instance.id.clone(),
                step: step.name.clone(),
            });

            let output = tokio::select! {
                _ = self.cancellation.cancelled() => StepOutput {
                    record: StepResult::failed_without_spawn(
                        &step.name,
                        FailureKind::Cancelled,
                    ),
                    cache_save: None,
                },
                result = tokio::time::timeout_at(
                    deadline,
                    self.executor.execute(&instance.id, step, &ctx, &self.events),
                ) => match result {
                    Ok(output) => output,
                    Err(_) => {
                        warn!(job = %instance.id, step = %step.name, "job deadline elapsed");
                        StepOutput {
                            record: StepResult::failed_without_spawn(
                                &step.name,
                                FailureKind::Timeout,
                            ),
                            cache_save: None,
                        }
                    }
                },
            };

            self.events.emit(RunEvent::StepFinished {
                job: instance.id.clone(),
                step: step.name.clone(),
                outcome: output.record.outcome.clone(),
            });

            if let Some(entry) = output.cache_save {
                cache_saves.push(entry);
            }
            if let StepOutcome::Failed(kind) = &output.record.outcome {
                if !step.continue_on_error || kind.overrides_continue_on_error() {
                    failure = Some(kind.clone());
                }
            }
            steps.push(output.record);
        }

        let status = if failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };

        // Deferred saves only land for successful jobs; a primary-key hit
        // never re-saves.
        if status == JobStatus::Succeeded {
            if let Some(store) = &self.cache {
                for entry in &cache_saves {
                    store.save(&entry.key, &entry.path).await;
                }
            }
        }

        JobReport {
            job: instance.id.clone(),
            status,
            steps,
            failure,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
