//! Pipeline engine - drives a whole run to completion
//!
//! The engine owns all run state on a single task. Job instances execute as
//! spawned tasks in a `JoinSet`, bounded by the pipeline's parallelism cap;
//! each task hands back an immutable `JobReport`, and only the engine loop
//! mutates instance statuses. Observers subscribe through event handlers.

use crate::core::cache::CacheStore;
use crate::core::context::RunContext;
use crate::core::job::{JobStatus, PipelineDefinition};
use crate::execution::executor::{ActionResolver, StepExecutor};
use crate::execution::report::{AnnotationLevel, JobReport, RunStatus, RunSummary, StepOutcome};
use crate::execution::runner::JobRunner;
use crate::execution::scheduler::{JobScheduler, PipelineRun};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        pipeline: String,
    },
    JobStarted {
        job: String,
    },
    JobCompleted {
        job: String,
        status: JobStatus,
    },
    JobSkipped {
        job: String,
        reason: String,
    },
    StepStarted {
        job: String,
        step: String,
    },
    StepFinished {
        job: String,
        step: String,
        outcome: StepOutcome,
    },
    Annotation {
        job: String,
        level: AnnotationLevel,
        message: String,
    },
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
    },
}

pub type EventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Cheap-to-clone fanout of run events to every registered handler.
#[derive(Clone, Default)]
pub struct EventSink {
    handlers: Arc<Vec<EventHandler>>,
}

impl EventSink {
    pub fn new(handlers: Vec<EventHandler>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    pub fn emit(&self, event: RunEvent) {
        for handler in self.handlers.iter() {
            handler(event.clone());
        }
    }
}

/// A sink with no handlers.
pub fn null_sink() -> EventSink {
    EventSink::default()
}

/// Cooperative cancellation shared between the engine, job runners and the
/// signal handler. Cancelling is one-way and idempotent.
#[derive(Default)]
pub struct Cancellation {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel()
            // cannot slip between the check and the await.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub struct PipelineEngine<R> {
    executor: Arc<StepExecutor<R>>,
    cache: Option<Arc<dyn CacheStore>>,
    handlers: Vec<EventHandler>,
    cancellation: Arc<Cancellation>,
}

impl<R: ActionResolver + 'static> PipelineEngine<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(resolver)),
            cache: None,
            handlers: Vec::new(),
            cancellation: Arc::new(Cancellation::new()),
        }
    }

    /// Engine whose builtin cache steps restore from (and, on job success,
    /// save to) the given store.
    pub fn with_cache(resolver: R, store: Arc<dyn CacheStore>) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(resolver).with_cache(store.clone())),
            cache: Some(store),
            handlers: Vec::new(),
            cancellation: Arc::new(Cancellation::new()),
        }
    }

    /// Handle for requesting cancellation from outside the run loop.
    pub fn cancellation(&self) -> Arc<Cancellation> {
        self.cancellation.clone()
    }

    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Execute the pipeline to completion and return the run summary.
    ///
    /// Always drives every instance to a terminal status, including after
    /// cancellation (running jobs finish as cancelled, waiting jobs are
    /// skipped). Err is reserved for engine faults such as a panicked job
    /// task, not for failing jobs.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        ctx: &RunContext,
    ) -> anyhow::Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let events = EventSink::new(self.handlers.clone());

        info!(pipeline = %definition.name, %run_id, "starting pipeline run");
        events.emit(RunEvent::RunStarted {
            run_id,
            pipeline: definition.name.clone(),
        });

        let mut run = PipelineRun::new(definition, run_id);
        let scheduler = JobScheduler::new(definition.max_parallel);
        // Tasks carry the instance index back: display ids are not unique
        // when a matrix include duplicates a combination.
        let mut tasks: JoinSet<(usize, JobReport)> = JoinSet::new();

        loop {
            if self.cancellation.is_cancelled() {
                self.skip_waiting(&mut run, &events);
            } else {
                for idx in scheduler.propagate_skips(&mut run) {
                    let id = run.instances[idx].id.clone();
                    events.emit(RunEvent::JobSkipped {
                        job: id.clone(),
                        reason: "dependency failed or was skipped".to_string(),
                    });
                    run.reports.push(JobReport::skipped(id));
                }
                scheduler.mark_ready(&mut run);

                for idx in scheduler.next_batch(&run, tasks.len()) {
                    let instance = &mut run.instances[idx];
                    if !instance.transition(JobStatus::Running) {
                        continue;
                    }
                    events.emit(RunEvent::JobStarted {
                        job: instance.id.clone(),
                    });

                    let runner = JobRunner::new(
                        self.executor.clone(),
                        self.cache.clone(),
                        events.clone(),
                        self.cancellation.clone(),
                    );
                    let instance = instance.clone();
                    let ctx = ctx.clone();
                    tasks.spawn(async move { (idx, runner.run(&instance, &ctx).await) });
                }
            }

            if tasks.is_empty() {
                if run.all_terminal() {
                    break;
                }
                if self.cancellation.is_cancelled() {
                    continue;
                }
                // Cannot happen for a validated (acyclic) definition.
                anyhow::bail!(
                    "run stalled: nothing running and {} jobs not terminal",
                    run.instances.iter().filter(|i| !i.status.is_terminal()).count()
                );
            }

            match tasks.join_next().await {
                Some(Ok((idx, report))) => {
                    run.instances[idx].transition(report.status);
                    events.emit(RunEvent::JobCompleted {
                        job: report.job.clone(),
                        status: report.status,
                    });
                    run.reports.push(report);
                }
                Some(Err(e)) => anyhow::bail!("job task panicked: {}", e),
                None => {}
            }
        }

        let status = if self.cancellation.is_cancelled() {
            RunStatus::Failed
        } else {
            run.overall_status()
        };

        info!(pipeline = %definition.name, %run_id, status = ?status, "pipeline run finished");
        events.emit(RunEvent::RunCompleted { run_id, status });

        Ok(RunSummary {
            run_id,
            pipeline: run.name,
            status,
            started_at,
            finished_at: Utc::now(),
            reports: run.reports,
        })
    }

    fn skip_waiting(&self, run: &mut PipelineRun, events: &EventSink) {
        let waiting: Vec<usize> = run
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i.status, JobStatus::Pending | JobStatus::Ready))
            .map(|(idx, _)| idx)
            .collect();

        for idx in waiting {
            if run.instances[idx].transition(JobStatus::Skipped) {
                let id = run.instances[idx].id.clone();
                warn!(job = %id, "skipping job, run cancelled");
                events.emit(RunEvent::JobSkipped {
                    job: id.clone(),
                    reason: "run cancelled".to_string(),
                });
                run.reports.push(JobReport::skipped(id));
            }
        }
    }
}
