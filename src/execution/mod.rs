//! Execution layer: step executor, job runner, scheduler and the engine
//! that ties them together.

pub mod engine;
pub mod executor;
pub mod report;
pub mod runner;
pub mod scheduler;

pub use engine::{Cancellation, EventHandler, EventSink, PipelineEngine, RunEvent};
pub use executor::{ActionResolver, NullActionResolver, ResolvedCommand, StepExecutor};
pub use report::{
    Annotation, AnnotationLevel, JobReport, RunStatus, RunSummary, StepOutcome, StepResult,
};
pub use runner::JobRunner;
pub use scheduler::{JobScheduler, PipelineRun};
