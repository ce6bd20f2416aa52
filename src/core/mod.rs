//! Core domain model: configuration, context, expressions, matrix expansion,
//! jobs and cache keys.

pub mod cache;
pub mod config;
pub mod context;
pub mod expr;
pub mod job;
pub mod matrix;
pub mod step;

pub use cache::{CacheEntry, CacheStore};
pub use config::PipelineConfig;
pub use context::{RunContext, Secrets};
pub use job::{JobInstance, JobStatus, JobTemplate, PipelineDefinition};
pub use matrix::MatrixSpec;
pub use step::{ActionRef, StepAction, StepTemplate};
