//! conveyor - a matrix-aware CI pipeline orchestration engine
//!
//! A pipeline is a set of named jobs with `needs` dependencies; jobs fan out
//! into instances through matrix expansion and run concurrently under a
//! parallelism cap. Steps are inline scripts or named actions, gated by
//! `if:` expressions evaluated against the run context.

pub mod cli;
pub mod core;
pub mod error;
pub mod execution;

pub use crate::core::{PipelineConfig, RunContext, Secrets};
pub use crate::error::{ConfigError, ExpressionError, FailureKind};
pub use crate::execution::{PipelineEngine, RunEvent, RunStatus, RunSummary};
