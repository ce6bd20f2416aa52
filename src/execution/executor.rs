//! Step executor - runs one step and records what happened
//!
//! A step whose run-condition is false is recorded as Skipped without
//! spawning anything. Otherwise the resolved command runs with merged
//! environment (step over job over pipeline), and the record carries the
//! real exit code, combined output (secret-redacted, truncated) and elapsed
//! time. Output matchers turn `::error::`-style lines into advisory
//! annotation events; they never influence control flow.

use crate::core::cache::{self, CacheEntry, CacheStore};
use crate::core::context::RunContext;
use crate::core::expr;
use crate::core::step::{merge_env, ActionRef, StepAction, StepTemplate};
use crate::error::FailureKind;
use crate::execution::engine::{EventSink, RunEvent};
use crate::execution::report::{Annotation, AnnotationLevel, StepOutcome, StepResult};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Captured logs are truncated to keep records bounded.
const MAX_LOG_BYTES: usize = 16 * 1024;

/// A concrete process invocation an action resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Resolves named external actions to concrete commands. The contract is
/// opaque: name, version and input parameters in, an invocable command out.
#[async_trait]
pub trait ActionResolver: Send + Sync {
    async fn resolve(
        &self,
        action: &ActionRef,
        params: &[(String, String)],
    ) -> anyhow::Result<ResolvedCommand>;
}

/// Resolver that knows no actions. Builtin actions (`checkout`, `cache`) are
/// handled before the resolver is consulted, so this is the default for
/// pipelines that only use scripts and builtins.
pub struct NullActionResolver;

#[async_trait]
impl ActionResolver for NullActionResolver {
    async fn resolve(
        &self,
        action: &ActionRef,
        _params: &[(String, String)],
    ) -> anyhow::Result<ResolvedCommand> {
        anyhow::bail!("no resolver for action '{}'", action)
    }
}

/// What one step execution produced: the record, plus a cache entry to save
/// after the job succeeds (only set when the primary key missed).
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub record: StepResult,
    pub cache_save: Option<CacheEntry>,
}

impl StepOutput {
    fn record_only(record: StepResult) -> Self {
        StepOutput {
            record,
            cache_save: None,
        }
    }
}

/// Executes a single step.
pub struct StepExecutor<R> {
    resolver: R,
    cache: Option<Arc<dyn CacheStore>>,
    matcher: Regex,
}

impl<R: ActionResolver> StepExecutor<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            cache: None,
            matcher: Regex::new(r"^::(error|warning|notice)(?: [^:]*)?::(.*)$")
                .expect("static regex"),
        }
    }

    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Execute one step under the job's context and record the outcome.
    pub async fn execute(
        &self,
        job: &str,
        step: &StepTemplate,
        ctx: &RunContext,
        events: &EventSink,
    ) -> StepOutput {
        if let Some(condition) = &step.condition {
            match expr::evaluate_bool(condition, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job, step = %step.name, "condition false, skipping step");
                    return StepOutput::record_only(StepResult::skipped(&step.name));
                }
                Err(e) => {
                    warn!(job, step = %step.name, error = %e, "step condition failed to evaluate");
                    return StepOutput::record_only(StepResult::failed_without_spawn(
                        &step.name,
                        FailureKind::Expression(e),
                    ));
                }
            }
        }

        match &step.action {
            StepAction::Run { script, shell } => {
                let script = match expr::interpolate(script, ctx) {
                    Ok(script) => script,
                    Err(e) => {
                        return StepOutput::record_only(StepResult::failed_without_spawn(
                            &step.name,
                            FailureKind::Expression(e),
                        ))
                    }
                };
                let shell = shell.clone().unwrap_or_else(|| "sh".to_string());
                let command = ResolvedCommand {
                    program: shell,
                    args: vec!["-c".to_string(), script],
                    env: HashMap::new(),
                };
                self.spawn(job, step, command, ctx, events).await
            }
            StepAction::Uses { action, with } => {
                self.execute_action(job, step, action, with, ctx, events).await
            }
        }
    }

    async fn execute_action(
        &self,
        job: &str,
        step: &StepTemplate,
        action: &ActionRef,
        with: &[(String, String)],
        ctx: &RunContext,
        events: &EventSink,
    ) -> StepOutput {
        match action.name.as_str() {
            // Builtin: the workspace is assumed present; record what would
            // have been fetched.
            "checkout" => {
                let log = format!("checked out {} at {}", ctx.repository, ctx.git_ref);
                info!(job, step = %step.name, "{}", log);
                StepOutput::record_only(StepResult {
                    name: step.name.clone(),
                    outcome: StepOutcome::Succeeded,
                    exit_code: None,
                    duration: std::time::Duration::ZERO,
                    log,
                    annotations: Vec::new(),
                })
            }
            // Builtin: restore now, defer the save until the job succeeds.
            "cache" => self.execute_cache(job, step, ctx).await,
            _ => {
                let mut params = Vec::with_capacity(with.len());
                for (key, value) in with {
                    match expr::interpolate(value, ctx) {
                        Ok(value) => params.push((key.clone(), value)),
                        Err(e) => {
                            return StepOutput::record_only(StepResult::failed_without_spawn(
                                &step.name,
                                FailureKind::Expression(e),
                            ))
                        }
                    }
                }
                match self.resolver.resolve(action, &params).await {
                    Ok(command) => self.spawn(job, step, command, ctx, events).await,
                    Err(e) => StepOutput::record_only(StepResult::failed_without_spawn(
                        &step.name,
                        FailureKind::Environment(e.to_string()),
                    )),
                }
            }
        }
    }

    async fn execute_cache(&self, job: &str, step: &StepTemplate, ctx: &RunContext) -> StepOutput {
        let (Some(key_template), Some(path)) = (step.param("key"), step.param("path")) else {
            return StepOutput::record_only(StepResult::failed_without_spawn(
                &step.name,
                FailureKind::Environment(
                    "cache step requires 'key' and 'path' parameters".to_string(),
                ),
            ));
        };

        let path = match expr::interpolate(path, ctx) {
            Ok(path) => path,
            Err(e) => {
                return StepOutput::record_only(StepResult::failed_without_spawn(
                    &step.name,
                    FailureKind::Expression(e),
                ))
            }
        };

        let entry = match cache::resolve(key_template, &path, ctx) {
            Ok(entry) => entry,
            Err(e) => {
                return StepOutput::record_only(StepResult::failed_without_spawn(
                    &step.name,
                    FailureKind::Expression(e),
                ))
            }
        };

        // A miss is never fatal, only a cold run.
        let (log, cache_save) = match &self.cache {
            Some(store) => match store.restore(&entry.lookup_keys(), &entry.path).await {
                Some(matched) if matched == entry.key => {
                    (format!("cache hit: {}", matched), None)
                }
                Some(matched) => (
                    format!("cache restored from fallback: {}", matched),
                    Some(entry),
                ),
                None => ("cache miss, proceeding cold".to_string(), Some(entry)),
            },
            None => ("no cache store configured, proceeding cold".to_string(), None),
        };
        info!(job, step = %step.name, "{}", log);

        StepOutput {
            record: StepResult {
                name: step.name.clone(),
                outcome: StepOutcome::Succeeded,
                exit_code: None,
                duration: std::time::Duration::ZERO,
                log,
                annotations: Vec::new(),
            },
            cache_save,
        }
    }

    async fn spawn(
        &self,
        job: &str,
        step: &StepTemplate,
        command: ResolvedCommand,
        ctx: &RunContext,
        events: &EventSink,
    ) -> StepOutput {
        let mut step_env = HashMap::with_capacity(step.env.len());
        for (key, value) in &step.env {
            match expr::interpolate(value, ctx) {
                Ok(value) => {
                    step_env.insert(key.clone(), value);
                }
                Err(e) => {
                    return StepOutput::record_only(StepResult::failed_without_spawn(
                        &step.name,
                        FailureKind::Expression(e),
                    ))
                }
            }
        }
        let mut env = merge_env(&ctx.env, &step_env);
        for (key, value) in &command.env {
            env.insert(key.clone(), value.clone());
        }

        info!(job, step = %step.name, program = %command.program, "executing step");
        let started = Instant::now();

        let output = match tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(&env)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(job, step = %step.name, error = %e, "failed to spawn step");
                let mut record = StepResult::failed_without_spawn(
                    &step.name,
                    FailureKind::Environment(format!(
                        "failed to spawn '{}': {}",
                        command.program, e
                    )),
                );
                record.duration = started.elapsed();
                return StepOutput::record_only(record);
            }
        };

        let duration = started.elapsed();
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let log = truncate_log(ctx.secrets.redact(&combined));

        let annotations = if ctx.annotations_enabled() {
            self.collect_annotations(job, &log, events)
        } else {
            Vec::new()
        };

        let exit_code = output.status.code();
        let outcome = if output.status.success() {
            StepOutcome::Succeeded
        } else {
            let code = exit_code.unwrap_or(-1);
            debug!(job, step = %step.name, code, "step exited non-zero");
            StepOutcome::Failed(FailureKind::NonZeroExit(code))
        };

        StepOutput::record_only(StepResult {
            name: step.name.clone(),
            outcome,
            exit_code,
            duration,
            log,
            annotations,
        })
    }

    fn collect_annotations(&self, job: &str, log: &str, events: &EventSink) -> Vec<Annotation> {
        let mut annotations = Vec::new();
        for line in log.lines() {
            if let Some(capture) = self.matcher.captures(line.trim_end()) {
                let level = match &capture[1] {
                    "error" => AnnotationLevel::Error,
                    "warning" => AnnotationLevel::Warning,
                    _ => AnnotationLevel::Notice,
                };
                let annotation = Annotation {
                    level,
                    message: capture[2].to_string(),
                };
                events.emit(RunEvent::Annotation {
                    job: job.to_string(),
                    level,
                    message: annotation.message.clone(),
                });
                annotations.push(annotation);
            }
        }
        annotations
    }
}

fn truncate_log(mut log: String) -> String {
    if log.len() > MAX_LOG_BYTES {
        let mut cut = MAX_LOG_BYTES;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        log.truncate(cut);
        log.push_str("\n[log truncated]");
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepAction;
    use crate::execution::engine::null_sink;
    use std::collections::HashMap;

    fn run_step(script: &str) -> StepTemplate {
        StepTemplate {
            name: "test step".to_string(),
            action: StepAction::Run {
                script: script.to_string(),
                shell: None,
            },
            condition: None,
            env: HashMap::new(),
            continue_on_error: false,
        }
    }

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new("push", "refs/heads/master");
        ctx.repository = "acme/widget".to_string();
        ctx.head_repository = "acme/widget".to_string();
        ctx
    }

    #[tokio::test]
    async fn test_successful_step_records_exit_zero() {
        let executor = StepExecutor::new(NullActionResolver);
        let output = executor
            .execute("job", &run_step("echo hello"), &ctx(), &null_sink())
            .await;

        assert_eq!(output.record.outcome, StepOutcome::Succeeded);
        assert_eq!(output.record.exit_code, Some(0));
        assert!(output.record.log.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_step_keeps_real_exit_code() {
        let executor = StepExecutor::new(NullActionResolver);
        let output = executor
            .execute("job", &run_step("exit 3"), &ctx(), &null_sink())
            .await;

        assert_eq!(
            output.record.outcome,
            StepOutcome::Failed(FailureKind::NonZeroExit(3))
        );
        assert_eq!(output.record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_false_condition_skips_without_spawning() {
        let executor = StepExecutor::new(NullActionResolver);
        let mut step = run_step("echo should-not-run");
        step.condition = Some("github.event_name == 'pull_request'".to_string());

        let output = executor.execute("job", &step, &ctx(), &null_sink()).await;
        assert_eq!(output.record.outcome, StepOutcome::Skipped);
        assert_eq!(output.record.exit_code, None);
    }

    #[tokio::test]
    async fn test_bad_condition_is_a_failure_not_a_skip() {
        let executor = StepExecutor::new(NullActionResolver);
        let mut step = run_step("echo unreachable");
        step.condition = Some("github.evnt == 'push'".to_string());

        let output = executor.execute("job", &step, &ctx(), &null_sink()).await;
        assert!(matches!(
            output.record.outcome,
            StepOutcome::Failed(FailureKind::Expression(_))
        ));
    }

    #[tokio::test]
    async fn test_step_env_overrides_job_env() {
        let executor = StepExecutor::new(NullActionResolver);
        let mut step = run_step("echo \"$GREETING\"");
        step.env
            .insert("GREETING".to_string(), "from-step".to_string());

        let mut ctx = ctx();
        ctx.env
            .insert("GREETING".to_string(), "from-job".to_string());

        let output = executor.execute("job", &step, &ctx, &null_sink()).await;
        assert!(output.record.log.contains("from-step"));
    }

    #[tokio::test]
    async fn test_secrets_redacted_from_log() {
        let executor = StepExecutor::new(NullActionResolver);
        let mut values = HashMap::new();
        values.insert("TOKEN".to_string(), "hunter2".to_string());
        let mut ctx = ctx();
        ctx.secrets = crate::core::context::Secrets::new(values);

        let output = executor
            .execute(
                "job",
                &run_step("echo token is ${{ secrets.TOKEN }}"),
                &ctx,
                &null_sink(),
            )
            .await;

        assert_eq!(output.record.outcome, StepOutcome::Succeeded);
        assert!(!output.record.log.contains("hunter2"));
        assert!(output.record.log.contains("***"));
    }

    #[tokio::test]
    async fn test_annotations_parsed_from_output() {
        let executor = StepExecutor::new(NullActionResolver);
        let output = executor
            .execute(
                "job",
                &run_step("echo '::error::lint failed'; echo plain line"),
                &ctx(),
                &null_sink(),
            )
            .await;

        assert_eq!(output.record.annotations.len(), 1);
        assert_eq!(output.record.annotations[0].level, AnnotationLevel::Error);
        assert_eq!(output.record.annotations[0].message, "lint failed");
    }

    #[tokio::test]
    async fn test_annotations_suppressed_for_fork_pr() {
        let executor = StepExecutor::new(NullActionResolver);
        let mut ctx = ctx();
        ctx.event_name = "pull_request".to_string();
        ctx.head_repository = "fork/widget".to_string();

        let output = executor
            .execute("job", &run_step("echo '::error::boom'"), &ctx, &null_sink())
            .await;
        assert!(output.record.annotations.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_environment_failure() {
        let executor = StepExecutor::new(NullActionResolver);
        let step = StepTemplate {
            name: "publish".to_string(),
            action: StepAction::Uses {
                action: ActionRef::parse("twine-upload@v1"),
                with: vec![],
            },
            condition: None,
            env: HashMap::new(),
            continue_on_error: false,
        };

        let output = executor.execute("job", &step, &ctx(), &null_sink()).await;
        assert!(matches!(
            output.record.outcome,
            StepOutcome::Failed(FailureKind::Environment(_))
        ));
    }

    #[tokio::test]
    async fn test_checkout_builtin_is_a_noop() {
        let executor = StepExecutor::new(NullActionResolver);
        let step = StepTemplate {
            name: "checkout".to_string(),
            action: StepAction::Uses {
                action: ActionRef::parse("checkout@v2"),
                with: vec![],
            },
            condition: None,
            env: HashMap::new(),
            continue_on_error: false,
        };

        let output = executor.execute("job", &step, &ctx(), &null_sink()).await;
        assert_eq!(output.record.outcome, StepOutcome::Succeeded);
        assert!(output.record.log.contains("acme/widget"));
    }

    #[tokio::test]
    async fn test_cache_builtin_miss_defers_save() {
        use crate::core::cache::InMemoryCacheStore;

        let store = Arc::new(InMemoryCacheStore::new());
        let executor = StepExecutor::new(NullActionResolver).with_cache(store);
        let step = StepTemplate {
            name: "restore pip cache".to_string(),
            action: StepAction::Uses {
                action: ActionRef::parse("cache@v1"),
                with: vec![
                    ("path".to_string(), "~/.cache/pip".to_string()),
                    ("key".to_string(), "pip-${{ runner.os }}-v1".to_string()),
                ],
            },
            condition: None,
            env: HashMap::new(),
            continue_on_error: false,
        };

        let output = executor.execute("job", &step, &ctx(), &null_sink()).await;
        assert_eq!(output.record.outcome, StepOutcome::Succeeded);
        let entry = output.cache_save.expect("miss should defer a save");
        assert!(entry.key.starts_with("pip-"));
    }

    #[test]
    fn test_truncate_log() {
        let long = "x".repeat(MAX_LOG_BYTES + 100);
        let truncated = truncate_log(long);
        assert!(truncated.ends_with("[log truncated]"));
        assert!(truncated.len() <= MAX_LOG_BYTES + 20);
    }
}
