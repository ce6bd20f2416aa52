//! Run context - the explicit state every evaluation and execution sees
//!
//! The ambient CI environment (trigger event, ref, secrets, matrix bindings)
//! is modelled as a value passed by reference into every expression
//! evaluation and step execution, never as process globals.

use std::collections::HashMap;

/// Secret values delivered by an external store at run start.
///
/// Opaque on purpose: the Debug impl never prints values, and captured step
/// output is redacted against the values before it is recorded or emitted.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every secret value occurring in `text` with a mask.
    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for value in self.values.values() {
            if !value.is_empty() {
                redacted = redacted.replace(value, "***");
            }
        }
        redacted
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secrets({} entries)", self.values.len())
    }
}

/// Per-run state consulted by the evaluator, the cache key resolver and the
/// step executor. Created once per pipeline run; per-job views are derived
/// with [`RunContext::for_job`].
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Trigger event name, e.g. "push" or "pull_request".
    pub event_name: String,

    /// Full git ref that triggered the run, e.g. "refs/heads/main".
    pub git_ref: String,

    /// Head branch of a pull request, if any.
    pub head_branch: Option<String>,

    /// Base repository slug ("owner/name").
    pub repository: String,

    /// Head repository slug. Differs from `repository` for fork PRs.
    pub head_repository: String,

    /// Operating system label of the runner.
    pub runner_os: String,

    /// Environment variables visible to expressions and spawned steps.
    /// Pipeline-level at run start; job level merged in by `for_job`.
    pub env: HashMap<String, String>,

    /// Matrix variable bindings of the currently executing job instance.
    pub matrix: HashMap<String, String>,

    /// Secret mapping, never logged verbatim.
    pub secrets: Secrets,

    /// Content hashes of declared cache input files (path -> hex digest),
    /// computed once at run start for `hashFiles`.
    pub file_hashes: HashMap<String, String>,
}

impl RunContext {
    pub fn new(event_name: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            git_ref: git_ref.into(),
            head_branch: None,
            repository: String::new(),
            head_repository: String::new(),
            runner_os: std::env::consts::OS.to_string(),
            env: HashMap::new(),
            matrix: HashMap::new(),
            secrets: Secrets::default(),
            file_hashes: HashMap::new(),
        }
    }

    /// Derive the context a single job instance runs under: its matrix
    /// bindings and its env layered over the pipeline-level env.
    pub fn for_job(
        &self,
        matrix: &[(String, String)],
        job_env: &HashMap<String, String>,
    ) -> RunContext {
        let mut ctx = self.clone();
        ctx.matrix = matrix.iter().cloned().collect();
        for (key, value) in job_env {
            ctx.env.insert(key.clone(), value.clone());
        }
        ctx
    }

    /// Look up a dotted identifier, e.g. `github.event_name` or `matrix.os`.
    ///
    /// Returns None for identifiers the context does not know about; the
    /// evaluator turns that into an `ExpressionError` rather than false.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let (scope, field) = path.split_once('.')?;
        match scope {
            "github" => match field {
                "event_name" => Some(self.event_name.clone()),
                "ref" => Some(self.git_ref.clone()),
                "head_ref" => Some(self.head_branch.clone().unwrap_or_default()),
                "repository" => Some(self.repository.clone()),
                "head_repository" => Some(self.head_repository.clone()),
                _ => None,
            },
            "runner" => match field {
                "os" => Some(self.runner_os.clone()),
                _ => None,
            },
            "matrix" => self.matrix.get(field).cloned(),
            "env" => self.env.get(field).cloned(),
            "secrets" => self.secrets.get(field).map(str::to_string),
            _ => None,
        }
    }

    /// Whether output matchers (annotation parsing) are active for this run.
    ///
    /// Trust boundary: pushes and same-repo pull requests get matchers; a PR
    /// whose head repository differs from the base repository does not.
    pub fn annotations_enabled(&self) -> bool {
        match self.event_name.as_str() {
            "pull_request" => {
                self.head_repository.is_empty() || self.head_repository == self.repository
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new("push", "refs/heads/main");
        ctx.repository = "acme/widget".to_string();
        ctx.head_repository = "acme/widget".to_string();
        ctx.env.insert("CI".to_string(), "true".to_string());
        ctx
    }

    #[test]
    fn test_lookup_github_fields() {
        let ctx = ctx();
        assert_eq!(ctx.lookup("github.event_name"), Some("push".to_string()));
        assert_eq!(ctx.lookup("github.ref"), Some("refs/heads/main".to_string()));
        assert_eq!(ctx.lookup("github.head_ref"), Some(String::new()));
        assert_eq!(ctx.lookup("github.unknown"), None);
    }

    #[test]
    fn test_lookup_env_and_matrix() {
        let mut ctx = ctx();
        ctx.matrix.insert("python-version".to_string(), "3.6".to_string());
        assert_eq!(ctx.lookup("env.CI"), Some("true".to_string()));
        assert_eq!(ctx.lookup("matrix.python-version"), Some("3.6".to_string()));
        assert_eq!(ctx.lookup("matrix.os"), None);
    }

    #[test]
    fn test_for_job_layers_env() {
        let base = ctx();
        let mut job_env = HashMap::new();
        job_env.insert("CI".to_string(), "override".to_string());
        job_env.insert("EXTRA".to_string(), "1".to_string());

        let job_ctx = base.for_job(&[("os".to_string(), "linux".to_string())], &job_env);
        assert_eq!(job_ctx.lookup("env.CI"), Some("override".to_string()));
        assert_eq!(job_ctx.lookup("env.EXTRA"), Some("1".to_string()));
        assert_eq!(job_ctx.lookup("matrix.os"), Some("linux".to_string()));
        // Base context untouched
        assert_eq!(base.lookup("env.CI"), Some("true".to_string()));
    }

    #[test]
    fn test_secrets_redaction() {
        let mut values = HashMap::new();
        values.insert("TOKEN".to_string(), "s3cr3t".to_string());
        let secrets = Secrets::new(values);

        assert_eq!(secrets.redact("token is s3cr3t!"), "token is ***!");
        assert!(!format!("{:?}", secrets).contains("s3cr3t"));
    }

    #[test]
    fn test_annotations_disabled_for_fork_pr() {
        let mut ctx = ctx();
        ctx.event_name = "pull_request".to_string();
        assert!(ctx.annotations_enabled());

        ctx.head_repository = "fork/widget".to_string();
        assert!(!ctx.annotations_enabled());
    }
}
