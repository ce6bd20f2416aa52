//! Pipeline configuration from YAML
//!
//! The engine consumes an already-validated [`PipelineDefinition`]; this
//! module is the boundary that parses the declarative document and rejects
//! malformed input (unknown needs, bad matrices, dependency cycles) before
//! any job runs.

use crate::core::job::{JobTemplate, PipelineDefinition};
use crate::core::matrix::MatrixSpec;
use crate::core::step::{ActionRef, StepAction, StepTemplate};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_PARALLEL: usize = 4;
const DEFAULT_TIMEOUT_MINUTES: u64 = 60;

/// Top-level pipeline configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Maximum number of concurrently running job instances
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,

    /// Default wall-clock budget per job (minutes)
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,

    /// Jobs in declaration order (mapping preserves it)
    pub jobs: Mapping,
}

/// `needs:` accepts a single name or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeedsConfig {
    One(String),
    Many(Vec<String>),
}

impl Default for NeedsConfig {
    fn default() -> Self {
        NeedsConfig::Many(Vec::new())
    }
}

impl NeedsConfig {
    fn into_vec(self) -> Vec<String> {
        match self {
            NeedsConfig::One(name) => vec![name],
            NeedsConfig::Many(names) => names,
        }
    }
}

/// Job body as defined in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Target runner label expression
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<String>,

    /// Run-condition for the whole job
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Jobs that must succeed before this one starts
    #[serde(default)]
    pub needs: NeedsConfig,

    #[serde(default)]
    pub strategy: Option<StrategyConfig>,

    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Wall-clock budget for this job (overrides the pipeline default)
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub matrix: Value,
}

/// Step as defined in YAML: a reusable action reference or an inline script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Action reference, e.g. `cache@v1`
    #[serde(default)]
    pub uses: Option<String>,

    /// Inline script body
    #[serde(default)]
    pub run: Option<String>,

    /// Action input parameters (order preserved)
    #[serde(default)]
    pub with: Mapping,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl StepConfig {
    fn to_template(&self, job: &str) -> Result<StepTemplate, ConfigError> {
        let action = match (&self.uses, &self.run) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidStep {
                    job: job.to_string(),
                    reason: "a step declares either 'uses' or 'run', not both".to_string(),
                })
            }
            (None, None) => {
                return Err(ConfigError::InvalidStep {
                    job: job.to_string(),
                    reason: "a step must declare 'uses' or 'run'".to_string(),
                })
            }
            (Some(uses), None) => {
                let mut with = Vec::with_capacity(self.with.len());
                for (key, value) in &self.with {
                    let key = key.as_str().ok_or_else(|| ConfigError::InvalidStep {
                        job: job.to_string(),
                        reason: "'with' keys must be strings".to_string(),
                    })?;
                    let value = scalar_to_string(value).ok_or_else(|| ConfigError::InvalidStep {
                        job: job.to_string(),
                        reason: format!("'with' value for '{}' must be a scalar", key),
                    })?;
                    with.push((key.to_string(), value));
                }
                StepAction::Uses {
                    action: ActionRef::parse(uses),
                    with,
                }
            }
            (None, Some(run)) => StepAction::Run {
                script: run.clone(),
                shell: self.shell.clone(),
            },
        };

        let name = self.name.clone().unwrap_or_else(|| match &action {
            StepAction::Uses { action, .. } => action.to_string(),
            StepAction::Run { script, .. } => {
                script.lines().next().unwrap_or_default().to_string()
            }
        });

        Ok(StepTemplate {
            name,
            action,
            condition: self.condition.clone(),
            env: self.env.clone(),
            continue_on_error: self.continue_on_error,
        })
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate without building the definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_definition().map(|_| ())
    }

    /// Convert into the immutable domain model, rejecting malformed input.
    pub fn to_definition(&self) -> Result<PipelineDefinition, ConfigError> {
        let default_timeout = self.timeout_minutes.unwrap_or(DEFAULT_TIMEOUT_MINUTES);

        let mut order = Vec::with_capacity(self.jobs.len());
        let mut jobs: HashMap<String, JobTemplate> = HashMap::with_capacity(self.jobs.len());

        for (key, value) in &self.jobs {
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError::Invalid("job names must be strings".to_string()))?
                .to_string();
            if jobs.contains_key(&name) {
                return Err(ConfigError::DuplicateJob(name));
            }

            let job: JobConfig = serde_yaml::from_value(value.clone())?;

            let matrix = match &job.strategy {
                Some(strategy) => Some(MatrixSpec::from_value(&name, &strategy.matrix)?),
                None => None,
            };

            let mut steps = Vec::with_capacity(job.steps.len());
            for step in &job.steps {
                steps.push(step.to_template(&name)?);
            }
            if steps.is_empty() {
                return Err(ConfigError::InvalidStep {
                    job: name.clone(),
                    reason: "job declares no steps".to_string(),
                });
            }

            let template = JobTemplate {
                name: name.clone(),
                runs_on: job.runs_on.clone().unwrap_or_else(|| "local".to_string()),
                condition: job.condition.clone(),
                needs: job.needs.clone().into_vec(),
                matrix,
                steps,
                env: job.env.clone(),
                timeout: Duration::from_secs(
                    job.timeout_minutes.unwrap_or(default_timeout) * 60,
                ),
            };

            order.push(name.clone());
            jobs.insert(name, template);
        }

        if jobs.is_empty() {
            return Err(ConfigError::Invalid("pipeline declares no jobs".to_string()));
        }

        // All needs must reference existing jobs
        for template in jobs.values() {
            for needed in &template.needs {
                if !jobs.contains_key(needed) {
                    return Err(ConfigError::UnknownNeed {
                        job: template.name.clone(),
                        needed: needed.clone(),
                    });
                }
            }
        }

        check_cycles(&jobs, &order)?;

        Ok(PipelineDefinition {
            name: self.name.clone(),
            env: self.env.clone(),
            max_parallel: self.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL),
            jobs,
            order,
        })
    }
}

/// Depth-first cycle check over `needs` edges. Any job on the recursion
/// stack when revisited is reported by name.
fn check_cycles(
    jobs: &HashMap<String, JobTemplate>,
    order: &[String],
) -> Result<(), ConfigError> {
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();

    for name in order {
        if !visited.contains(name) {
            dfs_check(name, jobs, &mut visited, &mut stack)?;
        }
    }
    Ok(())
}

fn dfs_check(
    name: &str,
    jobs: &HashMap<String, JobTemplate>,
    visited: &mut HashSet<String>,
    stack: &mut HashSet<String>,
) -> Result<(), ConfigError> {
    visited.insert(name.to_string());
    stack.insert(name.to_string());

    if let Some(job) = jobs.get(name) {
        for needed in &job.needs {
            if stack.contains(needed) {
                return Err(ConfigError::Cycle(needed.clone()));
            }
            if !visited.contains(needed) {
                dfs_check(needed, jobs, visited, stack)?;
            }
        }
    }

    stack.remove(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let yaml = r#"
name: ci
env:
  CI: "true"
jobs:
  lint:
    runs-on: ubuntu-latest
    steps:
      - name: run flake8
        run: flake8 src
  test:
    needs: lint
    steps:
      - run: pytest
"#;

        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let definition = config.to_definition().unwrap();

        assert_eq!(definition.name, "ci");
        assert_eq!(definition.order, vec!["lint", "test"]);
        assert_eq!(definition.jobs["test"].needs, vec!["lint"]);
        assert_eq!(definition.jobs["lint"].runs_on, "ubuntu-latest");
        // Bare `run` step names itself after the script
        assert_eq!(definition.jobs["test"].steps[0].name, "pytest");
    }

    #[test]
    fn test_parse_matrix_and_uses_step() {
        let yaml = r#"
name: ci
jobs:
  test:
    strategy:
      matrix:
        python-version: [3.6, 3.7]
    steps:
      - uses: cache@v1
        with:
          path: ~/.cache/pip
          key: pip-${{ runner.os }}-${{ hashFiles('requirements.txt') }}
      - run: pytest
"#;

        let definition = PipelineConfig::from_yaml(yaml).unwrap().to_definition().unwrap();
        let job = &definition.jobs["test"];
        assert!(job.matrix.is_some());
        assert_eq!(job.instances().len(), 2);

        match &job.steps[0].action {
            StepAction::Uses { action, with } => {
                assert_eq!(action.name, "cache");
                assert_eq!(with[0], ("path".to_string(), "~/.cache/pip".to_string()));
            }
            other => panic!("expected uses step, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_need_fails() {
        let yaml = r#"
name: ci
jobs:
  test:
    needs: [nonexistent]
    steps:
      - run: pytest
"#;

        assert!(matches!(
            PipelineConfig::from_yaml(yaml),
            Err(ConfigError::UnknownNeed { .. })
        ));
    }

    #[test]
    fn test_cycle_detected_at_load() {
        let yaml = r#"
name: ci
jobs:
  a:
    needs: [c]
    steps:
      - run: "true"
  b:
    needs: [a]
    steps:
      - run: "true"
  c:
    needs: [b]
    steps:
      - run: "true"
"#;

        match PipelineConfig::from_yaml(yaml) {
            Err(ConfigError::Cycle(job)) => {
                assert!(["a", "b", "c"].contains(&job.as_str()));
            }
            other => panic!("expected cycle error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_step_with_both_uses_and_run_fails() {
        let yaml = r#"
name: ci
jobs:
  bad:
    steps:
      - uses: checkout@v2
        run: echo hi
"#;

        assert!(matches!(
            PipelineConfig::from_yaml(yaml),
            Err(ConfigError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_job_without_steps_fails() {
        let yaml = r#"
name: ci
jobs:
  empty:
    steps: []
"#;

        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_timeout_defaults_and_overrides() {
        let yaml = r#"
name: ci
timeout-minutes: 10
jobs:
  quick:
    timeout-minutes: 2
    steps:
      - run: "true"
  normal:
    steps:
      - run: "true"
"#;

        let definition = PipelineConfig::from_yaml(yaml).unwrap().to_definition().unwrap();
        assert_eq!(definition.jobs["quick"].timeout, Duration::from_secs(120));
        assert_eq!(definition.jobs["normal"].timeout, Duration::from_secs(600));
    }
}
