//! Step domain model

use std::collections::HashMap;

/// Reference to a reusable action, parsed from `name@version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRef {
    pub name: String,
    pub version: Option<String>,
}

impl ActionRef {
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('@') {
            Some((name, version)) => ActionRef {
                name: name.to_string(),
                version: Some(version.to_string()),
            },
            None => ActionRef {
                name: reference.to_string(),
                version: None,
            },
        }
    }
}

impl std::fmt::Display for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What a step does: an inline script or a reusable action invocation.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Inline script body run under the declared shell (default `sh`).
    Run {
        script: String,
        shell: Option<String>,
    },
    /// Named external action with input parameters.
    Uses {
        action: ActionRef,
        with: Vec<(String, String)>,
    },
}

/// A single step of a job, as declared in the pipeline definition.
///
/// Templates are immutable; `${{ }}` placeholders in the script, parameters
/// and env are interpolated by the executor at run time.
#[derive(Debug, Clone)]
pub struct StepTemplate {
    /// Display name (falls back to the script or action reference).
    pub name: String,

    pub action: StepAction,

    /// Run-condition; evaluated before anything is spawned.
    pub condition: Option<String>,

    /// Environment overrides, highest precedence in the merge.
    pub env: HashMap<String, String>,

    /// A failure of this step does not abort the remaining steps.
    pub continue_on_error: bool,
}

impl StepTemplate {
    /// Look up a `with:` parameter by name.
    pub fn param(&self, key: &str) -> Option<&str> {
        match &self.action {
            StepAction::Uses { with, .. } => with
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            StepAction::Run { .. } => None,
        }
    }
}

/// Merge environment layers: step overrides job, job overrides pipeline.
/// The job and pipeline layers arrive pre-merged in the job context.
pub fn merge_env(
    base: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_ref_parse() {
        let with_version = ActionRef::parse("cache@v1");
        assert_eq!(with_version.name, "cache");
        assert_eq!(with_version.version, Some("v1".to_string()));
        assert_eq!(with_version.to_string(), "cache@v1");

        let bare = ActionRef::parse("checkout");
        assert_eq!(bare.name, "checkout");
        assert_eq!(bare.version, None);
    }

    #[test]
    fn test_param_lookup() {
        let step = StepTemplate {
            name: "restore cache".to_string(),
            action: StepAction::Uses {
                action: ActionRef::parse("cache@v1"),
                with: vec![
                    ("path".to_string(), "~/.cache/pip".to_string()),
                    ("key".to_string(), "pip-${{ runner.os }}".to_string()),
                ],
            },
            condition: None,
            env: HashMap::new(),
            continue_on_error: false,
        };

        assert_eq!(step.param("path"), Some("~/.cache/pip"));
        assert_eq!(step.param("missing"), None);
    }

    #[test]
    fn test_merge_env_precedence() {
        let mut base = HashMap::new();
        base.insert("A".to_string(), "job".to_string());
        base.insert("B".to_string(), "job".to_string());
        let mut overrides = HashMap::new();
        overrides.insert("B".to_string(), "step".to_string());

        let merged = merge_env(&base, &overrides);
        assert_eq!(merged.get("A"), Some(&"job".to_string()));
        assert_eq!(merged.get("B"), Some(&"step".to_string()));
    }
}
