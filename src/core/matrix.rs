//! Matrix expansion - one job template, many concrete instances
//!
//! Expansion order is part of the contract: cartesian product in axis
//! declaration order with the last axis varying fastest, excludes applied as
//! partial-match removals, includes appended last. Downstream cache keys and
//! log ordering depend on this ordering being stable.

use crate::error::ConfigError;
use serde_yaml::Value;

/// A parsed `strategy.matrix` block.
#[derive(Debug, Clone, Default)]
pub struct MatrixSpec {
    /// Axes in declaration order, each with its values in declaration order.
    axes: Vec<(String, Vec<String>)>,

    /// Partial-match combinations to remove from the cartesian product.
    excludes: Vec<Vec<(String, String)>>,

    /// Combinations appended after the product; may bind extra variables.
    includes: Vec<Vec<(String, String)>>,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn invalid(job: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidMatrix {
        job: job.to_string(),
        reason: reason.into(),
    }
}

fn parse_combination(job: &str, value: &Value) -> Result<Vec<(String, String)>, ConfigError> {
    let mapping = value
        .as_mapping()
        .ok_or_else(|| invalid(job, "include/exclude entries must be mappings"))?;

    let mut combination = Vec::new();
    for (key, val) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| invalid(job, "combination keys must be strings"))?;
        let val = scalar_to_string(val)
            .ok_or_else(|| invalid(job, format!("combination value for '{}' must be a scalar", key)))?;
        combination.push((key.to_string(), val));
    }
    Ok(combination)
}

impl MatrixSpec {
    /// Parse a matrix block from its YAML value. `job` is only for error
    /// reporting.
    pub fn from_value(job: &str, value: &Value) -> Result<Self, ConfigError> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| invalid(job, "matrix must be a mapping"))?;

        let mut spec = MatrixSpec::default();

        for (key, val) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| invalid(job, "matrix keys must be strings"))?;

            match key {
                "exclude" | "include" => {
                    let entries = val
                        .as_sequence()
                        .ok_or_else(|| invalid(job, format!("'{}' must be a sequence", key)))?;
                    for entry in entries {
                        let combination = parse_combination(job, entry)?;
                        if key == "exclude" {
                            spec.excludes.push(combination);
                        } else {
                            spec.includes.push(combination);
                        }
                    }
                }
                axis => {
                    let values = val
                        .as_sequence()
                        .ok_or_else(|| invalid(job, format!("axis '{}' must be a sequence", axis)))?;
                    let mut parsed = Vec::with_capacity(values.len());
                    for v in values {
                        parsed.push(scalar_to_string(v).ok_or_else(|| {
                            invalid(job, format!("axis '{}' values must be scalars", axis))
                        })?);
                    }
                    if parsed.is_empty() {
                        return Err(invalid(job, format!("axis '{}' has no values", axis)));
                    }
                    spec.axes.push((axis.to_string(), parsed));
                }
            }
        }

        if spec.axes.is_empty() && spec.includes.is_empty() {
            return Err(invalid(job, "matrix declares no axes and no includes"));
        }

        // Excludes may only reference declared axes; includes are free to
        // introduce new variables.
        for exclude in &spec.excludes {
            for (key, _) in exclude {
                if !spec.axes.iter().any(|(axis, _)| axis == key) {
                    return Err(invalid(
                        job,
                        format!("exclude references undeclared axis '{}'", key),
                    ));
                }
            }
        }

        Ok(spec)
    }

    /// Expand into ordered variable-binding combinations.
    pub fn expand(&self) -> Vec<Vec<(String, String)>> {
        let mut combinations: Vec<Vec<(String, String)>> = if self.axes.is_empty() {
            Vec::new()
        } else {
            let mut acc = vec![Vec::new()];
            for (axis, values) in &self.axes {
                let mut next = Vec::with_capacity(acc.len() * values.len());
                for prefix in &acc {
                    for value in values {
                        let mut combination = prefix.clone();
                        combination.push((axis.clone(), value.clone()));
                        next.push(combination);
                    }
                }
                acc = next;
            }
            acc
        };

        combinations.retain(|combination| {
            !self.excludes.iter().any(|exclude| {
                exclude.iter().all(|(key, value)| {
                    combination
                        .iter()
                        .any(|(k, v)| k == key && v == value)
                })
            })
        });

        // Includes append even when the product already contains an equal
        // combination; duplicates mirror override semantics.
        combinations.extend(self.includes.iter().cloned());

        combinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> MatrixSpec {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        MatrixSpec::from_value("test", &value).unwrap()
    }

    fn bindings(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cartesian_order() {
        let spec = spec(
            r#"
a: [a1, a2]
b: [b1, b2]
"#,
        );

        let combos = spec.expand();
        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0], bindings(&[("a", "a1"), ("b", "b1")]));
        assert_eq!(combos[1], bindings(&[("a", "a1"), ("b", "b2")]));
        assert_eq!(combos[2], bindings(&[("a", "a2"), ("b", "b1")]));
        assert_eq!(combos[3], bindings(&[("a", "a2"), ("b", "b2")]));
    }

    #[test]
    fn test_exclude_removes_exact_combination() {
        let spec = spec(
            r#"
a: [a1, a2]
b: [b1, b2]
exclude:
  - a: a1
    b: b1
"#,
        );

        let combos = spec.expand();
        assert_eq!(combos.len(), 3);
        assert!(!combos.contains(&bindings(&[("a", "a1"), ("b", "b1")])));
    }

    #[test]
    fn test_exclude_partial_match() {
        // Naming only a subset of axes removes every combination agreeing on
        // that subset.
        let spec = spec(
            r#"
a: [a1, a2]
b: [b1, b2]
exclude:
  - a: a2
"#,
        );

        let combos = spec.expand();
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c.contains(&("a".to_string(), "a1".to_string()))));
    }

    #[test]
    fn test_include_appends_even_duplicates() {
        let spec = spec(
            r#"
a: [a1, a2]
b: [b1, b2]
include:
  - a: a3
    b: b3
  - a: a1
    b: b1
"#,
        );

        let combos = spec.expand();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[4], bindings(&[("a", "a3"), ("b", "b3")]));
        // (a1, b1) appears twice: once from the product, once appended
        assert_eq!(
            combos
                .iter()
                .filter(|c| **c == bindings(&[("a", "a1"), ("b", "b1")]))
                .count(),
            2
        );
    }

    #[test]
    fn test_include_may_bind_new_variables() {
        let spec = spec(
            r#"
os: [linux]
include:
  - os: linux
    experimental: "true"
"#,
        );

        let combos = spec.expand();
        assert_eq!(combos.len(), 2);
        assert_eq!(
            combos[1],
            bindings(&[("os", "linux"), ("experimental", "true")])
        );
    }

    #[test]
    fn test_numeric_values_stringified() {
        let spec = spec(
            r#"
python-version: [3.6, 3.7]
"#,
        );
        let combos = spec.expand();
        assert_eq!(combos[0], bindings(&[("python-version", "3.6")]));
        assert_eq!(combos[1], bindings(&[("python-version", "3.7")]));
    }

    #[test]
    fn test_exclude_undeclared_axis_rejected() {
        let value: Value = serde_yaml::from_str(
            r#"
a: [a1]
exclude:
  - nope: x
"#,
        )
        .unwrap();
        assert!(matches!(
            MatrixSpec::from_value("test", &value),
            Err(ConfigError::InvalidMatrix { .. })
        ));
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let value: Value = serde_yaml::from_str("{}").unwrap();
        assert!(MatrixSpec::from_value("test", &value).is_err());
    }
}
