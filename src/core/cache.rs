//! Cache key resolution and the external cache store contract
//!
//! This module only computes and orders keys; lookup and storage belong to an
//! external store. A miss or a broken store is never fatal - the job proceeds
//! as a cold run and only loses speed.

use crate::core::context::RunContext;
use crate::core::expr;
use crate::core::job::PipelineDefinition;
use crate::core::step::StepAction;
use crate::error::ExpressionError;
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::warn;

/// Restore keys are derived by splitting the primary key on this delimiter
/// and dropping trailing segments one at a time.
const KEY_DELIMITER: char = '-';

/// A resolved cache declaration: what to look up and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Fully resolved primary key.
    pub key: String,

    /// Filesystem path the blob materializes at.
    pub path: String,

    /// Fallback keys, most specific first; each is a strict prefix of the
    /// primary key.
    pub restore_keys: Vec<String>,
}

impl CacheEntry {
    /// Primary key followed by the restore chain, in lookup order.
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(1 + self.restore_keys.len());
        keys.push(self.key.clone());
        keys.extend(self.restore_keys.iter().cloned());
        keys
    }
}

/// Resolve a key template against the run context and derive the restore
/// chain. Deterministic: identical file hashes and context produce identical
/// keys across invocations.
pub fn resolve(
    template: &str,
    path: &str,
    ctx: &RunContext,
) -> Result<CacheEntry, ExpressionError> {
    let key = expr::interpolate(template, ctx)?;
    let restore_keys = restore_chain(&key);
    Ok(CacheEntry {
        key,
        path: path.to_string(),
        restore_keys,
    })
}

/// Prefix-truncation policy: `pip-linux-abc` yields `pip-linux-`, `pip-`.
/// The trailing delimiter is kept so every restore key is a true prefix of
/// the primary key.
fn restore_chain(key: &str) -> Vec<String> {
    let segments: Vec<&str> = key.split(KEY_DELIMITER).collect();
    (1..segments.len())
        .rev()
        .map(|keep| {
            let mut prefix = segments[..keep].join(&KEY_DELIMITER.to_string());
            prefix.push(KEY_DELIMITER);
            prefix
        })
        .collect()
}

/// SHA-256 content digests for the given files. A missing or unreadable file
/// is skipped with a warning; the resulting key is simply colder.
pub fn hash_files<P: AsRef<Path>>(paths: &[P]) -> HashMap<String, String> {
    let mut hashes = HashMap::new();
    for path in paths {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(contents) => {
                let digest = Sha256::digest(&contents);
                hashes.insert(path.display().to_string(), hex::encode(digest));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable cache input file");
            }
        }
    }
    hashes
}

/// Scan a pipeline definition for `hashFiles('...')` arguments so their
/// digests can be computed once at run start.
pub fn collect_hash_inputs(definition: &PipelineDefinition) -> Vec<String> {
    let pattern = Regex::new(r"hashFiles\(\s*'([^']+)'").expect("static regex");
    let mut inputs = Vec::new();

    let mut scan = |text: &str| {
        for capture in pattern.captures_iter(text) {
            let path = capture[1].to_string();
            if !inputs.contains(&path) {
                inputs.push(path);
            }
        }
    };

    // hashFiles can appear anywhere an expression is evaluated: scripts,
    // action params, conditions, runner labels and env values.
    for value in definition.env.values() {
        scan(value);
    }
    for name in &definition.order {
        let Some(job) = definition.jobs.get(name) else {
            continue;
        };
        scan(&job.runs_on);
        if let Some(condition) = &job.condition {
            scan(condition);
        }
        for value in job.env.values() {
            scan(value);
        }
        for step in &job.steps {
            if let Some(condition) = &step.condition {
                scan(condition);
            }
            for value in step.env.values() {
                scan(value);
            }
            match &step.action {
                StepAction::Run { script, .. } => scan(script),
                StepAction::Uses { with, .. } => {
                    for (_, value) in with {
                        scan(value);
                    }
                }
            }
        }
    }

    inputs
}

/// External key -> blob store. Writes race last-write-wins; correctness of
/// the build never depends on what the cache returns.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Try each key in order, longest prefix first. Returns the key that
    /// matched, if any, after materializing the blob at `path`.
    async fn restore(&self, keys: &[String], path: &str) -> Option<String>;

    /// Store the blob currently at `path` under `key`.
    async fn save(&self, key: &str, path: &str);
}

/// In-memory store for tests and local runs. Restore matches a stored key
/// exactly or by prefix, mirroring the external store's longest-prefix-match
/// contract.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn restore(&self, keys: &[String], _path: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        for key in keys {
            if entries.contains_key(key) {
                return Some(key.clone());
            }
            if let Some(stored) = entries.keys().find(|stored| stored.starts_with(key.as_str())) {
                return Some(stored.clone());
            }
        }
        None
    }

    async fn save(&self, key: &str, path: &str) {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new("push", "refs/heads/master");
        ctx.runner_os = "linux".to_string();
        ctx.file_hashes
            .insert("requirements.txt".to_string(), "cafe".to_string());
        ctx
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let ctx = ctx();
        let template = "pip-${{ runner.os }}-${{ hashFiles('requirements.txt') }}";

        let first = resolve(template, "~/.cache/pip", &ctx).unwrap();
        let second = resolve(template, "~/.cache/pip", &ctx).unwrap();
        assert_eq!(first, second);
        assert!(first.key.starts_with("pip-linux-"));
    }

    #[test]
    fn test_restore_keys_form_prefix_chain() {
        let ctx = ctx();
        let entry = resolve("pip-${{ runner.os }}-abc123", "p", &ctx).unwrap();

        assert_eq!(entry.restore_keys, vec!["pip-linux-", "pip-"]);
        let mut previous_len = entry.key.len();
        for restore in &entry.restore_keys {
            assert!(entry.key.starts_with(restore.as_str()));
            assert!(restore.len() < previous_len, "specificity must strictly decrease");
            previous_len = restore.len();
        }
    }

    #[test]
    fn test_single_segment_key_has_no_restore_keys() {
        let ctx = ctx();
        let entry = resolve("static", "p", &ctx).unwrap();
        assert!(entry.restore_keys.is_empty());
        assert_eq!(entry.lookup_keys(), vec!["static"]);
    }

    #[test]
    fn test_hash_files_identical_content_identical_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let mut fa = std::fs::File::create(&a).unwrap();
        fa.write_all(b"same contents").unwrap();
        let mut fb = std::fs::File::create(&b).unwrap();
        fb.write_all(b"same contents").unwrap();

        let hashes = hash_files(&[&a, &b]);
        assert_eq!(hashes.len(), 2);
        assert_eq!(
            hashes[&a.display().to_string()],
            hashes[&b.display().to_string()]
        );
    }

    #[test]
    fn test_hash_files_skips_missing() {
        let hashes = hash_files(&["/nonexistent/file/path.txt"]);
        assert!(hashes.is_empty());
    }

    #[test]
    fn test_collect_hash_inputs_scans_conditions_and_env() {
        let yaml = r#"
name: inputs
env:
  LOCKED: "${{ hashFiles('Cargo.lock') }}"
jobs:
  build:
    if: hashFiles('requirements.txt') != ''
    runs-on: "runner-${{ hashFiles('runner.cfg') }}"
    steps:
      - if: hashFiles('setup.py') != ''
        run: "true"
      - run: "echo ${{ hashFiles('package-lock.json') }}"
        env:
          DEPS: "${{ hashFiles('go.sum') }}"
      - uses: cache@v1
        with:
          key: "pip-${{ hashFiles('requirements.txt') }}"
          path: "~/.cache/pip"
"#;
        let definition = crate::core::config::PipelineConfig::from_yaml(yaml)
            .unwrap()
            .to_definition()
            .unwrap();

        let inputs = collect_hash_inputs(&definition);
        for expected in [
            "Cargo.lock",
            "requirements.txt",
            "runner.cfg",
            "setup.py",
            "package-lock.json",
            "go.sum",
        ] {
            assert!(
                inputs.iter().any(|i| i == expected),
                "missing input: {expected}"
            );
        }
        // Deduplicated: requirements.txt appears in both the condition and
        // the cache key.
        assert_eq!(
            inputs.iter().filter(|i| *i == "requirements.txt").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_in_memory_store_prefix_restore() {
        let store = InMemoryCacheStore::new();
        store.save("pip-linux-abc123", "/tmp/cache").await;

        // Exact primary miss, restore key prefix hit
        let matched = store
            .restore(
                &["pip-linux-def456".to_string(), "pip-linux-".to_string()],
                "/tmp/cache",
            )
            .await;
        assert_eq!(matched, Some("pip-linux-abc123".to_string()));

        let miss = store.restore(&["npm-".to_string()], "/tmp/cache").await;
        assert_eq!(miss, None);
    }
}
