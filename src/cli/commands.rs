//! CLI command definitions

use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Trigger event name ("push", "pull_request", ...)
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Git ref that triggered the run
    #[arg(long, default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Head branch, for pull_request events
    #[arg(long)]
    pub head_branch: Option<String>,

    /// Base repository slug (owner/name)
    #[arg(long, default_value = "")]
    pub repo: String,

    /// Head repository slug when it differs from --repo (fork PRs)
    #[arg(long)]
    pub head_repo: Option<String>,

    /// Environment overrides (key=value), highest precedence
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Override the pipeline's parallelism cap
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Run cache steps without a backing store (always cold)
    #[arg(long)]
    pub no_cache: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("CI=true"),
            Ok(("CI".to_string(), "true".to_string()))
        );
        assert_eq!(
            parse_key_value("URL=http://x?a=b"),
            Ok(("URL".to_string(), "http://x?a=b".to_string()))
        );
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["conveyor", "run", "--file", "ci.yml"]).unwrap();
        match cli.command {
            crate::cli::Command::Run(cmd) => {
                assert_eq!(cmd.event, "push");
                assert_eq!(cmd.git_ref, "refs/heads/main");
                assert!(cmd.env.is_empty());
                assert!(!cmd.no_cache);
            }
            other => panic!("expected run command, got {:?}", other),
        }
    }
}
