use anyhow::{Context, Result};
use conveyor::cli::commands::{RunCommand, ValidateCommand};
use conveyor::cli::output::*;
use conveyor::cli::{Cli, Command};
use conveyor::core::cache::{self, InMemoryCacheStore};
use conveyor::core::{PipelineConfig, RunContext, Secrets};
use conveyor::execution::{NullActionResolver, PipelineEngine};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Environment variables with this prefix become secrets, keyed by the rest
/// of the variable name.
const SECRET_PREFIX: &str = "CI_SECRET_";

/// Exit code for configuration errors, distinct from a failed run (1).
const CONFIG_ERROR_EXIT: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let mut definition = match PipelineConfig::from_file(&cmd.file).and_then(|c| c.to_definition())
    {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} {}", CROSS, style(&e).red());
            std::process::exit(CONFIG_ERROR_EXIT);
        }
    };
    if let Some(max) = cmd.max_parallel {
        definition.max_parallel = max;
    }

    println!("{} Loaded pipeline: {}", INFO, style(&definition.name).bold());

    let mut ctx = RunContext::new(&cmd.event, &cmd.git_ref);
    ctx.head_branch = cmd.head_branch.clone();
    ctx.repository = cmd.repo.clone();
    ctx.head_repository = cmd.head_repo.clone().unwrap_or_else(|| cmd.repo.clone());
    ctx.env = definition.env.clone();
    for (key, value) in &cmd.env {
        ctx.env.insert(key.clone(), value.clone());
        println!(
            "{} Environment override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }
    ctx.secrets = secrets_from_env();

    // Digest cache input files once, up front
    let inputs = cache::collect_hash_inputs(&definition);
    ctx.file_hashes = cache::hash_files(&inputs);

    let mut engine = if cmd.no_cache {
        PipelineEngine::new(NullActionResolver)
    } else {
        PipelineEngine::with_cache(NullActionResolver, Arc::new(InMemoryCacheStore::new()))
    };
    engine.add_event_handler(|event| println!("{}", format_run_event(&event)));

    // First ctrl-c cancels cooperatively; running jobs finish as cancelled.
    let cancellation = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancellation.cancel();
        }
    });

    println!();
    let summary = engine.execute(&definition, &ctx).await?;

    println!("\n{}", format_summary(&summary));
    std::process::exit(summary.exit_code());
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let definition = match PipelineConfig::from_file(&cmd.file).and_then(|c| c.to_definition()) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} Validation failed:", CROSS);
            eprintln!("  {}", style(&e).red());
            std::process::exit(CONFIG_ERROR_EXIT);
        }
    };

    let instances = definition.expand();
    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&definition.name).bold());
    println!("  Jobs: {}", style(definition.order.len()).cyan());
    println!(
        "  Instances after matrix expansion: {}",
        style(instances.len()).cyan()
    );

    if cmd.json {
        let data = serde_json::json!({
            "name": definition.name,
            "max_parallel": definition.max_parallel,
            "jobs": definition.order,
            "instances": instances.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
        });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(())
}

fn secrets_from_env() -> Secrets {
    let mut values = HashMap::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(SECRET_PREFIX) {
            if !name.is_empty() {
                values.insert(name.to_string(), value);
            }
        }
    }
    Secrets::new(values)
}
