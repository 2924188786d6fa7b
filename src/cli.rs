//! Command-line interface

use crate::server;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tetora_core::dispatch::Task;
use tetora_core::TetoraConfig;
use tokio_util::sync::CancellationToken;

/// Default configuration file path
pub const CONFIG_PATH: &str = "tetora.toml";

/// Tetora - multi-channel AI agent orchestrator
#[derive(Debug, Parser)]
#[command(name = "tetora", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server, cron engine, and SLA checker
    Serve,
    /// Dispatch one task and print the result
    Dispatch {
        /// Agent persona to run as
        agent: String,
        /// Prompt text
        prompt: String,
        /// Attach to (or create) the session for this channel key
        #[arg(long)]
        channel: Option<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Run a configured workflow by id
    Workflow {
        /// Workflow id from the configuration
        id: String,
        /// Estimate cost from history averages without calling providers
        #[arg(long)]
        dry_run: bool,
        /// Call providers but record nothing to history
        #[arg(long, conflicts_with = "dry_run")]
        shadow: bool,
    },
    /// Parse and validate the configuration, then exit
    Validate,
}

/// Execute the parsed command
pub async fn run(cli: Cli) -> Result<()> {
    let config = TetoraConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => server::serve(config).await,
        Commands::Dispatch {
            agent,
            prompt,
            channel,
            model,
        } => dispatch_once(config, agent, prompt, channel, model).await,
        Commands::Workflow {
            id,
            dry_run,
            shadow,
        } => run_workflow(config, id, dry_run, shadow).await,
        Commands::Validate => {
            println!("configuration OK: {}", cli.config.display());
            Ok(())
        }
    }
}

async fn dispatch_once(
    config: TetoraConfig,
    agent: String,
    prompt: String,
    channel: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let app = server::App::init(config).await?;

    let mut task = Task::new(&agent, &prompt).with_source("cli");
    task.model = model;
    if let Some(channel_key) = channel {
        let session = app
            .dispatcher
            .sessions()
            .get_or_create("cli", &channel_key, &agent)
            .await?;
        task.session_id = Some(session.id);
    }

    let result = app.dispatcher.dispatch(task, CancellationToken::new()).await;
    if result.is_success() {
        println!("{}", result.output);
        Ok(())
    } else {
        anyhow::bail!("dispatch {}: {}", result.status.as_str(), result.error)
    }
}

async fn run_workflow(config: TetoraConfig, id: String, dry_run: bool, shadow: bool) -> Result<()> {
    use tetora_core::workflow::WorkflowMode;

    let def = config
        .workflows
        .iter()
        .find(|workflow| workflow.id == id)
        .cloned()
        .with_context(|| format!("workflow '{id}' not found in configuration"))?;

    let mode = if dry_run {
        WorkflowMode::DryRun
    } else if shadow {
        WorkflowMode::Shadow
    } else {
        WorkflowMode::Live
    };

    let app = server::App::init(config).await?;
    let result = app
        .workflows
        .run(&def, mode, CancellationToken::new())
        .await?;

    for step in &result.steps {
        println!(
            "{:10} {:10} ${:.4}  {}",
            step.id,
            step.status.as_str(),
            step.cost_usd,
            step.error
        );
    }
    println!("total: ${:.4}", result.total_cost_usd);
    if result.success {
        Ok(())
    } else {
        anyhow::bail!("workflow '{id}' failed")
    }
}
