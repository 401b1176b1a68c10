//! Runs the SQL agent over a range of tasks and writes one JSON line per
//! episode.

use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sql_agent_gym::config::EvalConfig;
use sql_agent_gym::{Agent, Environment, RunResult};

/// Evaluate a tool-calling SQL agent against a task set.
#[derive(Parser)]
#[command(name = "sql_agent_eval", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long)]
    config: Option<PathBuf>,

    /// First task index (inclusive).
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Last task index (exclusive); defaults to the end of the task set.
    #[arg(long)]
    end: Option<usize>,

    /// Override the per-episode turn budget.
    #[arg(long)]
    max_turns: Option<u32>,

    /// Override the model identifier.
    #[arg(long)]
    model: Option<String>,

    /// Where to write results as JSON lines.
    #[arg(long, default_value = "results.jsonl")]
    output: PathBuf,
}

#[derive(Serialize)]
struct EpisodeRecord<'a> {
    task_index: usize,
    #[serde(flatten)]
    result: &'a RunResult,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EvalConfig::load(path)?,
        None => EvalConfig::default(),
    };
    if let Some(model) = cli.model {
        config.model.model = model;
    }
    if let Some(max_turns) = cli.max_turns {
        config.agent.max_turns = max_turns;
    }

    let mut env = Environment::from_config(&config.env).await?;
    let agent = Agent::builder()
        .shared_model(config.model.build_model()?)
        .retry_policy(config.retry.to_policy())
        .config(config.agent.to_agent_config(config.model.temperature))
        .build()?;

    let end = cli.end.unwrap_or(env.task_count()).min(env.task_count());
    info!(
        start = cli.start,
        end,
        model = %config.model.model,
        output = %cli.output.display(),
        "starting evaluation"
    );

    let mut writer = BufWriter::new(File::create(&cli.output)?);
    let mut total_reward = 0.0;
    let mut episodes = 0_usize;
    let mut aborted = 0_usize;

    for task_index in cli.start..end {
        let result = match agent.run(&mut env, task_index).await {
            Ok(result) => result,
            Err(err) => {
                error!(task_index, error = %err, "episode aborted");
                aborted += 1;
                RunResult::aborted(&err)
            }
        };

        total_reward += result.reward;
        episodes += 1;

        serde_json::to_writer(
            &mut writer,
            &EpisodeRecord {
                task_index,
                result: &result,
            },
        )?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    let mean_reward = if episodes == 0 {
        0.0
    } else {
        total_reward / episodes as f64
    };
    info!(episodes, aborted, mean_reward, "evaluation finished");

    Ok(())
}
