//! Command-line runner for task documents
//!
//! Loads a YAML task, connects to the local Docker daemon, runs every test case
//! in isolated containers and prints a per-case summary. The process exits with
//! status 1 when any case fails, so it can gate scripts and CI jobs.

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vrun_core::{DockerEngine, RunContext, RunResult, Runner, RunnerOptions, TaskLoader};

#[derive(Parser, Debug)]
#[clap(author, version, about = "vrun - run a program against test cases in isolated containers")]
struct Cli {
    #[clap(long, short, default_value = "task.yaml", help = "Path to the YAML task document")]
    task: PathBuf,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Abort the whole run after this many seconds")]
    timeout_secs: Option<u64>,

    #[clap(long, short, default_value_t = 1, help = "Test cases run concurrently in the isolated model")]
    parallelism: usize,

    #[clap(long, default_value = "/code", help = "Directory inside the container where sources are staged")]
    working_dir: String,

    #[clap(long, help = "Bytes of stdout and of stderr kept per container")]
    max_output_bytes: Option<usize>,

    #[clap(long, help = "Print the result as JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::info!("Loading task from: {}", cli.task.display());
    let task = TaskLoader::from_file(&cli.task).await?;

    let mut engine = DockerEngine::connect().context("Failed to connect to Docker")?;
    if let Some(bytes) = cli.max_output_bytes {
        engine = engine.with_log_limit(bytes);
    }
    if !engine.is_available().await {
        anyhow::bail!("Docker daemon is not reachable; is it running?");
    }

    let ctx = match cli.timeout_secs {
        Some(secs) => RunContext::with_timeout(Duration::from_secs(secs)),
        None => RunContext::new(),
    };
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let runner = Runner::new(Arc::new(engine)).with_options(RunnerOptions {
        parallelism: cli.parallelism,
        working_dir: cli.working_dir,
    });
    let result = runner.run(&ctx, &task).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if !result.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    for (index, case) in result.cases.iter().enumerate() {
        match &case.error {
            None => println!("Case {}: PASS ({} ms)", index + 1, case.duration_ms),
            Some(error) => {
                println!("Case {}: FAIL ({})", index + 1, error);
                if !case.actual_output.is_empty() {
                    println!("  output: {}", case.actual_output.trim_end());
                }
                if !case.stderr.is_empty() {
                    println!("  stderr: {}", case.stderr.trim_end());
                }
            }
        }
    }
    println!("{}/{} test cases passed", result.passed_count, result.total);
}
