// execpool CLI
//
// Runs commands through a bounded process pool configured from the
// environment (and an optional .env file).

mod output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use exec_pool::{validate_command, ExecOptions, PoolConfig, PoolProvider};
use futures::future::join_all;
use tracing_subscriber::EnvFilter;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "execpool")]
#[command(about = "Run external commands through a bounded process pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Override MAX_WORKERS
    #[arg(long, short)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command, optionally several copies concurrently
    Run {
        /// Per-task timeout in milliseconds (default: DEFAULT_TASK_TIMEOUT_MS)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Number of copies to submit at once
        #[arg(long, default_value = "1")]
        repeat: usize,

        /// Command followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Check a command line against the argument validator without running it
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Print the effective pool configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    // RUST_LOG wins; otherwise LOG_LEVEL applies to both crates
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("exec_pool={level},execpool={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!("Loaded .env from {:?}", path);
    }

    let cli = Cli::parse();
    let format = OutputFormat::from_str(&cli.output);

    let mut config = PoolConfig::from_env();
    if let Some(workers) = cli.workers {
        config = config.with_max_workers(workers);
    }
    config.validate().context("Invalid pool configuration")?;

    match cli.command {
        Commands::Run {
            timeout_ms,
            cwd,
            env,
            repeat,
            argv,
        } => {
            let mut options = ExecOptions::new();
            options.cwd = cwd;
            options.env = parse_env(&env)?;
            options.timeout = timeout_ms.map(Duration::from_millis);
            run(config, format, argv, options, repeat).await
        }
        Commands::Check { argv } => {
            let (command, args) = split_argv(argv)?;
            validate_command(&command, &args)?;
            println!("ok");
            Ok(())
        }
        Commands::Config => format.print_value(&config),
    }
}

async fn run(
    config: PoolConfig,
    format: OutputFormat,
    argv: Vec<String>,
    options: ExecOptions,
    repeat: usize,
) -> Result<()> {
    let (command, args) = split_argv(argv)?;
    let provider = PoolProvider::new(config);
    let pool = provider.get();

    let handles = (0..repeat.max(1))
        .map(|_| pool.submit(command.as_str(), args.iter().cloned(), options.clone()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to submit '{command}'"))?;

    tracing::info!(tasks = handles.len(), command = %command, "Submitted");

    let outcomes = tokio::select! {
        outcomes = join_all(handles) => outcomes,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            provider.shutdown().await;
            bail!("interrupted");
        }
    };

    let mut failed = 0;
    for (index, outcome) in outcomes.iter().enumerate() {
        if !matches!(outcome, Ok(result) if result.success()) {
            failed += 1;
        }
        format.print_outcome(index + 1, outcome)?;
    }
    format.print_stats(&pool.stats())?;

    provider.shutdown().await;

    if failed > 0 {
        bail!("{failed} of {} task(s) did not succeed", outcomes.len());
    }
    Ok(())
}

fn split_argv(mut argv: Vec<String>) -> Result<(String, Vec<String>)> {
    if argv.is_empty() {
        bail!("missing command");
    }
    let command = argv.remove(0);
    Ok((command, argv))
}

fn parse_env(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("Expected KEY=VALUE, got '{pair}'"))
        })
        .collect()
}
