use anyhow::Result;
use clap::{Parser, Subcommand};
use postrelay::config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "postrelay",
    version,
    about = "Scheduled channel republishing engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

impl Commands {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Self::Run { config, .. } | Self::Plan { config, .. } | Self::CheckConfig { config } => {
                config.as_deref()
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, retry sweep and change listener
    Run {
        /// TOML config file; environment variables are used otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Read real data but only log sends, pins and deletes
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Serve /metrics and /health on this address (e.g. 0.0.0.0:9100)
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Print the upcoming slots of a task
    Plan {
        /// Task id
        #[arg(short, long)]
        task: i64,

        /// Days ahead to expand
        #[arg(short, long, default_value = "14")]
        days: u32,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate the configuration and print it
    CheckConfig {
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.command.config_path().map(Path::to_path_buf);
    let config = commands::load_config(config_path.as_deref())?;

    // Initialize tracing/logging
    setup_tracing(&config.logging, cli.log_format.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Run {
            dry_run,
            metrics_addr,
            ..
        } => {
            tracing::info!(
                config = ?config_path,
                dry_run = %dry_run,
                metrics_addr = ?metrics_addr,
                "Starting postrelay"
            );
            commands::run(config, dry_run, metrics_addr).await?;
        }

        Commands::Plan { task, days, .. } => {
            commands::plan(config, task, days).await?;
        }

        Commands::CheckConfig { .. } => {
            commands::check_config(&config)?;
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, format: Option<&str>, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.filter_directive(verbose)));

    match logging.effective_format(format) {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
