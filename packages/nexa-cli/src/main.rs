use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nexa_scheduler::SchedulerConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser)]
#[command(name = "nexa")]
#[command(about = "Nexa scheduler CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a synthetic workload on all three lanes and report lane metrics
    Simulate(simulate::SimulateArgs),
    /// Print the default scheduler configuration as JSON
    Config,
    /// Validate a scheduler configuration file
    Check {
        /// Path to a JSON configuration file
        path: PathBuf,
    },
}

pub(crate) fn load_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(SchedulerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            let local = tokio::task::LocalSet::new();
            local.run_until(simulate::run(args)).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&SchedulerConfig::default())?);
        }
        Commands::Check { path } => {
            let config = load_config(Some(&path))?;
            if config.max_pool_size == Some(0) {
                tracing::warn!("maxPoolSize is 0, retired tasks will never be reused");
            }
            for priority in nexa_scheduler::Priority::ALL {
                println!("{priority}: {:?}", config.lane(priority).tick);
            }
        }
    }

    Ok(())
}
