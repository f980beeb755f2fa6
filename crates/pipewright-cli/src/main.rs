//! pipewright CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(about = "Run and check pipewright flows", long_about = None)]
struct Cli {
    /// Engine configuration file (KDL)
    #[arg(long, global = true, env = "PIPEWRIGHT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow YAML file and print its steps
    Validate {
        /// Path to the flow file
        #[arg(default_value = ".pipewright.yml")]
        path: PathBuf,
        /// Flow name, defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a flow locally
    Run {
        /// Path to the flow file
        #[arg(default_value = ".pipewright.yml")]
        path: PathBuf,
        /// Flow name, defaults to the file name
        #[arg(long)]
        name: Option<String>,
        /// Job variables, repeatable
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        envs: Vec<String>,
        /// Number of local agents
        #[arg(long, default_value = "1")]
        agents: usize,
        /// Plugin definitions (YAML)
        #[arg(long)]
        plugins: Option<PathBuf>,
        /// Print the finished job as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path, name } => {
            commands::validate(&path, name.as_deref())?;
        }
        Commands::Run {
            path,
            name,
            envs,
            agents,
            plugins,
            json,
        } => {
            let options = commands::run::RunOptions {
                path,
                name,
                envs,
                agents,
                plugins,
                config: cli.config,
                json,
            };
            commands::run::run(options).await?;
        }
    }

    Ok(())
}
