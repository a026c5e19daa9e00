// Skein CLI
//
// Design Decision: Use clap derive for argument parsing.
// Design Decision: Configuration comes from a YAML file plus SKEIN_*
// environment overrides; `skein config` prints the resolved result.

mod backends;
mod commands;

use clap::{Parser, Subcommand};

use skein_runtime::EngineConfig;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Skein - durable Serverless Workflow engine")]
#[command(version)]
pub struct Cli {
    /// Path to the engine configuration file
    #[arg(long, short, env = "SKEIN_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions
    Definition {
        #[command(subcommand)]
        command: commands::definitions::DefinitionCommand,
    },

    /// Manage workflow instances
    Instance {
        #[command(subcommand)]
        command: commands::instances::InstanceCommand,
    },

    /// Run the engine: consume continuations, process the outbox
    Listen,

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?.apply_env(),
        None => EngineConfig::default().apply_env(),
    };
    config.validate()?;

    match cli.command {
        Commands::Definition { command } => commands::definitions::run(command, &config).await,
        Commands::Instance { command } => commands::instances::run(command, &config).await,
        Commands::Listen => commands::listen::run(&config).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}
