//! `skein definition` subcommands

use clap::Subcommand;

use skein_runtime::EngineConfig;

use crate::backends;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Print a stored definition
    Get {
        name: String,
        version: String,
    },

    /// Store a definition from a YAML/JSON file
    Post {
        /// Path to the workflow document
        file: String,
    },

    /// Delete a stored definition
    Delete {
        name: String,
        version: String,
    },

    /// List stored definitions
    List,
}

pub async fn run(command: DefinitionCommand, config: &EngineConfig) -> anyhow::Result<()> {
    let backends = backends::build(config).await?;
    match command {
        DefinitionCommand::Get { name, version } => {
            let stored = backends.definitions.get(&name, &version).await?;
            print!("{}", stored.source);
        }
        DefinitionCommand::Post { file } => {
            let source = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("cannot read {file}: {e}"))?;
            let stored = backends.definitions.put(&source).await?;
            println!(
                "stored {} {}",
                stored.document.name(),
                stored.document.version()
            );
        }
        DefinitionCommand::Delete { name, version } => {
            backends.definitions.delete(&name, &version).await?;
            println!("deleted {name} {version}");
        }
        DefinitionCommand::List => {
            for (name, version) in backends.definitions.list().await? {
                println!("{name} {version}");
            }
        }
    }
    Ok(())
}
