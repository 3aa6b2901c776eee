use clap::Parser;

use confidant::Config;
use confidant::cli::{Cli, Commands, ConfigCommands};
use confidant::commands::{
    handle_config_generate, handle_config_get, handle_config_show, handle_keygen, handle_log,
    handle_reconcile, handle_serve,
};
use confidant::config::DatabaseConfig;
use confidant::logging;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> confidant::Result<()> {
    let cli = Cli::parse();

    // Generating a config must work even when the current one is broken
    if let Commands::Config {
        command: Some(ConfigCommands::Generate { path, overwrite }),
    } = &cli.command
    {
        return handle_config_generate(path.clone(), *overwrite);
    }

    let mut config = Config::load(cli.global.config.as_deref())?;
    if let Some(database) = &cli.global.database {
        config.database = Some(DatabaseConfig {
            path: Some(database.to_string_lossy().to_string()),
        });
    }

    logging::init(&config.logging())?;

    match cli.command {
        Commands::Serve => handle_serve(&config).await,
        Commands::Reconcile { json } => handle_reconcile(&config, json).await,
        Commands::Keygen => {
            handle_keygen();
            Ok(())
        }
        Commands::Log {
            limit,
            workspace,
            target,
        } => handle_log(&config, limit, workspace, target),
        Commands::Config { command } => match command {
            None | Some(ConfigCommands::Show) => {
                handle_config_show(&config, cli.global.config.as_deref())
            }
            Some(ConfigCommands::Get { key }) => handle_config_get(&config, &key),
            Some(ConfigCommands::Generate { path, overwrite }) => {
                handle_config_generate(path, overwrite)
            }
        },
    }
}
