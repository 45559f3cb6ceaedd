use anyhow::Result;
use clap::{CommandFactory, Parser};

use deckterm::attach::run_attach;
use deckterm::logging::init_logging;
use deckterm::{Cli, Commands, FileConfig, LoggingConfig, ServeArgs, ServerConfig, WebServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let file = FileConfig::load(cli.config.as_deref())?;
    init_logging(&LoggingConfig::resolve(&cli, &file))?;

    match &cli.command {
        Some(Commands::Attach(args)) => run_attach(args, &file).await,
        Some(Commands::Serve(args)) => serve(args, &file).await,
        Some(Commands::Completions { .. }) => Ok(()),
        None => serve(&cli.serve, &file).await,
    }
}

async fn serve(args: &ServeArgs, file: &FileConfig) -> Result<()> {
    let config = ServerConfig::resolve(args, file)?;
    tracing::info!(
        addr = %config.bind_addr,
        persistence = %config.persistence,
        max_terminals = config.manager.limits.max_sessions,
        "starting deckterm"
    );
    WebServer::new(config).await?.start().await
}
