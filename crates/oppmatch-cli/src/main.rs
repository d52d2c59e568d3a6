use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oppmatch")]
#[command(about = "Opportunity Match Server command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve,
    /// Print the effective engine configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => oppmatch_web::serve_from_env().await?,
        Commands::Config => {
            let config = oppmatch_engine::EngineConfig::from_env();
            println!("score_cutoff={}", config.score_cutoff);
        }
    }

    Ok(())
}
