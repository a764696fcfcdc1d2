use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relayr::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayr=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            model,
            prompt,
            max_tokens,
            temperature,
            system,
            config,
        } => {
            relayr::cli::run(model, prompt, max_tokens, temperature, system, config).await?;
        }
        Commands::Serve {
            model,
            port,
            host,
            config,
        } => {
            relayr::cli::serve(model, port, host, config).await?;
        }
    }

    Ok(())
}
