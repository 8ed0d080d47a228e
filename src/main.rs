//! octogate - OpenAI-compatible gateway across multiple upstream providers.
//!
//! A local gateway that spreads chat-completion traffic over GitHub Copilot
//! accounts and other OpenAI-compatible upstreams, with per-account rate
//! budgets and transparent failover.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "octogate")]
#[command(about = "OpenAI-compatible gateway across multiple upstream providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "octogate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            tracing::info!(config = %config, "loading configuration");
            let config = octogate::Config::from_file(&config)?;
            octogate::proxy::run_server(config).await
        }

        Commands::Check { config } => {
            let loaded = octogate::Config::from_file(&config)?;
            let enabled = loaded.providers.iter().filter(|p| p.enabled).count();
            tracing::info!(
                config = %config,
                providers = loaded.providers.len(),
                enabled,
                "configuration is valid"
            );
            Ok(())
        }
    }
}
