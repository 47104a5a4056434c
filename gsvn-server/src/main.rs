//! GSvn Server - svn:// protocol bridge
//!
//! Serves Subversion clients over the native `svn://` protocol in front of
//! a commit-graph repository.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gsvn_protocol::{Config, ServerContext, serve};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// GSvn Server Configuration
#[derive(Parser, Debug)]
#[command(name = "gsvn")]
#[command(author = "GSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "svn:// protocol server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overrides the config (e.g., 0.0.0.0:3690)
        #[arg(short, long)]
        addr: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Configuration file (TOML)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, addr, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let mut config = match &config {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    Config::load(path)?
                }
                None => Config::default(),
            };
            if let Some(addr) = addr {
                config.listen = addr;
            }
            let listen: SocketAddr = config.listen_addr()?;

            let server = ServerContext::from_config(&config)?;
            if server.repositories.is_empty() {
                warn!("No repositories configured; every connection will be refused");
            }
            for name in server.repositories.list() {
                info!("Serving repository '{}'", name);
            }
            let mechanisms: Vec<&str> = server.mechanisms().iter().map(|m| m.as_word()).collect();
            info!("Authentication mechanisms: {}", mechanisms.join(" "));

            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("Failed to bind {}", listen))?;
            info!("Ready to accept svn:// connections");

            serve(listener, Arc::new(server)).await?;
        }

        Commands::CheckConfig { file } => {
            let config = Config::load(&file)?;
            let server = ServerContext::from_config(&config)?;
            println!("{}: OK", file.display());
            println!("  listen:       {}", config.listen);
            println!("  realm:        {}", config.realm);
            println!("  repositories: {}", server.repositories.list().join(", "));
            println!("  users:        {}", config.users.len());
        }
    }

    Ok(())
}
