//! Keyless CLI - Operator commands for OTP-authorized wallets
//!
//! Builds wallet trees, prepares proofs and drives commit-reveal operations
//! through the configured relayer.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyless_client::ClientConfig;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyless=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load or create config
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("KEYLESS_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(ClientConfig::default_path);

    let config = if config_path.exists() {
        ClientConfig::load(&config_path)?
    } else {
        let config = ClientConfig::default();
        config.save(&config_path)?;
        info!("Created default config at {:?}", config_path);
        config
    };

    commands::run(cli, config).await
}
