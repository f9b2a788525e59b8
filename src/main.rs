//! Gafaelfawr server entry point.
//!
//! Handles command-line argument parsing, settings loading, logging
//! initialization, dependency construction, and server startup.
//!
//! # Application lifecycle
//!
//! 1. Parse CLI arguments and environment variables (via Clap)
//! 2. Initialize logging (tracing with env-filter)
//! 3. Load and validate the YAML settings - any problem here is fatal
//! 4. Build the dependency record: database (with migrations), cache,
//!    sealer, signer, upstream provider
//! 5. Serve until ctrl-c or SIGTERM

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use gafaelfawr::config::Settings;
use gafaelfawr::server::service;
use gafaelfawr::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "gafaelfawr", version, about = "Authentication and authorization gateway", long_about = None)]
struct Args {
    /// Settings file path (overrides the default path)
    #[arg(
        long = "settings",
        value_name = "FILE",
        env = "GAFAELFAWR_SETTINGS_PATH"
    )]
    settings: Option<PathBuf>,

    /// Bind address override (optional)
    #[arg(
        long = "bind-address",
        value_name = "BIND_ADDRESS",
        env = "GAFAELFAWR_BIND_ADDRESS"
    )]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = match Settings::load(args.settings) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(1);
        }
    };
    if let Some(bind_address) = args.bind_address {
        settings.bind_address = bind_address;
    }

    tracing::info!(
        "Starting gafaelfawr for realm {} ({} known scopes)",
        settings.realm,
        settings.known_scopes.len()
    );

    let state = match AppState::build(settings).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    match service::start(state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server failed: {:#}", e);
            ExitCode::from(3)
        }
    }
}
