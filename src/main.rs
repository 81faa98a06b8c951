//! SSO Gate - authentication gate server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use sso_gate::{
    cli::{Cli, Command},
    config::Config,
    gateway::GateServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration without starting the server
fn run_check_config(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid");
            println!("   SSO header: {}", config.gate.sso_header);
            println!("   Required grant: {}", config.gate.required_grant);
            println!("   Token lifetime: {:?}", config.gate.token_lifetime);
            println!("   Provider environment: {}", config.provider.environment);
            println!("   OAuth2: {}", if config.oauth.enabled { "enabled" } else { "disabled" });
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gate server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting SSO gate"
    );

    let server = match GateServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create gate server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Gate server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
