//! Main Entrypoint for the Ultravox CLI
//!
//! This binary is responsible for:
//! 1. Loading configuration from arguments and the environment.
//! 2. Registering the client tools offered to the agent.
//! 3. Creating a call and joining it over a realtime session.
//! 4. Running the terminal conversation and stopping the session afterwards.

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};
use ultravox_cli::{
    calls::{CreateCallRequest, UltravoxClient},
    config::{Cli, Config},
    conversation::{Conversation, Outcome},
    tools::register_secret_menu,
};
use ultravox_realtime::{Session, ToolRegistry};

/// Completes when `Ctrl+C` is pressed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_cli(Cli::parse()).context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded.");

    // --- 3. Register Client Tools ---
    let tools = ToolRegistry::new();
    if config.secret_menu {
        register_secret_menu(&tools)?;
    }

    // --- 4. Create the Call ---
    let request = CreateCallRequest::from_config(&config, &tools.list());
    let client = UltravoxClient::new(config.api_key, config.base_url);
    let call = client
        .create_call(&request)
        .await
        .context("Failed to create call")?;

    // --- 5. Join the Call ---
    let mut session = Session::builder(call.join_url).tools(tools).build();
    let conversation = Conversation::attach(&session);
    session.start().await.context("Failed to join call")?;

    // --- 6. Run the Conversation ---
    let outcome = conversation
        .run(
            &session,
            BufReader::new(tokio::io::stdin()),
            &mut std::io::stdout(),
            shutdown_signal(),
        )
        .await;
    session.stop().await;

    let outcome = outcome?;
    info!(?outcome, "Conversation finished.");
    if outcome == Outcome::Failed {
        std::process::exit(1);
    }
    Ok(())
}
