//! Gemini MCP Agent
//!
//! Entry point for the interactive terminal agent.

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::map_err_ignore)]
#![allow(clippy::manual_let_else)]

use clap::Parser;
use dotenvy::dotenv;
use mimalloc::MiMalloc;
use tracing::info;

use gemini_mcp_agent::chat::ChatRepl;
use gemini_mcp_agent::config::{AgentConfig, Cli};
use gemini_mcp_agent::telemetry::init_tracing;
use gemini_mcp_agent::Agent;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();

    let (mut config, load_error) = AgentConfig::load(&cli.config);

    // Initialize tracing before anything that reports through it (M-LOG-STRUCTURED)
    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("Failed to initialise logging: {e:#}");
    }

    if let Some(e) = load_error {
        tracing::error!(
            name: "agent.config.invalid",
            path = %cli.config.display(),
            error = %e,
            "Invalid config file, using defaults"
        );
    } else if !cli.config.exists() {
        info!(
            name: "agent.config.missing",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }
    config.apply_process_env();

    info!(
        name: "agent.config.loaded",
        config_file = %cli.config.display(),
        provider = config.agent.model_provider.as_str(),
        model = %config.agent.model_name,
        "Configuration loaded"
    );

    let agent = match Agent::initialize(config).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(name: "agent.init.failed", error = %e, "Agent initialisation failed");
            eprintln!("Failed to initialise the agent: {e}");
            eprintln!("Check the configuration, API keys and mcp.json, then try again.");
            std::process::exit(1);
        }
    };

    if let Err(e) = ChatRepl::new(agent).run().await {
        tracing::error!(name: "chat.failed", error = %format!("{e:#}"), "Chat session failed");
        eprintln!("Chat session failed: {e:#}");
        std::process::exit(1);
    }
}
