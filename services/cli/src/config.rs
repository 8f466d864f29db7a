use chrono::{DateTime, Local};
use clap::Parser;
use secrecy::SecretString;
use serde_json::Value;
use tracing::Level;

use crate::calls::DEFAULT_BASE_URL;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Command-line arguments for the `ultravox` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "ultravox", about = "Chat with an Ultravox agent from the terminal")]
pub struct Cli {
    /// Show verbose session information
    #[arg(short, long)]
    pub verbose: bool,

    /// Name (or id) of voice to use
    #[arg(short = 'V', long)]
    pub voice: Option<String>,

    /// System prompt to use for the call
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Temperature to use when creating the call
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f64,

    /// JSON string containing a list of initial messages to be provided to the call
    #[arg(long)]
    pub initial_messages_json: Option<String>,

    /// Offer the example getSecretMenu tool to the agent
    #[arg(long)]
    pub secret_menu: bool,
}

/// Everything the binary needs, resolved from arguments and environment.
#[derive(Debug)]
pub struct Config {
    pub api_key: SecretString,
    pub base_url: String,
    pub log_level: Level,
    pub system_prompt: String,
    pub temperature: f64,
    pub voice: Option<String>,
    pub initial_messages: Vec<Value>,
    pub secret_menu: bool,
}

impl Config {
    /// Merges parsed arguments with environment variables.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = std::env::var("ULTRAVOX_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("ULTRAVOX_API_KEY".to_string()))?;

        let base_url =
            std::env::var("ULTRAVOX_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let log_level = if cli.verbose {
            Level::DEBUG
        } else {
            let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
            log_level_str.parse::<Level>().map_err(|_| {
                ConfigError::InvalidValue(
                    "RUST_LOG".to_string(),
                    format!("'{}' is not a valid log level", log_level_str),
                )
            })?
        };

        if !cli.temperature.is_finite() {
            return Err(ConfigError::InvalidValue(
                "--temperature".to_string(),
                format!("'{}' is not a number", cli.temperature),
            ));
        }

        let initial_messages = match cli.initial_messages_json.as_deref() {
            Some(json) => parse_initial_messages(json)?,
            None => Vec::new(),
        };

        Ok(Self {
            api_key: SecretString::from(api_key),
            base_url,
            log_level,
            system_prompt: cli
                .system_prompt
                .unwrap_or_else(|| default_system_prompt(Local::now())),
            temperature: cli.temperature,
            voice: cli.voice.filter(|voice| !voice.is_empty()),
            initial_messages,
            secret_menu: cli.secret_menu,
        })
    }
}

pub fn default_system_prompt(now: DateTime<Local>) -> String {
    format!(
        "You are a friendly assistant. Local time is currently:\n{}\n\
         The user is talking to you over voice on their phone, and your response will be\n\
         read out loud with realistic text-to-speech (TTS) technology.",
        now.to_rfc3339()
    )
}

fn parse_initial_messages(json: &str) -> Result<Vec<Value>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue("--initial-messages-json".to_string(), reason);
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Array(messages)) => Ok(messages),
        Ok(_) => Err(invalid("initial_messages_json must be a JSON list".to_string())),
        Err(e) => Err(invalid(format!("Invalid JSON format: {}", e))),
    }
}
