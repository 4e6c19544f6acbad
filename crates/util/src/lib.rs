//! Shared configuration utilities for the webhook processor binaries.

pub mod config;

pub use config::{AppConfig, ConfigError, Environment};

/// Loads environment variables from a `.env` file when one exists.
/// Deployments without a dotenv file are served entirely by the process
/// environment, so a missing file is not an error.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}
