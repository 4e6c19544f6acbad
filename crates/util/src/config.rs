use std::{env, fmt, net::SocketAddr};

use url::Url;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://shopfront.db?mode=rwc";
pub const DEFAULT_MERCADOPAGO_API_BASE: &str = "https://api.mercadopago.com/";

fn bind_address_from_env() -> Result<SocketAddr, std::net::AddrParseError> {
    env::var("APP_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
}

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
///
/// The webhook secret is injected here rather than read from a module-level
/// global so the signature verifier stays a pure function.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub webhook_secret: String,
    pub mercadopago_access_token: String,
    pub mercadopago_api_base: Url,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = bind_address_from_env().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let webhook_secret = require_var("MERCADOPAGO_WEBHOOK_SECRET")?;
        let mercadopago_access_token = require_var("MERCADOPAGO_ACCESS_TOKEN")?;

        let api_base = env::var("MERCADOPAGO_API_BASE")
            .unwrap_or_else(|_| DEFAULT_MERCADOPAGO_API_BASE.to_string());
        let mercadopago_api_base = Url::parse(&api_base).map_err(ConfigError::InvalidApiBase)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook_secret,
            mercadopago_access_token,
            mercadopago_api_base,
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidApiBase(url::ParseError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "{name} must be set and non-empty"),
            Self::InvalidApiBase(err) => write!(f, "invalid MERCADOPAGO_API_BASE value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}
