use std::{env, fmt, net::SocketAddr, time::Duration};

use workfinder_core::lifecycle::RejectScope;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://workfinder.db?mode=rwc";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 120;
pub const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEV_JWT_SECRET: &str = "dev-secret";

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
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub jwt_secret: Vec<u8>,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub reject_scope: RejectScope,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("APP_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let jwt_secret = match env::var("APP_JWT_SECRET") {
            Ok(value) if !value.is_empty() => value.into_bytes(),
            _ if matches!(environment, Environment::Production) => {
                return Err(ConfigError::MissingJwtSecret)
            }
            _ => DEV_JWT_SECRET.as_bytes().to_vec(),
        };

        let cache_ttl = positive_secs("APP_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?;
        let cache_sweep_interval =
            positive_secs("APP_CACHE_SWEEP_SECS", DEFAULT_CACHE_SWEEP_SECS)?;

        let reject_scope = match env::var("APP_REJECT_SCOPE") {
            Ok(value) => value
                .parse::<RejectScope>()
                .map_err(|_| ConfigError::InvalidRejectScope(value))?,
            Err(_) => RejectScope::default(),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            jwt_secret,
            cache_ttl,
            cache_sweep_interval,
            reject_scope,
        })
    }
}

fn positive_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidSeconds { name, value: raw }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingJwtSecret,
    InvalidSeconds { name: &'static str, value: String },
    InvalidRejectScope(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingJwtSecret => {
                write!(f, "APP_JWT_SECRET must be set in production")
            }
            Self::InvalidSeconds { name, value } => {
                write!(f, "{name} must be a positive number of seconds (got {value})")
            }
            Self::InvalidRejectScope(value) => {
                write!(f, "APP_REJECT_SCOPE must be 'job' or 'global' (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
