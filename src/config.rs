use clap::{Args, Parser, ValueEnum};
use humantime_serde::re::humantime::parse_duration;
use std::fmt;
use std::time::Duration;

/// Runtime configuration, read from flags with environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "movies-api", version, about = "Movie catalog JSON API")]
pub struct Config {
    /// API server port
    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,

    /// Deployment environment
    #[arg(long, env = "APP_ENV", value_enum, default_value_t = Environment::Development)]
    pub env: Environment,

    #[command(flatten)]
    pub db: DbConfig,

    #[command(flatten)]
    pub limiter: LimiterConfig,

    #[command(flatten)]
    pub smtp: SmtpConfig,

    /// Origins allowed to make cross-origin requests (space separated)
    #[arg(long = "cors-trusted-origins", env = "CORS_TRUSTED_ORIGINS", value_delimiter = ' ')]
    pub cors_trusted_origins: Vec<String>,

    /// Upper bound on the graceful shutdown drain
    #[arg(long, env = "SHUTDOWN_TIMEOUT", value_parser = parse_duration, default_value = "20s")]
    pub shutdown_timeout: Duration,

    /// bcrypt work factor for new password hashes
    #[arg(long, env = "BCRYPT_COST", default_value_t = crate::models::user::DEFAULT_BCRYPT_COST)]
    pub bcrypt_cost: u32,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct DbConfig {
    /// PostgreSQL DSN; the in-memory store is used when absent
    #[arg(long = "db-dsn", env = "DATABASE_URL")]
    pub dsn: Option<String>,

    #[arg(long = "db-max-open-conns", env = "DB_MAX_OPEN_CONNS", default_value_t = 25)]
    pub max_open_conns: u32,

    #[arg(long = "db-max-idle-time", env = "DB_MAX_IDLE_TIME", value_parser = parse_duration, default_value = "15m")]
    pub max_idle_time: Duration,

    /// Deadline applied to every individual query
    #[arg(long = "db-query-timeout", env = "DB_QUERY_TIMEOUT", value_parser = parse_duration, default_value = "3s")]
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, Args)]
pub struct LimiterConfig {
    /// Token refill rate per client, in requests per second
    #[arg(long = "limiter-rps", env = "LIMITER_RPS", default_value_t = 2.0)]
    pub rps: f64,

    /// Bucket capacity per client
    #[arg(long = "limiter-burst", env = "LIMITER_BURST", default_value_t = 4)]
    pub burst: u32,

    #[arg(
        long = "limiter-enabled",
        env = "LIMITER_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enabled: bool,

    /// How often idle clients are swept
    #[arg(long = "limiter-sweep-interval", env = "LIMITER_SWEEP_INTERVAL", value_parser = parse_duration, default_value = "1m")]
    pub sweep_interval: Duration,

    /// Clients unseen for longer than this are forgotten by the sweep
    #[arg(long = "limiter-idle-timeout", env = "LIMITER_IDLE_TIMEOUT", value_parser = parse_duration, default_value = "3m")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Args)]
pub struct SmtpConfig {
    /// SMTP relay host; mail is only logged when absent
    #[arg(long = "smtp-host", env = "SMTP_HOST")]
    pub host: Option<String>,

    #[arg(id = "smtp_port", long = "smtp-port", env = "SMTP_PORT", default_value_t = 25)]
    pub port: u16,

    #[arg(long = "smtp-username", env = "SMTP_USERNAME", default_value = "")]
    pub username: String,

    #[arg(long = "smtp-password", env = "SMTP_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    #[arg(long = "smtp-sender", env = "SMTP_SENDER", default_value = "Movies API <no-reply@movies.local>")]
    pub sender: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("limiter-rps must be a positive number, got {0}")]
    InvalidRate(f64),
    #[error("limiter-burst must be at least 1")]
    InvalidBurst,
    #[error("bcrypt-cost must be between 4 and 31, got {0}")]
    InvalidBcryptCost(u32),
    #[error("db-query-timeout must be greater than zero")]
    InvalidQueryTimeout,
}

impl Config {
    /// Semantic checks that clap's parsers cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limiter.enabled && !(self.limiter.rps.is_finite() && self.limiter.rps > 0.0) {
            return Err(ConfigError::InvalidRate(self.limiter.rps));
        }
        if self.limiter.enabled && self.limiter.burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::InvalidBcryptCost(self.bcrypt_cost));
        }
        if self.db.query_timeout.is_zero() {
            return Err(ConfigError::InvalidQueryTimeout);
        }
        Ok(())
    }
}
