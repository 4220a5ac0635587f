use anyhow::Context;
use std::str::FromStr;

/// Which handlers this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consume release events and publish news.
    Announcer,
    /// Consume news and log it.
    Logger,
    All,
}

impl Role {
    pub fn runs_announcer(self) -> bool {
        matches!(self, Role::Announcer | Role::All)
    }

    pub fn runs_logger(self) -> bool {
        matches!(self, Role::Logger | Role::All)
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "announcer" => Ok(Role::Announcer),
            "logger" => Ok(Role::Logger),
            "all" => Ok(Role::All),
            other => Err(anyhow::anyhow!(
                "unknown role '{other}', expected announcer, logger or all"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub source_dsn: Option<String>,
    pub source_queue: String,
    pub target_dsn: String,
    pub target_exchange: String,
    pub target_routing_key: String,
    pub news_queue: String,
    pub health_port: u16,
}

impl Config {
    /// Build a configuration from environment variables.
    ///
    /// Required variables: `TARGET_DSN`, and `SOURCE_DSN` when the role runs
    /// the announcer.
    /// Optional variables: `ROLE`, `SOURCE_QUEUE`, `TARGET_EXCHANGE`,
    /// `TARGET_ROUTING_KEY`, `NEWS_QUEUE`, `HEALTH_PORT`.
    ///
    /// # Errors
    /// Returns an error if required environment variables are missing, if
    /// `ROLE` is not a known role, or if `HEALTH_PORT` is set but is not a
    /// valid `u16`.
    pub fn from_env() -> anyhow::Result<Self> {
        let role = match std::env::var("ROLE") {
            Ok(value) => value.parse().context("Invalid ROLE")?,
            Err(_) => Role::All,
        };

        let source_dsn = std::env::var("SOURCE_DSN").ok();
        if role.runs_announcer() && source_dsn.is_none() {
            anyhow::bail!("SOURCE_DSN environment variable not set");
        }

        let health_port = match std::env::var("HEALTH_PORT") {
            Ok(port) => port
                .parse()
                .with_context(|| format!("HEALTH_PORT '{port}' is not a valid port"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            role,
            source_dsn,
            source_queue: std::env::var("SOURCE_QUEUE")
                .unwrap_or_else(|_| "release-events".to_string()),
            target_dsn: std::env::var("TARGET_DSN")
                .context("TARGET_DSN environment variable not set")?,
            target_exchange: std::env::var("TARGET_EXCHANGE")
                .unwrap_or_else(|_| "news_xchg".to_string()),
            target_routing_key: std::env::var("TARGET_ROUTING_KEY")
                .unwrap_or_else(|_| "news".to_string()),
            news_queue: std::env::var("NEWS_QUEUE").unwrap_or_else(|_| "news".to_string()),
            health_port,
        })
    }
}
