//! Ledger configuration.

use std::str::FromStr;
use std::time::Duration;

use simplebank_common::{LedgerError, Result};

use crate::balance::OverdraftPolicy;

/// Backing store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database URL.
    pub database_url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// How long a unit waits for a row lock before reporting a transient conflict.
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/simple_bank".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Retry configuration for transient conflicts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Randomise each delay to spread out contending callers.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Store configuration.
    pub store: StoreConfig,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Balance floor policy.
    pub overdraft: OverdraftPolicy,
    /// Deadline applied to transfers that do not carry their own.
    pub transfer_timeout: Option<Duration>,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            overdraft: OverdraftPolicy::default(),
            transfer_timeout: Some(Duration::from_secs(10)),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            LedgerError::ConfigurationError(format!("{name} has an invalid value: {raw:?}"))
        }),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

impl LedgerConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.store.database_url = url;
        }
        if let Some(max) = env_parse("LEDGER_MAX_CONNECTIONS")? {
            config.store.max_connections = max;
        }
        if let Some(timeout) = env_millis("LEDGER_ACQUIRE_TIMEOUT_MS")? {
            config.store.acquire_timeout = timeout;
        }
        if let Some(timeout) = env_millis("LEDGER_LOCK_TIMEOUT_MS")? {
            config.store.lock_timeout = timeout;
        }

        if let Some(attempts) = env_parse("LEDGER_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(delay) = env_millis("LEDGER_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = delay;
        }
        if let Some(delay) = env_millis("LEDGER_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = delay;
        }

        if let Some(policy) = env_parse("LEDGER_OVERDRAFT")? {
            config.overdraft = policy;
        }

        // 0 disables the default transfer deadline.
        if let Some(timeout) = env_millis("LEDGER_TRANSFER_TIMEOUT_MS")? {
            config.transfer_timeout = (!timeout.is_zero()).then_some(timeout);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(LedgerError::ConfigurationError(msg.to_string()));

        if self.store.database_url.is_empty() {
            return invalid("Database URL cannot be empty");
        }
        if self.store.max_connections == 0 {
            return invalid("Max connections cannot be 0");
        }
        if self.store.lock_timeout.is_zero() {
            return invalid("Lock timeout cannot be zero");
        }
        if self.retry.max_attempts == 0 {
            return invalid("Retry max attempts cannot be 0");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid("Retry base delay cannot exceed max delay");
        }
        if let OverdraftPolicy::Limit(limit) = self.overdraft {
            if limit < 0 {
                return invalid("Overdraft limit cannot be negative");
            }
        }

        Ok(())
    }
}
