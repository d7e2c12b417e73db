//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audit::redaction::DEFAULT_SENSITIVE_FIELDS;
use crate::error::{AuditError, AuditResult};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown grace period in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/docket";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Audit Configuration Constants
// ============================================================================

pub const DEFAULT_AUDIT_API_PREFIX: &str = "/api";
pub const DEFAULT_AUDIT_MAX_BODY_BYTES: usize = 10 * 1024;
pub const MIN_AUDIT_MAX_BODY_BYTES: usize = 256;
pub const MAX_AUDIT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Roughly seven years.
pub const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 2555;
pub const MIN_AUDIT_RETENTION_DAYS: u32 = 30;
pub const MAX_AUDIT_RETENTION_DAYS: u32 = 3650;
pub const DEFAULT_AUDIT_RETENTION_SWEEP_SECS: u64 = 3600;
pub const DEFAULT_AUDIT_RETENTION_BATCH: i64 = 1000;

pub const DEFAULT_AUDIT_ALERT_THRESHOLD: u32 = 10;
pub const DEFAULT_AUDIT_ALERT_WINDOW_SECS: u64 = 300;

pub const DEFAULT_AUDIT_DB_TIMEOUT_MS: u64 = 5000;
pub const MIN_AUDIT_DB_TIMEOUT_MS: u64 = 100;
pub const MAX_AUDIT_DB_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_AUDIT_WORKER_CONCURRENCY: usize = 4;
pub const MAX_AUDIT_WORKER_CONCURRENCY: usize = 64;
pub const DEFAULT_AUDIT_QUEUE_POLL_MS: u64 = 500;
pub const DEFAULT_AUDIT_QUEUE_MAX_ATTEMPTS: u32 = 3;
pub const MAX_AUDIT_QUEUE_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_AUDIT_QUEUE_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_AUDIT_QUEUE_BACKOFF_FACTOR: u32 = 2;

pub const DEFAULT_AUDIT_BREAKER_ERROR_PERCENT: u8 = 50;
pub const DEFAULT_AUDIT_BREAKER_RESET_SECS: u64 = 30;
pub const DEFAULT_AUDIT_BREAKER_WINDOW_SECS: u64 = 10;
pub const DEFAULT_AUDIT_BREAKER_BUCKETS: u32 = 10;
pub const DEFAULT_AUDIT_BREAKER_VOLUME: u32 = 5;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub audit: AuditConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Audit subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Paths under this prefix are always audited
    pub api_prefix: String,
    /// Upper bound on the serialized size of a stored body
    pub max_body_bytes: usize,
    pub retention_days: u32,
    pub retention_sweep_interval_secs: u64,
    pub retention_batch_size: i64,
    /// Direct-write failures within `alert_window_secs` that raise an alert
    pub alert_threshold: u32,
    pub alert_window_secs: u64,
    /// Per-attempt storage timeout for circuit-breaker calls
    pub db_timeout_ms: u64,
    pub sensitive_fields: Vec<String>,
    /// Refuse to boot without the durable queue
    pub require_queue: bool,
    pub queue_enabled: bool,
    pub worker_concurrency: usize,
    pub queue_poll_interval_ms: u64,
    pub queue_max_attempts: u32,
    pub queue_backoff_ms: u64,
    pub queue_backoff_factor: u32,
    pub breaker_error_percent: u8,
    pub breaker_reset_secs: u64,
    pub breaker_window_secs: u64,
    pub breaker_buckets: u32,
    pub breaker_volume_threshold: u32,
    /// How long shutdown waits for in-flight queue jobs
    pub shutdown_grace_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_AUDIT_API_PREFIX.to_string(),
            max_body_bytes: DEFAULT_AUDIT_MAX_BODY_BYTES,
            retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            retention_sweep_interval_secs: DEFAULT_AUDIT_RETENTION_SWEEP_SECS,
            retention_batch_size: DEFAULT_AUDIT_RETENTION_BATCH,
            alert_threshold: DEFAULT_AUDIT_ALERT_THRESHOLD,
            alert_window_secs: DEFAULT_AUDIT_ALERT_WINDOW_SECS,
            db_timeout_ms: DEFAULT_AUDIT_DB_TIMEOUT_MS,
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS.iter().map(|f| f.to_string()).collect(),
            require_queue: false,
            queue_enabled: true,
            worker_concurrency: DEFAULT_AUDIT_WORKER_CONCURRENCY,
            queue_poll_interval_ms: DEFAULT_AUDIT_QUEUE_POLL_MS,
            queue_max_attempts: DEFAULT_AUDIT_QUEUE_MAX_ATTEMPTS,
            queue_backoff_ms: DEFAULT_AUDIT_QUEUE_BACKOFF_MS,
            queue_backoff_factor: DEFAULT_AUDIT_QUEUE_BACKOFF_FACTOR,
            breaker_error_percent: DEFAULT_AUDIT_BREAKER_ERROR_PERCENT,
            breaker_reset_secs: DEFAULT_AUDIT_BREAKER_RESET_SECS,
            breaker_window_secs: DEFAULT_AUDIT_BREAKER_WINDOW_SECS,
            breaker_buckets: DEFAULT_AUDIT_BREAKER_BUCKETS,
            breaker_volume_threshold: DEFAULT_AUDIT_BREAKER_VOLUME,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> AuditResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AuditError::Configuration(format!("{key} has an invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn check_range<T>(key: &str, value: T, min: T, max: T) -> AuditResult<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(AuditError::Configuration(format!(
            "{key} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl AuditConfig {
    /// Read `AUDIT_*` variables over the defaults
    ///
    /// Malformed values are errors, not silently replaced by defaults.
    pub fn from_env() -> AuditResult<Self> {
        let defaults = Self::default();

        let sensitive_fields = match std::env::var("AUDIT_SENSITIVE_FIELDS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.sensitive_fields.clone(),
        };

        let config = Self {
            api_prefix: std::env::var("AUDIT_API_PREFIX").unwrap_or(defaults.api_prefix),
            max_body_bytes: env_or("AUDIT_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            retention_days: env_or("AUDIT_RETENTION_DAYS", defaults.retention_days)?,
            retention_sweep_interval_secs: env_or(
                "AUDIT_RETENTION_SWEEP_SECS",
                defaults.retention_sweep_interval_secs,
            )?,
            retention_batch_size: env_or("AUDIT_RETENTION_BATCH", defaults.retention_batch_size)?,
            alert_threshold: env_or("AUDIT_ALERT_THRESHOLD", defaults.alert_threshold)?,
            alert_window_secs: env_or("AUDIT_ALERT_WINDOW_SECS", defaults.alert_window_secs)?,
            db_timeout_ms: env_or("AUDIT_DB_TIMEOUT_MS", defaults.db_timeout_ms)?,
            sensitive_fields,
            require_queue: env_or("AUDIT_REQUIRE_QUEUE", defaults.require_queue)?,
            queue_enabled: env_or("AUDIT_QUEUE_ENABLED", defaults.queue_enabled)?,
            worker_concurrency: env_or("AUDIT_WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            queue_poll_interval_ms: env_or(
                "AUDIT_QUEUE_POLL_MS",
                defaults.queue_poll_interval_ms,
            )?,
            queue_max_attempts: env_or("AUDIT_QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?,
            queue_backoff_ms: env_or("AUDIT_QUEUE_BACKOFF_MS", defaults.queue_backoff_ms)?,
            queue_backoff_factor: defaults.queue_backoff_factor,
            breaker_error_percent: env_or(
                "AUDIT_BREAKER_ERROR_PERCENT",
                defaults.breaker_error_percent,
            )?,
            breaker_reset_secs: env_or("AUDIT_BREAKER_RESET_SECS", defaults.breaker_reset_secs)?,
            breaker_window_secs: env_or(
                "AUDIT_BREAKER_WINDOW_SECS",
                defaults.breaker_window_secs,
            )?,
            breaker_buckets: defaults.breaker_buckets,
            breaker_volume_threshold: env_or(
                "AUDIT_BREAKER_VOLUME",
                defaults.breaker_volume_threshold,
            )?,
            shutdown_grace_secs: env_or("AUDIT_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> AuditResult<()> {
        if !self.api_prefix.starts_with('/') {
            return Err(AuditError::Configuration(format!(
                "AUDIT_API_PREFIX must start with '/', got '{}'",
                self.api_prefix
            )));
        }
        check_range(
            "AUDIT_MAX_BODY_BYTES",
            self.max_body_bytes,
            MIN_AUDIT_MAX_BODY_BYTES,
            MAX_AUDIT_MAX_BODY_BYTES,
        )?;
        check_range(
            "AUDIT_RETENTION_DAYS",
            self.retention_days,
            MIN_AUDIT_RETENTION_DAYS,
            MAX_AUDIT_RETENTION_DAYS,
        )?;
        check_range(
            "AUDIT_DB_TIMEOUT_MS",
            self.db_timeout_ms,
            MIN_AUDIT_DB_TIMEOUT_MS,
            MAX_AUDIT_DB_TIMEOUT_MS,
        )?;
        check_range(
            "AUDIT_WORKER_CONCURRENCY",
            self.worker_concurrency,
            1,
            MAX_AUDIT_WORKER_CONCURRENCY,
        )?;
        check_range(
            "AUDIT_QUEUE_MAX_ATTEMPTS",
            self.queue_max_attempts,
            1,
            MAX_AUDIT_QUEUE_MAX_ATTEMPTS,
        )?;
        check_range("AUDIT_BREAKER_ERROR_PERCENT", self.breaker_error_percent, 1, 100)?;

        let at_least_one = [
            ("AUDIT_ALERT_THRESHOLD", u64::from(self.alert_threshold)),
            ("AUDIT_ALERT_WINDOW_SECS", self.alert_window_secs),
            ("AUDIT_QUEUE_BACKOFF_MS", self.queue_backoff_ms),
            ("AUDIT_QUEUE_POLL_MS", self.queue_poll_interval_ms),
            ("AUDIT_BREAKER_RESET_SECS", self.breaker_reset_secs),
            ("AUDIT_BREAKER_WINDOW_SECS", self.breaker_window_secs),
            ("AUDIT_BREAKER_VOLUME", u64::from(self.breaker_volume_threshold)),
            ("AUDIT_RETENTION_SWEEP_SECS", self.retention_sweep_interval_secs),
            ("breaker_buckets", u64::from(self.breaker_buckets)),
            ("queue_backoff_factor", u64::from(self.queue_backoff_factor)),
        ];
        for (key, value) in at_least_one {
            if value == 0 {
                return Err(AuditError::Configuration(format!("{key} must be at least 1")));
            }
        }

        if self.retention_batch_size < 1 {
            return Err(AuditError::Configuration(
                "AUDIT_RETENTION_BATCH must be at least 1".to_string(),
            ));
        }

        if self.sensitive_fields.is_empty() {
            return Err(AuditError::Configuration(
                "AUDIT_SENSITIVE_FIELDS must name at least one field".to_string(),
            ));
        }

        if self.require_queue && !self.queue_enabled {
            return Err(AuditError::Configuration(
                "AUDIT_REQUIRE_QUEUE is set but AUDIT_QUEUE_ENABLED is false".to_string(),
            ));
        }

        Ok(())
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }

    pub fn alert_window(&self) -> Duration {
        Duration::from_secs(self.alert_window_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("DOCKET_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: std::env::var("DOCKET_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: std::env::var("DOCKET_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: std::env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                idle_timeout_secs: std::env::var("DATABASE_IDLE_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: std::env::var("CORS_ALLOW_CREDENTIALS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(true),
            },
            audit: AuditConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        self.audit.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            audit: AuditConfig::default(),
        }
    }
}
