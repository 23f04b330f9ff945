//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Scheduler loop configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Master election configuration
    #[serde(default)]
    pub leader: LeaderConfig,

    /// Recipient dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; when absent the in-memory repository is used
    /// (dev mode and tests).
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redis connection URL for broker recipients
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Poll interval between due-job queries
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Maximum jobs fetched per tick (back-pressure against large backlogs)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Maximum concurrent dispatches per replica
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderConfig {
    /// Interval between heartbeat renewals / claim attempts
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Age beyond which a lease heartbeat is considered stale. Must be a
    /// multiple of the heartbeat interval to tolerate clock skew and pauses.
    #[serde(with = "humantime_serde", default = "default_staleness_threshold")]
    pub staleness_threshold: Duration,

    /// Instance name reported in the lease record (defaults to hostname)
    #[serde(default)]
    pub instance_name: Option<String>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            staleness_threshold: default_staleness_threshold(),
            instance_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Default deadline for a single dispatch attempt when the job does not
    /// declare its own execution timeout
    #[serde(with = "humantime_serde", default = "default_execution_timeout")]
    pub default_execution_timeout: Duration,

    /// Sink URL for serverless deployments; resolved from `K_SINK` when unset
    #[serde(default)]
    pub sink_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_execution_timeout: default_execution_timeout(),
            sink_url: None,
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8580 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_broker_url() -> String { "redis://localhost:6379".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_batch_size() -> u32 { 100 }
fn default_max_concurrent_dispatches() -> usize { 32 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(3) }
fn default_staleness_threshold() -> Duration { Duration::from_secs(10) }
fn default_execution_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PULSE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PULSE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: Default::default(),
            database: Default::default(),
            broker: Default::default(),
            observability: Default::default(),
            scheduler: Default::default(),
            leader: Default::default(),
            dispatch: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8580);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(1));
        assert!(config.leader.staleness_threshold > config.leader.heartbeat_interval);
        assert!(config.database.url.is_none());
    }
}
