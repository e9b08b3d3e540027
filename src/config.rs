//! WolfHA Configuration
//!
//! This module provides the configuration structures for a failover
//! connection. Configuration is read once and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::host::{HostAddress, Topology};

/// Main WolfHA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Arrangement of the candidate hosts
    #[serde(default = "default_topology")]
    pub topology: Topology,

    /// Ordered candidate hosts (`host[:port][?type=master|slave]`)
    pub hosts: Vec<String>,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Default database (optional)
    #[serde(default)]
    pub database: Option<String>,

    /// Failover tuning
    #[serde(default)]
    pub failover: FailoverSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Election and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSettings {
    /// Full passes over the host list before an election gives up
    #[serde(default = "default_retries_all_down")]
    pub retries_all_down: u32,

    /// Seconds on a replica fallback before the master is probed again
    #[serde(default = "default_seconds_before_retry_master")]
    pub seconds_before_retry_master: u64,

    /// Queries on a replica fallback before the master is probed again
    #[serde(default = "default_queries_before_retry_master")]
    pub queries_before_retry_master: u64,

    /// How long a failed host stays blacklisted, in milliseconds
    #[serde(default = "default_blacklist_timeout_ms")]
    pub blacklist_timeout_ms: u64,

    /// Reject writes outright while running on a replica fallback
    #[serde(default)]
    pub fail_on_read_only: bool,

    /// Re-run an election before the next operation once a connection was left closed
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Bound on connect and role probe, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Host selection policy for multi-master clusters
    #[serde(default)]
    pub load_balance: LoadBalancePolicy,
}

/// Order in which equally valid masters are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancePolicy {
    /// Configured order
    #[default]
    Sequential,
    /// Shuffled on every election
    Random,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_topology() -> Topology {
    Topology::Standalone
}

fn default_retries_all_down() -> u32 {
    120
}

fn default_seconds_before_retry_master() -> u64 {
    30
}

fn default_queries_before_retry_master() -> u64 {
    50
}

fn default_blacklist_timeout_ms() -> u64 {
    50_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            retries_all_down: default_retries_all_down(),
            seconds_before_retry_master: default_seconds_before_retry_master(),
            queries_before_retry_master: default_queries_before_retry_master(),
            blacklist_timeout_ms: default_blacklist_timeout_ms(),
            fail_on_read_only: false,
            auto_reconnect: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            load_balance: LoadBalancePolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl FailoverConfig {
    /// Minimal configuration for a host list, everything else defaulted
    pub fn new(topology: Topology, hosts: Vec<String>) -> Self {
        Self {
            topology,
            hosts,
            user: String::new(),
            password: String::new(),
            database: None,
            failover: FailoverSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FailoverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.hosts.is_empty() {
            return Err(crate::Error::Config("hosts cannot be empty".into()));
        }

        if self.topology == Topology::Standalone && self.hosts.len() != 1 {
            return Err(crate::Error::Config(format!(
                "standalone topology takes exactly one host, got {}",
                self.hosts.len()
            )));
        }

        if self.failover.retries_all_down == 0 {
            return Err(crate::Error::Config(
                "failover.retries_all_down must be at least 1".into(),
            ));
        }

        if self.failover.connect_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "failover.connect_timeout_ms must be greater than 0".into(),
            ));
        }

        self.host_addresses()?;
        Ok(())
    }

    /// Parsed candidate hosts in election order
    pub fn host_addresses(&self) -> crate::Result<Vec<HostAddress>> {
        HostAddress::parse_list(&self.hosts, self.topology)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.failover.connect_timeout_ms)
    }

    /// Get blacklist timeout as Duration
    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_millis(self.failover.blacklist_timeout_ms)
    }

    /// Get master retry grace period as Duration
    pub fn retry_master_after(&self) -> Duration {
        Duration::from_secs(self.failover.seconds_before_retry_master)
    }
}

/// Sample configuration written by `wolfha init`
pub const SAMPLE_CONFIG: &str = r#"# WolfHA configuration
topology = "replication"
hosts = ["db1:3306?type=master", "db2:3306", "db3:3306"]
user = "app"
password = "changeme"
database = "app"

[failover]
retries_all_down = 120
seconds_before_retry_master = 30
queries_before_retry_master = 50
blacklist_timeout_ms = 50000
fail_on_read_only = false
auto_reconnect = false
connect_timeout_ms = 3000
load_balance = "sequential"

[logging]
level = "info"
format = "pretty"
# file = "/var/log/wolfha/wolfha.log"
"#;
