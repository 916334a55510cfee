use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::RuleTable;
use crate::store::{DEFAULT_CAPACITY, DEFAULT_TTL};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read from the command line or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "route-throttle", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level for this crate when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum number of counters kept in memory
    #[arg(long, env = "THROTTLE_STORE_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub store_capacity: usize,

    /// Seconds an idle counter is kept before it is dropped
    #[arg(long, env = "THROTTLE_STORE_TTL_SECS", default_value_t = DEFAULT_TTL.as_secs())]
    pub store_ttl_secs: u64,

    /// JSON rules file replacing the built-in policy table
    #[arg(long, env = "THROTTLE_RULES_FILE")]
    pub rules_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process arguments and environment.
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store_ttl_secs)
    }

    /// Rule table from `rules_file`, or the built-in defaults.
    pub fn rule_table(&self) -> ThrottlerResult<RuleTable> {
        match &self.rules_file {
            Some(path) => RuleTable::from_json_file(path),
            None => RuleTable::default_table(),
        }
    }

    pub fn validate(&self) -> ThrottlerResult<()> {
        if self.store_capacity == 0 {
            return Err(ThrottlerError::Configuration(
                "THROTTLE_STORE_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.store_ttl_secs == 0 {
            return Err(ThrottlerError::Configuration(
                "THROTTLE_STORE_TTL_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            store_capacity: DEFAULT_CAPACITY,
            store_ttl_secs: DEFAULT_TTL.as_secs(),
            rules_file: None,
        }
    }
}
