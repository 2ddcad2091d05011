//! ClientSettings — typed settings resolved from `nodepool.toml`.
//!
//! Takes the raw [`nodepool_core::NodepoolConfig`] (every field optional,
//! durations as strings), fills in defaults, and validates the result.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use nodepool_core::config::{ConfigError, NodepoolConfig};
use nodepool_core::parse_duration;
use serde::Serialize;

use crate::pool::{PoolMode, PoolPolicy};

/// A node to connect to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSettings {
    pub name: String,
    pub address: String,
}

/// Fully resolved client settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSettings {
    /// Pool policy shared by every node.
    pub policy: PoolPolicy,
    /// Period between idle reaper passes.
    pub tend_interval: Duration,
    /// Read timeout set on dialed sockets.
    pub recv_timeout: Duration,
    /// Wrap connections in TLS.
    pub tls: bool,
    pub nodes: Vec<NodeSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            policy: PoolPolicy::default(),
            tend_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(30),
            tls: false,
            nodes: Vec::new(),
        }
    }
}

impl ClientSettings {
    /// Load and resolve a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_config(&NodepoolConfig::from_file(path)?)
    }

    /// Resolve a parsed config, applying defaults and validating.
    pub fn from_config(config: &NodepoolConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pool = config.pool.clone().unwrap_or_default();
        let tend = config.tend.clone().unwrap_or_default();
        let dial = config.dial.clone().unwrap_or_default();

        let policy = PoolPolicy {
            capacity: pool.capacity.unwrap_or(defaults.policy.capacity),
            mode: match pool.hard_limit {
                Some(false) => PoolMode::SoftCache,
                _ => PoolMode::HardLimit,
            },
            idle_timeout: duration_or("pool.idle_timeout", &pool.idle_timeout, defaults.policy.idle_timeout)?,
            exhaustion_grace: duration_or(
                "pool.exhaustion_grace",
                &pool.exhaustion_grace,
                defaults.policy.exhaustion_grace,
            )?,
            dial_timeout: duration_or("dial.timeout", &dial.timeout, defaults.policy.dial_timeout)?,
        };

        let settings = Self {
            policy,
            tend_interval: duration_or("tend.interval", &tend.interval, defaults.tend_interval)?,
            recv_timeout: duration_or("dial.recv_timeout", &dial.recv_timeout, defaults.recv_timeout)?,
            tls: dial.tls.unwrap_or(defaults.tls),
            nodes: config
                .nodes
                .iter()
                .map(|n| NodeSettings {
                    name: n.name.trim().to_string(),
                    address: n.address.trim().to_string(),
                })
                .collect(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.capacity == 0 {
            return invalid("pool.capacity must be greater than zero");
        }
        if self.policy.idle_timeout.is_zero() {
            return invalid("pool.idle_timeout must be greater than zero");
        }
        if self.policy.dial_timeout.is_zero() {
            return invalid("dial.timeout must be greater than zero");
        }
        if self.tend_interval.is_zero() {
            return invalid("tend.interval must be greater than zero");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return invalid("node name must not be empty");
            }
            if node.address.is_empty() {
                return invalid(&format!("node {} has an empty address", node.name));
            }
            if !seen.insert(node.name.as_str()) {
                return invalid(&format!("duplicate node name: {}", node.name));
            }
        }
        Ok(())
    }
}

fn duration_or(field: &str, value: &Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .ok_or_else(|| ConfigError::Invalid(format!("{field}: cannot parse duration '{raw}'"))),
    }
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg.to_string()))
}
