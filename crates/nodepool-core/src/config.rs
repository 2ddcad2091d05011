//! nodepool.toml configuration parser.
//!
//! These are the raw, on-disk shapes. Every field except the node list is
//! optional; defaults and validation live with the consumer
//! (`nodepool::config::ClientSettings`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodepoolConfig {
    pub pool: Option<PoolSection>,
    pub tend: Option<TendSection>,
    pub dial: Option<DialSection>,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    pub capacity: Option<usize>,
    pub hard_limit: Option<bool>,
    pub idle_timeout: Option<String>,
    pub exhaustion_grace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TendSection {
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DialSection {
    pub timeout: Option<String>,
    pub recv_timeout: Option<String>,
    pub tls: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEntry {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodepoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config pointing at a single local node.
    pub fn scaffold(address: &str) -> Self {
        NodepoolConfig {
            pool: Some(PoolSection {
                capacity: Some(256),
                hard_limit: Some(true),
                idle_timeout: Some("55s".to_string()),
                exhaustion_grace: Some("1ms".to_string()),
            }),
            tend: Some(TendSection {
                interval: Some("1s".to_string()),
            }),
            dial: Some(DialSection {
                timeout: Some("1s".to_string()),
                recv_timeout: Some("30s".to_string()),
                tls: Some(false),
            }),
            nodes: vec![NodeEntry {
                name: "node-1".to_string(),
                address: address.to_string(),
            }],
        }
    }
}
