//! Process configuration read from the environment (and `.env`).

use std::path::PathBuf;

use livegrid_sync::relay::{RelayConfig, DEFAULT_CHANNEL};
use livegrid_sync::server::ServerConfig;
use thiserror::Error;

const DEFAULT_NODE_BIND: &str = "127.0.0.1:9090";
const DEFAULT_RELAY_BIND: &str = "127.0.0.1:9400";
const DEFAULT_SEED_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("LIVEGRID_ROLE must be 'node' or 'relay', got '{0}'")]
    InvalidRole(String),
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

/// What this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A sync node serving clients
    Node,
    /// The relay broker shared by nodes
    Relay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub role: Role,
    pub bind_addr: String,
    pub relay_url: Option<String>,
    pub relay_channel: String,
    pub storage_path: Option<PathBuf>,
    pub node_id: Option<String>,
    /// Rows to seed into an empty store at startup (0 = never)
    pub seed_count: u64,
    pub seed_batch: usize,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let role = match get("LIVEGRID_ROLE").as_deref().map(str::trim) {
            None | Some("node") => Role::Node,
            Some("relay") => Role::Relay,
            Some(other) => return Err(ConfigError::InvalidRole(other.to_string())),
        };

        let default_bind = match role {
            Role::Node => DEFAULT_NODE_BIND,
            Role::Relay => DEFAULT_RELAY_BIND,
        };

        Ok(Self {
            role,
            bind_addr: get("LIVEGRID_BIND").unwrap_or_else(|| default_bind.to_string()),
            relay_url: get("LIVEGRID_RELAY_URL"),
            relay_channel: get("LIVEGRID_RELAY_CHANNEL")
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            storage_path: get("LIVEGRID_STORAGE_PATH").map(PathBuf::from),
            node_id: get("SERVER_ID"),
            seed_count: parse_number("LIVEGRID_SEED_COUNT", get("LIVEGRID_SEED_COUNT"), 0)?,
            seed_batch: parse_number(
                "LIVEGRID_SEED_BATCH",
                get("LIVEGRID_SEED_BATCH"),
                DEFAULT_SEED_BATCH as u64,
            )? as usize,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            storage_path: self.storage_path.clone(),
            relay_url: self.relay_url.clone(),
            relay_channel: self.relay_channel.clone(),
            node_id: self.node_id.clone(),
            ..ServerConfig::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind_addr.clone(),
            ..RelayConfig::default()
        }
    }
}

fn parse_number(var: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}
