//! Node configuration, loaded from JSON.  Unknown keys are rejected so a
//! typo'd option can never be silently ignored.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("delegate_id {0} out of range")]
    DelegateIdOutOfRange(u8),
}

/// Static index → address mapping for one delegate.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DelegateAddr {
    pub id: u8,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,
    #[serde(default)]
    pub enable_control: bool,
}

fn default_rpc_host() -> String {
    "127.0.0.1".into()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            enable_control: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct P2pConfig {
    #[serde(default)]
    pub argv: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's committee index.
    pub delegate_id: u8,
    /// Peers of the current committee.
    pub delegates: Vec<DelegateAddr>,
    /// Every known delegate, across epochs.
    #[serde(default)]
    pub all_delegates: Vec<DelegateAddr>,

    pub peer_port: u16,
    pub json_port: u16,
    pub bin_port: u16,

    #[serde(default = "default_true")]
    pub heartbeat: bool,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_work_threads")]
    pub work_threads: usize,
    /// Knob for the external LMDB engine.
    #[serde(default = "default_lmdb_max_dbs")]
    pub lmdb_max_dbs: u32,
    #[serde(default = "default_true")]
    pub enable_epoch_transition: bool,

    #[serde(default)]
    pub rpc_enable: bool,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub websocket: Option<WebsocketConfig>,

    #[serde(default = "default_bootstrap_connections")]
    pub bootstrap_connections: usize,
    #[serde(default = "default_bootstrap_connections_max")]
    pub bootstrap_connections_max: usize,

    #[serde(default)]
    pub p2p: P2pConfig,
}

fn default_true() -> bool {
    true
}

fn default_io_threads() -> usize {
    4
}

fn default_work_threads() -> usize {
    4
}

fn default_lmdb_max_dbs() -> u32 {
    128
}

fn default_bootstrap_connections() -> usize {
    4
}

fn default_bootstrap_connections_max() -> usize {
    16
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        if config.delegate_id as usize >= 32 {
            return Err(ConfigError::DelegateIdOutOfRange(config.delegate_id));
        }
        Ok(config)
    }

    /// The address of a peer delegate, if configured.
    pub fn delegate_ip(&self, id: u8) -> Option<IpAddr> {
        self.delegates
            .iter()
            .chain(self.all_delegates.iter())
            .find(|d| d.id == id)
            .map(|d| d.ip)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "delegate_id": 3,
        "delegates": [
            {"id": 0, "ip": "10.0.0.1"},
            {"id": 1, "ip": "10.0.0.2"}
        ],
        "peer_port": 60000,
        "json_port": 55000,
        "bin_port": 56000,
        "heartbeat": true,
        "io_threads": 8,
        "enable_epoch_transition": true,
        "rpc_enable": true,
        "rpc": {"host": "0.0.0.0"},
        "websocket": {"enabled": true, "port": 18000},
        "bootstrap_connections": 4,
        "p2p": {"argv": ["-port=60001"]}
    }"#;

    #[test]
    fn test_load_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.delegate_id, 3);
        assert_eq!(config.delegates.len(), 2);
        assert_eq!(config.delegate_ip(1).unwrap().to_string(), "10.0.0.2");
        assert!(config.websocket.as_ref().unwrap().enabled);
        // defaults fill unspecified knobs
        assert_eq!(config.work_threads, 4);
        assert_eq!(config.lmdb_max_dbs, 128);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let raw = SAMPLE.replace("\"heartbeat\"", "\"heart_beat\"");
        assert!(matches!(Config::parse(&raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_delegate_id_range() {
        let raw = SAMPLE.replace("\"delegate_id\": 3", "\"delegate_id\": 32");
        assert!(matches!(
            Config::parse(&raw),
            Err(ConfigError::DelegateIdOutOfRange(32))
        ));
    }
}
