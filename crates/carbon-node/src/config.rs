//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use carbon_core::address::Network;
use carbon_core::constants::DEFAULT_P2P_PORT;

/// Configuration for a full node. Everything is constructor-injected; there
/// is no process-global config handle.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    /// Data directory for the RocksDB store. `None` keeps everything in
    /// memory (tests, throwaway nodes).
    pub data_dir: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    /// Peers to dial on startup.
    pub connect: Vec<SocketAddr>,
    /// Worker threads for mining jobs.
    pub miner_threads: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            data_dir: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            connect: Vec::new(),
            miner_threads: 1,
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from JSON, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.data_dir.is_none());
        assert_eq!(config.listen_addr.port(), DEFAULT_P2P_PORT);
        assert!(config.connect.is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = NodeConfig::from_json(r#"{"network":"Regtest"}"#).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.listen_addr.port(), DEFAULT_P2P_PORT);
    }

    #[test]
    fn full_json_round_trip() {
        let config = NodeConfig {
            network: Network::Testnet,
            data_dir: Some(PathBuf::from("/tmp/carbon")),
            listen_addr: "127.0.0.1:4000".parse().unwrap(),
            connect: vec!["10.0.0.1:28333".parse().unwrap()],
            miner_threads: 4,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back = NodeConfig::from_json(&json).unwrap();
        assert_eq!(back.network, config.network);
        assert_eq!(back.connect, config.connect);
        assert_eq!(back.miner_threads, 4);
    }
}
