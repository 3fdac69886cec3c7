use alloy::primitives::Address;
use std::collections::HashMap;

use crate::error::FheError;

/// Hardhat/Anvil local chain.
pub const LOCAL_DEV_CHAIN_ID: u64 = 31337;

/// Parameters of a live chain served through a decryption relayer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerNetwork {
    pub relayer_url: String,
    pub verifying_contract: Address,
    pub acl_contract: Address,
}

/// Configuration an FHE instance is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkConfig {
    /// Local/offline chain resolved from the static mock table.
    Mock { chain_id: u64, rpc_url: String },
    Relayer {
        chain_id: u64,
        rpc_url: Option<String>,
        network: RelayerNetwork,
    },
}

impl NetworkConfig {
    pub fn chain_id(&self) -> u64 {
        match self {
            NetworkConfig::Mock { chain_id, .. } | NetworkConfig::Relayer { chain_id, .. } => {
                *chain_id
            }
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, NetworkConfig::Mock { .. })
    }
}

/// Chain id → network parameters.
#[derive(Debug, Clone)]
pub struct NetworkTable {
    mock_chains: HashMap<u64, String>,
    relayers: HashMap<u64, RelayerNetwork>,
}

impl Default for NetworkTable {
    fn default() -> Self {
        Self::new(HashMap::from([(
            LOCAL_DEV_CHAIN_ID,
            "http://localhost:8545".to_string(),
        )]))
    }
}

impl NetworkTable {
    pub fn new(mock_chains: HashMap<u64, String>) -> Self {
        Self {
            mock_chains,
            relayers: HashMap::new(),
        }
    }

    pub fn with_relayer(mut self, chain_id: u64, network: RelayerNetwork) -> Self {
        self.relayers.insert(chain_id, network);
        self
    }

    pub fn mock_chains(&self) -> &HashMap<u64, String> {
        &self.mock_chains
    }

    pub fn is_mock(&self, chain_id: u64) -> bool {
        self.mock_chains.contains_key(&chain_id)
    }

    /// Mock chains win over relayer entries for the same id.
    pub fn resolve(&self, chain_id: u64, rpc_url: Option<&str>) -> Result<NetworkConfig, FheError> {
        if let Some(mock_url) = self.mock_chains.get(&chain_id) {
            return Ok(NetworkConfig::Mock {
                chain_id,
                rpc_url: rpc_url.unwrap_or(mock_url).to_string(),
            });
        }
        match self.relayers.get(&chain_id) {
            Some(network) => Ok(NetworkConfig::Relayer {
                chain_id,
                rpc_url: rpc_url.map(str::to_string),
                network: network.clone(),
            }),
            None => Err(FheError::UnsupportedChain(chain_id)),
        }
    }
}
