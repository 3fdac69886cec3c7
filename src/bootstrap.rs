// zamail/src/bootstrap.rs
use alloy::primitives::{address, Address};
use anyhow::Context;
use log::{info, warn};
use std::{collections::HashMap, path::PathBuf, str::FromStr, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::board::MessageBoardCoordinator;
use crate::contract::MockMessageBoard;
use crate::fhe::{FheInstanceManager, MockCoprocessor, MockFheBackend, NetworkTable, LOCAL_DEV_CHAIN_ID};
use crate::signature::{
    DecryptionSignatureStore, InMemorySignatureStorage, JsonFileSignatureStorage, SignatureStorage,
};
use crate::wallet::{LocalWallet, WalletSessionProvider, ANVIL_DEV_KEYS};

/// First contract address of the default Anvil deployer.
pub const DEFAULT_BOARD_ADDRESS: Address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Private keys of the local wallet accounts; the first one is selected
    pub private_keys: Vec<String>,
    /// Chain the wallet starts on
    pub chain_id: u64,
    /// Offline chains: chain id → RPC url
    pub mock_chains: HashMap<u64, String>,
    /// Message board address per chain id
    pub deployments: HashMap<u64, Address>,
    /// Validity window handed out by the offline FHE backend
    pub decryption_validity_days: u64,
    /// Where decryption signatures are persisted; in memory when unset
    pub signature_file: Option<PathBuf>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            private_keys: ANVIL_DEV_KEYS.iter().map(|k| k.to_string()).collect(),
            chain_id: LOCAL_DEV_CHAIN_ID,
            mock_chains: NetworkTable::default().mock_chains().clone(),
            deployments: HashMap::from([(LOCAL_DEV_CHAIN_ID, DEFAULT_BOARD_ADDRESS)]),
            decryption_validity_days: 1,
            signature_file: None,
        }
    }
}

pub struct Bootstrap {
    pub wallet: Arc<LocalWallet>,
    pub sessions: Arc<WalletSessionProvider>,
    pub fhe: Arc<FheInstanceManager>,
    pub board: Arc<MockMessageBoard>,
    pub coordinator: MessageBoardCoordinator,
    /// Stops the FHE manager's session watcher
    pub cancel: CancellationToken,
    /// Session watchers of the FHE manager and the coordinator; joined on shutdown
    pub watchers: Vec<JoinHandle<()>>,
}

impl Bootstrap {
    /// Stop the session watchers and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.coordinator.shutdown();
        self.sessions.shutdown();
        for watcher in self.watchers {
            if let Err(e) = watcher.await {
                warn!("Session watcher ended abnormally: {e}");
            }
        }
        info!("Shut down");
    }
}

/// Wire the local wallet, the offline FHE backend and contract, and the
/// coordinator, and bind them to the wallet session.
pub fn bootstrap(cfg: BootstrapConfig) -> anyhow::Result<Bootstrap> {
    let coprocessor = Arc::new(MockCoprocessor::new());
    let backend = Arc::new(MockFheBackend::new(
        coprocessor.clone(),
        cfg.decryption_validity_days,
    ));
    let networks = NetworkTable::new(cfg.mock_chains.clone());

    let board = Arc::new(
        cfg.deployments
            .iter()
            .fold(MockMessageBoard::new(coprocessor), |board, (chain_id, address)| {
                board.with_deployment(*chain_id, *address)
            }),
    );

    let wallet = Arc::new(
        LocalWallet::from_private_keys(&cfg.private_keys, cfg.chain_id)
            .context("Failed to create local wallet")?
            .with_rpc_urls(cfg.mock_chains.clone()),
    );
    let sessions = Arc::new(WalletSessionProvider::new(wallet.clone()));

    let storage: Arc<dyn SignatureStorage> = match &cfg.signature_file {
        Some(path) => {
            info!("Persisting decryption signatures to {}", path.display());
            Arc::new(JsonFileSignatureStorage::new(path.clone()))
        }
        None => Arc::new(InMemorySignatureStorage::new()),
    };
    let signatures = DecryptionSignatureStore::new(storage);

    let fhe = FheInstanceManager::new(backend, networks);
    let coordinator =
        MessageBoardCoordinator::new(sessions.clone(), fhe.clone(), signatures, board.clone());

    let cancel = CancellationToken::new();
    let watchers = vec![
        fhe.bind(sessions.subscribe(), true, cancel.clone()),
        coordinator.bind(),
    ];

    Ok(Bootstrap {
        wallet,
        sessions,
        fhe,
        board,
        coordinator,
        cancel,
        watchers,
    })
}

/// Build the configuration from the environment, falling back to the local
/// dev defaults for every unset variable:
/// - ZAMAIL_PRIVATE_KEYS (comma-separated hex keys)
/// - ZAMAIL_CHAIN_ID
/// - ZAMAIL_MOCK_CHAINS (`id=url,...`)
/// - ZAMAIL_DEPLOYMENTS (`id=address,...`)
/// - ZAMAIL_DECRYPTION_VALIDITY_DAYS
/// - ZAMAIL_SIGNATURE_FILE
pub fn bootstrap_config_from_env() -> anyhow::Result<BootstrapConfig> {
    let mut cfg = BootstrapConfig::default();

    if let Ok(keys) = std::env::var("ZAMAIL_PRIVATE_KEYS") {
        cfg.private_keys = split_list(&keys).map(str::to_string).collect();
    }
    if let Ok(chain_id) = std::env::var("ZAMAIL_CHAIN_ID") {
        cfg.chain_id = chain_id
            .trim()
            .parse()
            .context(format!("Failed to parse ZAMAIL_CHAIN_ID: {chain_id}"))?;
    }
    if let Ok(chains) = std::env::var("ZAMAIL_MOCK_CHAINS") {
        cfg.mock_chains = parse_chain_table(&chains, |url| Ok(url.to_string()))
            .context("Failed to parse ZAMAIL_MOCK_CHAINS")?;
    }
    if let Ok(deployments) = std::env::var("ZAMAIL_DEPLOYMENTS") {
        cfg.deployments = parse_chain_table(&deployments, |address| {
            Address::from_str(address).context(format!("Failed to parse address: {address}"))
        })
        .context("Failed to parse ZAMAIL_DEPLOYMENTS")?;
    }
    if let Ok(days) = std::env::var("ZAMAIL_DECRYPTION_VALIDITY_DAYS") {
        cfg.decryption_validity_days = days
            .trim()
            .parse()
            .context(format!("Failed to parse ZAMAIL_DECRYPTION_VALIDITY_DAYS: {days}"))?;
    }
    if let Ok(path) = std::env::var("ZAMAIL_SIGNATURE_FILE") {
        cfg.signature_file = Some(PathBuf::from(path));
    }

    Ok(cfg)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `id=value,id=value` entries.
pub fn parse_chain_table<T>(
    value: &str,
    parse: impl Fn(&str) -> anyhow::Result<T>,
) -> anyhow::Result<HashMap<u64, T>> {
    split_list(value)
        .map(|entry| {
            let (chain_id, value) = entry
                .split_once('=')
                .context(format!("Expected `chain_id=value`, got: {entry}"))?;
            let chain_id = chain_id
                .trim()
                .parse::<u64>()
                .context(format!("Failed to parse chain id: {chain_id}"))?;
            Ok((chain_id, parse(value.trim())?))
        })
        .collect()
}
