//! Integration tests for the FHE instance lifecycle.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use zamail::error::FheError;
use zamail::fhe::{
    FheBackend, FheInputs, FheInstance, FheInstanceManager, FheState, FheStatus, MockCoprocessor,
    MockFheBackend, NetworkConfig, NetworkTable,
};
use zamail::wallet::{LocalWallet, WalletSessionProvider};
use tokio_util::sync::CancellationToken;

const CHAIN_A: u64 = 31337;
const CHAIN_B: u64 = 1337;

// ─────────────────────────── Gated Backend ───────────────────────────

/// Holds every creation until the test opens the gate of its chain.
struct GatedBackend {
    inner: MockFheBackend,
    gates: Mutex<HashMap<u64, oneshot::Receiver<()>>>,
    calls: Arc<Mutex<Vec<u64>>>,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            inner: MockFheBackend::new(Arc::new(MockCoprocessor::new()), 1),
            gates: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn gate(&self, chain_id: u64) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(chain_id, rx);
        tx
    }

    fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FheBackend for GatedBackend {
    async fn create_instance(&self, config: NetworkConfig) -> Result<Arc<dyn FheInstance>, FheError> {
        let chain_id = config.chain_id();
        self.calls.lock().unwrap().push(chain_id);
        let gate = self.gates.lock().unwrap().remove(&chain_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.inner.create_instance(config).await
    }
}

/// Fails the first creation, succeeds afterwards.
struct FlakyBackend {
    inner: MockFheBackend,
    attempts: Mutex<usize>,
}

#[async_trait]
impl FheBackend for FlakyBackend {
    async fn create_instance(&self, config: NetworkConfig) -> Result<Arc<dyn FheInstance>, FheError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            *attempts
        };
        if attempt == 1 {
            return Err(FheError::InstanceCreation("relayer unreachable".to_string()));
        }
        self.inner.create_instance(config).await
    }
}

// ─────────────────────────── Helpers ───────────────────────────

fn two_chain_table() -> NetworkTable {
    NetworkTable::new(HashMap::from([
        (CHAIN_A, "http://localhost:8545".to_string()),
        (CHAIN_B, "http://localhost:8546".to_string()),
    ]))
}

fn inputs(chain_id: u64) -> FheInputs {
    FheInputs {
        provider: Some(format!("http://rpc/{chain_id}")),
        chain_id: Some(chain_id),
        enabled: true,
    }
}

async fn wait_for_state(
    manager: &FheInstanceManager,
    ready: impl FnMut(&FheState) -> bool,
) -> FheState {
    let mut states = manager.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(ready))
        .await
        .expect("Timed out waiting for FHE state")
        .expect("FHE state channel closed")
        .clone();
    state
}

// ─────────────────────────── Tests ───────────────────────────

#[tokio::test]
async fn test_chain_change_discards_pending_creation() {
    let backend = Arc::new(GatedBackend::new());
    let gate_a = backend.gate(CHAIN_A);
    let gate_b = backend.gate(CHAIN_B);
    let manager = FheInstanceManager::new(backend.clone(), two_chain_table());

    let state = manager.update(inputs(CHAIN_A));
    assert_eq!(state.status, FheStatus::Loading);
    assert_eq!(state.chain_id, Some(CHAIN_A));

    // Chain switches while A is still being created.
    let state = manager.update(inputs(CHAIN_B));
    assert_eq!(state.status, FheStatus::Loading);
    assert_eq!(state.chain_id, Some(CHAIN_B));

    let mut states = manager.subscribe();
    gate_a.send(()).expect("Failed to open gate A");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = manager.current();
    assert_eq!(state.status, FheStatus::Loading);
    assert_eq!(state.chain_id, Some(CHAIN_B));
    assert!(!states.has_changed().unwrap(), "stale creation must not publish");

    gate_b.send(()).expect("Failed to open gate B");
    let state = wait_for_state(&manager, |s| s.status == FheStatus::Ready).await;
    assert_eq!(state.chain_id, Some(CHAIN_B));
    assert_eq!(state.instance.expect("Ready without instance").chain_id(), CHAIN_B);
    assert_eq!(backend.calls(), vec![CHAIN_A, CHAIN_B]);
}

#[tokio::test]
async fn test_same_inputs_reuse_instance() {
    let backend = Arc::new(GatedBackend::new());
    let manager = FheInstanceManager::new(backend.clone(), two_chain_table());

    manager.update(inputs(CHAIN_A));
    let ready = wait_for_state(&manager, |s| s.is_ready()).await;

    let state = manager.update(inputs(CHAIN_A));
    assert!(state.is_ready());
    assert_eq!(state.generation, ready.generation);
    assert_eq!(backend.calls(), vec![CHAIN_A]);
}

#[tokio::test]
async fn test_incomplete_inputs_stay_idle() {
    let backend = Arc::new(GatedBackend::new());
    let manager = FheInstanceManager::new(backend.clone(), two_chain_table());

    let disabled = FheInputs {
        enabled: false,
        ..inputs(CHAIN_A)
    };
    assert_eq!(manager.update(disabled).status, FheStatus::Idle);

    let no_provider = FheInputs {
        provider: None,
        ..inputs(CHAIN_A)
    };
    assert_eq!(manager.update(no_provider).status, FheStatus::Idle);
    assert!(backend.calls().is_empty());

    // Disabling a ready instance tears it down.
    manager.update(inputs(CHAIN_A));
    wait_for_state(&manager, |s| s.is_ready()).await;
    let state = manager.update(FheInputs {
        enabled: false,
        ..inputs(CHAIN_A)
    });
    assert_eq!(state.status, FheStatus::Idle);
    assert!(state.instance.is_none());
}

#[tokio::test]
async fn test_unsupported_chain_surfaces_error() {
    let backend = Arc::new(GatedBackend::new());
    let manager = FheInstanceManager::new(backend.clone(), NetworkTable::default());

    manager.update(inputs(1));
    let state = wait_for_state(&manager, |s| s.status == FheStatus::Error).await;
    assert_eq!(state.chain_id, Some(1));
    assert!(state.instance.is_none());
    assert!(state.error.expect("Error without description").contains("Unsupported chain"));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_retry_after_failure() {
    let backend = Arc::new(FlakyBackend {
        inner: MockFheBackend::new(Arc::new(MockCoprocessor::new()), 1),
        attempts: Mutex::new(0),
    });
    let manager = FheInstanceManager::new(backend.clone(), two_chain_table());

    manager.update(inputs(CHAIN_A));
    let failed = wait_for_state(&manager, |s| s.status == FheStatus::Error).await;
    assert!(failed.error.unwrap().contains("relayer unreachable"));

    // No auto retry: the same inputs keep the error.
    assert_eq!(manager.update(inputs(CHAIN_A)).status, FheStatus::Error);

    manager.retry();
    let state = wait_for_state(&manager, |s| s.is_ready()).await;
    assert_eq!(state.chain_id, Some(CHAIN_A));
    assert_eq!(*backend.attempts.lock().unwrap(), 2);

    // Retry is a no-op once ready.
    assert_eq!(manager.retry().generation, state.generation);
}

#[tokio::test]
async fn test_bind_follows_wallet_chain() {
    let wallet = Arc::new(
        LocalWallet::dev(CHAIN_A)
            .expect("Failed to create wallet")
            .with_rpc_urls(two_chain_table().mock_chains().clone()),
    );
    let sessions = WalletSessionProvider::new(wallet.clone());
    let manager = FheInstanceManager::new(
        Arc::new(MockFheBackend::new(Arc::new(MockCoprocessor::new()), 1)),
        two_chain_table(),
    );
    let cancel = CancellationToken::new();
    manager.bind(sessions.subscribe(), true, cancel.clone());

    assert_eq!(manager.current().status, FheStatus::Idle);
    sessions.connect().await.expect("Failed to connect");
    let state = wait_for_state(&manager, |s| s.is_ready()).await;
    assert_eq!(state.chain_id, Some(CHAIN_A));

    wallet.switch_chain(CHAIN_B);
    let state = wait_for_state(&manager, |s| s.is_ready() && s.chain_id == Some(CHAIN_B)).await;
    assert_eq!(state.instance.unwrap().chain_id(), CHAIN_B);

    // No read-only provider for this chain: the instance cannot be built.
    wallet.switch_chain(11155111);
    let state = wait_for_state(&manager, |s| s.status == FheStatus::Idle).await;
    assert!(state.instance.is_none());

    cancel.cancel();
}
