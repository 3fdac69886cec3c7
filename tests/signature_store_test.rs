//! Integration tests for decryption signature issuing and caching.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, Bytes},
    signers::{local::PrivateKeySigner, Signer},
    sol_types::{Eip712Domain, SolStruct},
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use zamail::error::{SignatureError, WalletError};
use zamail::fhe::{FheBackend, FheInstance, MockCoprocessor, MockFheBackend, NetworkConfig};
use zamail::signature::{
    DecryptionSignatureStore, InMemorySignatureStorage, JsonFileSignatureStorage, SignatureKey,
    SignatureStorage, UserDecryptRequestVerification, SECONDS_PER_DAY,
};
use zamail::wallet::{LocalWallet, SessionSigner, WalletBackend, ANVIL_DEV_KEYS};

const CHAIN: u64 = 31337;
const CONTRACT: Address = Address::new([0xb0; 20]);

// ─────────────────────────── Gated Signer ───────────────────────────

/// Signs only once the test releases it, counting prompts.
struct GatedSigner {
    signer: PrivateKeySigner,
    gate: Arc<Notify>,
    prompts: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionSigner for GatedSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_decryption_request(
        &self,
        request: &UserDecryptRequestVerification,
        domain: &Eip712Domain,
    ) -> Result<Bytes, WalletError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        let signature = self
            .signer
            .sign_hash(&request.eip712_signing_hash(domain))
            .await
            .map_err(|e| WalletError::SigningError(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&signature.as_bytes()))
    }
}

// ─────────────────────────── Helpers ───────────────────────────

async fn instance(validity_days: u64) -> Arc<dyn FheInstance> {
    MockFheBackend::new(Arc::new(MockCoprocessor::new()), validity_days)
        .create_instance(NetworkConfig::Mock {
            chain_id: CHAIN,
            rpc_url: "http://localhost:8545".to_string(),
        })
        .await
        .expect("Failed to create FHE instance")
}

async fn connected_wallet() -> LocalWallet {
    let wallet = LocalWallet::dev(CHAIN).expect("Failed to create wallet");
    wallet
        .request("eth_requestAccounts", json!([]))
        .await
        .expect("Failed to connect wallet");
    wallet
}

// ─────────────────────────── Tests ───────────────────────────

#[tokio::test]
async fn test_concurrent_requests_share_one_prompt() {
    let gate = Arc::new(Notify::new());
    let prompts = Arc::new(AtomicUsize::new(0));
    let signer: Arc<dyn SessionSigner> = Arc::new(GatedSigner {
        signer: ANVIL_DEV_KEYS[0].parse().expect("Failed to parse key"),
        gate: gate.clone(),
        prompts: prompts.clone(),
    });
    let store = DecryptionSignatureStore::new(Arc::new(InMemorySignatureStorage::new()));
    let instance = instance(1).await;

    let first = tokio::spawn({
        let (store, instance, signer) = (store.clone(), instance.clone(), signer.clone());
        async move { store.get_or_create(instance, signer, CONTRACT).await }
    });
    let second = tokio::spawn({
        let (store, instance, signer) = (store.clone(), instance.clone(), signer.clone());
        async move { store.get_or_create(instance, signer, CONTRACT).await }
    });

    // Both callers are waiting on the wallet before it answers.
    while prompts.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    let first = first.await.unwrap().expect("First caller failed");
    let second = second.await.unwrap().expect("Second caller failed");
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(first.signature, second.signature);
    assert_eq!(first.public_key, second.public_key);

    // Later calls are served from the cache.
    let third = store
        .get_or_create(instance, signer, CONTRACT)
        .await
        .expect("Cached call failed");
    assert_eq!(third.signature, first.signature);
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejection_caches_nothing() {
    let wallet = connected_wallet().await;
    let user = wallet.selected_address();
    let signer = wallet.signer(user).expect("Failed to get signer");
    let storage = Arc::new(InMemorySignatureStorage::new());
    let store = DecryptionSignatureStore::new(storage.clone());
    let instance = instance(1).await;

    wallet.set_sign_approval(false);
    let res = store
        .get_or_create(instance.clone(), signer.clone(), CONTRACT)
        .await;
    assert_eq!(res.unwrap_err(), SignatureError::Rejected);
    assert!(store.cached(&SignatureKey::new(CHAIN, CONTRACT, user)).is_none());
    assert!(storage.is_empty().await);

    // The user retries and accepts.
    wallet.set_sign_approval(true);
    let sig = store
        .get_or_create(instance, signer, CONTRACT)
        .await
        .expect("Failed to sign");
    assert_eq!(sig.user_address, user);
    assert_eq!(sig.contract_addresses, vec![CONTRACT]);
    assert_eq!(wallet.signature_prompts(), 2);
    assert!(store.cached(&SignatureKey::new(CHAIN, CONTRACT, user)).is_some());
    assert_eq!(storage.len().await, 1);
}

#[tokio::test]
async fn test_expired_signature_is_replaced() {
    let wallet = connected_wallet().await;
    let signer = wallet
        .signer(wallet.selected_address())
        .expect("Failed to get signer");
    let now = Arc::new(AtomicU64::new(1_700_000_000));
    let store = DecryptionSignatureStore::with_clock(Arc::new(InMemorySignatureStorage::new()), {
        let now = now.clone();
        Arc::new(move || now.load(Ordering::SeqCst))
    });
    let instance = instance(2).await;

    let first = store
        .get_or_create(instance.clone(), signer.clone(), CONTRACT)
        .await
        .expect("Failed to sign");
    assert_eq!(first.duration_days, 2);
    assert_eq!(first.start_timestamp, 1_700_000_000);

    // Still valid one second before expiry.
    now.store(first.expires_at() - 1, Ordering::SeqCst);
    store
        .get_or_create(instance.clone(), signer.clone(), CONTRACT)
        .await
        .expect("Failed to reuse signature");
    assert_eq!(wallet.signature_prompts(), 1);

    now.store(1_700_000_000 + 2 * SECONDS_PER_DAY, Ordering::SeqCst);
    let second = store
        .get_or_create(instance, signer, CONTRACT)
        .await
        .expect("Failed to re-sign");
    assert_eq!(wallet.signature_prompts(), 2);
    assert_ne!(first.public_key, second.public_key);
}

#[tokio::test]
async fn test_keys_are_per_contract_and_user() {
    let wallet = connected_wallet().await;
    let store = DecryptionSignatureStore::new(Arc::new(InMemorySignatureStorage::new()));
    let instance = instance(1).await;
    let first_user = wallet.selected_address();

    let signer = wallet.signer(first_user).unwrap();
    store
        .get_or_create(instance.clone(), signer.clone(), CONTRACT)
        .await
        .unwrap();
    store
        .get_or_create(instance.clone(), signer, Address::new([0xb1; 20]))
        .await
        .unwrap();

    let second_user = wallet.switch_account(1).unwrap();
    let signer = wallet.signer(second_user).unwrap();
    store.get_or_create(instance, signer, CONTRACT).await.unwrap();

    assert_eq!(wallet.signature_prompts(), 3);
}

#[tokio::test]
async fn test_signature_survives_restart_in_json_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("signatures.json");
    let wallet = connected_wallet().await;
    let user = wallet.selected_address();
    let signer = wallet.signer(user).unwrap();
    let instance = instance(1).await;

    let issued = DecryptionSignatureStore::new(Arc::new(JsonFileSignatureStorage::new(&path)))
        .get_or_create(instance.clone(), signer.clone(), CONTRACT)
        .await
        .expect("Failed to sign");

    let storage = Arc::new(JsonFileSignatureStorage::new(&path));
    let stored = storage
        .get(&SignatureKey::new(CHAIN, CONTRACT, user).storage_key())
        .await
        .unwrap();
    assert!(stored.is_some());

    let reloaded = DecryptionSignatureStore::new(storage)
        .get_or_create(instance, signer, CONTRACT)
        .await
        .expect("Failed to load signature");
    assert_eq!(reloaded.signature, issued.signature);
    assert_eq!(wallet.signature_prompts(), 1);
}
