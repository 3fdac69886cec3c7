use alloy::primitives::{Address, Bytes, U256};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use crate::error::{SignatureError, WalletError};
use crate::fhe::FheInstance;
use crate::signature::{
    DecryptionSignature, SignatureKey, SignatureStorage, UserDecryptRequestVerification,
};
use crate::wallet::SessionSigner;

/// Seconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

type PendingSignature = Shared<BoxFuture<'static, Result<DecryptionSignature, SignatureError>>>;

#[derive(Default)]
struct StoreState {
    cache: HashMap<SignatureKey, DecryptionSignature>,
    pending: HashMap<SignatureKey, PendingSignature>,
}

struct StoreInner {
    storage: Arc<dyn SignatureStorage>,
    state: Mutex<StoreState>,
    clock: Clock,
}

/// Issues and caches decryption signatures per (chain, contract, user).
///
/// At most one wallet prompt is in flight per key: concurrent callers for the
/// same key await the same pending request.
#[derive(Clone)]
pub struct DecryptionSignatureStore {
    inner: Arc<StoreInner>,
}

impl DecryptionSignatureStore {
    pub fn new(storage: Arc<dyn SignatureStorage>) -> Self {
        Self::with_clock(storage, Arc::new(unix_now))
    }

    pub fn with_clock(storage: Arc<dyn SignatureStorage>, clock: Clock) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage,
                state: Mutex::new(StoreState::default()),
                clock,
            }),
        }
    }

    /// Valid cached signature for `key`, without touching storage or wallet.
    pub fn cached(&self, key: &SignatureKey) -> Option<DecryptionSignature> {
        let now = (self.inner.clock)();
        self.inner
            .state
            .lock()
            .cache
            .get(key)
            .filter(|sig| sig.covers(key) && sig.is_valid_at(now))
            .cloned()
    }

    /// Return a valid signature for the signer's account on `contract`,
    /// prompting the wallet only when neither the cache nor storage has one.
    pub async fn get_or_create(
        &self,
        instance: Arc<dyn FheInstance>,
        signer: Arc<dyn SessionSigner>,
        contract: Address,
    ) -> Result<DecryptionSignature, SignatureError> {
        let key = SignatureKey::new(instance.chain_id(), contract, signer.address());
        let now = (self.inner.clock)();

        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(sig) = state.cache.get(&key) {
                if sig.covers(&key) && sig.is_valid_at(now) {
                    return Ok(sig.clone());
                }
                debug!("Decryption signature for {} expired", key.user);
                state.cache.remove(&key);
            }
            match state.pending.get(&key) {
                Some(pending) => {
                    debug!("Joining pending decryption signature request for {}", key.user);
                    pending.clone()
                }
                None => {
                    let pending = issue(self.inner.clone(), key, instance, signer)
                        .boxed()
                        .shared();
                    state.pending.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }
}

async fn issue(
    inner: Arc<StoreInner>,
    key: SignatureKey,
    instance: Arc<dyn FheInstance>,
    signer: Arc<dyn SessionSigner>,
) -> Result<DecryptionSignature, SignatureError> {
    let result = inner.load_or_sign(&key, instance, signer).await;

    let mut state = inner.state.lock();
    state.pending.remove(&key);
    if let Ok(sig) = &result {
        state.cache.insert(key, sig.clone());
    }
    result
}

impl StoreInner {
    async fn load_or_sign(
        &self,
        key: &SignatureKey,
        instance: Arc<dyn FheInstance>,
        signer: Arc<dyn SessionSigner>,
    ) -> Result<DecryptionSignature, SignatureError> {
        if let Some(sig) = self.load(key).await {
            debug!("Loaded stored decryption signature for {}", key.user);
            return Ok(sig);
        }

        let keypair = instance.generate_keypair();
        let start_timestamp = (self.clock)();
        let duration_days = instance.decryption_validity_days();
        let request = UserDecryptRequestVerification {
            publicKey: keypair.public_key.clone(),
            contractAddresses: vec![key.contract],
            startTimestamp: U256::from(start_timestamp),
            durationDays: U256::from(duration_days),
            extraData: Bytes::new(),
        };

        info!(
            "Requesting decryption signature from {} for contract {}",
            key.user, key.contract
        );
        let signature = signer
            .sign_decryption_request(&request, &instance.eip712_domain())
            .await
            .map_err(|e| match e {
                WalletError::UserRejected => SignatureError::Rejected,
                other => SignatureError::SigningFailed(other.to_string()),
            })?;

        let sig = DecryptionSignature {
            chain_id: key.chain_id,
            user_address: key.user,
            contract_addresses: vec![key.contract],
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature,
            start_timestamp,
            duration_days,
        };
        self.persist(key, &sig).await;
        Ok(sig)
    }

    async fn load(&self, key: &SignatureKey) -> Option<DecryptionSignature> {
        let storage_key = key.storage_key();
        let raw = match self.storage.get(&storage_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Unable to read stored decryption signature: {e}");
                return None;
            }
        };
        match serde_json::from_str::<DecryptionSignature>(&raw) {
            Ok(sig) if sig.covers(key) && sig.is_valid_at((self.clock)()) => return Some(sig),
            Ok(_) => debug!("Dropping stale stored decryption signature {storage_key}"),
            Err(e) => warn!("Dropping malformed stored decryption signature: {e}"),
        }
        if let Err(e) = self.storage.remove(&storage_key).await {
            warn!("Unable to remove stored decryption signature: {e}");
        }
        None
    }

    async fn persist(&self, key: &SignatureKey, sig: &DecryptionSignature) {
        let json = match serde_json::to_string(sig) {
            Ok(json) => json,
            Err(e) => {
                warn!("Unable to serialize decryption signature: {e}");
                return;
            }
        };
        if let Err(e) = self.storage.set(&key.storage_key(), json).await {
            warn!("Unable to persist decryption signature: {e}");
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
