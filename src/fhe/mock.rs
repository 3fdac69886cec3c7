//! Offline FHE backend for local/dev chains.
//!
//! Plaintexts are kept by an in-process [`MockCoprocessor`] under random
//! handles. Decryption still enforces the authorization rules of a real
//! deployment: a valid signature from the requesting user, an unexpired
//! window, the contract in the signed list, and ACL access to every handle.

use alloy::{
    primitives::{address, keccak256, Address, Bytes, PrimitiveSignature, B256, U256},
    sol_types::{Eip712Domain, SolStruct},
};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::error::FheError;
use crate::fhe::{EncryptedInput, FheBackend, FheInstance, FheKeypair, HandleContractPair, NetworkConfig};
use crate::signature::DecryptionSignature;

/// Verifying contract of the decryption domain on offline chains.
pub const MOCK_VERIFYING_CONTRACT: Address = address!("00000000000000000000000000000000000d3c09");

struct StoredCiphertext {
    value: u64,
    contract: Address,
    user: Address,
    acl: HashSet<Address>,
}

/// Ciphertext registry shared by the offline FHE instance and the offline
/// contract.
#[derive(Default)]
pub struct MockCoprocessor {
    ciphertexts: RwLock<HashMap<B256, StoredCiphertext>>,
}

impl MockCoprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_input(&self, value: u64, contract: Address, user: Address) -> EncryptedInput {
        let handle = B256::from(rand::random::<[u8; 32]>());
        self.ciphertexts.write().insert(
            handle,
            StoredCiphertext {
                value,
                contract,
                user,
                acl: HashSet::new(),
            },
        );
        EncryptedInput {
            handle,
            input_proof: input_proof(handle, contract, user),
        }
    }

    /// Check that `input` was encrypted for `contract` by `user`.
    pub fn verify_input(&self, input: &EncryptedInput, contract: Address, user: Address) -> bool {
        let ciphertexts = self.ciphertexts.read();
        ciphertexts.get(&input.handle).is_some_and(|ct| {
            ct.contract == contract
                && ct.user == user
                && input.input_proof == input_proof(input.handle, contract, user)
        })
    }

    /// Grant `account` access to `handle`. Returns false for unknown handles.
    pub fn allow(&self, handle: B256, account: Address) -> bool {
        match self.ciphertexts.write().get_mut(&handle) {
            Some(ct) => {
                ct.acl.insert(account);
                true
            }
            None => false,
        }
    }

    pub fn is_allowed(&self, handle: B256, account: Address) -> bool {
        self.ciphertexts
            .read()
            .get(&handle)
            .is_some_and(|ct| ct.acl.contains(&account))
    }

    fn value(&self, handle: B256) -> Option<u64> {
        self.ciphertexts.read().get(&handle).map(|ct| ct.value)
    }
}

fn input_proof(handle: B256, contract: Address, user: Address) -> Bytes {
    let mut preimage = Vec::with_capacity(72);
    preimage.extend_from_slice(handle.as_slice());
    preimage.extend_from_slice(contract.as_slice());
    preimage.extend_from_slice(user.as_slice());
    Bytes::copy_from_slice(keccak256(preimage).as_slice())
}

/// Creates [`MockFheInstance`]s for mock network configurations and refuses
/// relayer ones.
pub struct MockFheBackend {
    coprocessor: Arc<MockCoprocessor>,
    validity_days: u64,
}

impl MockFheBackend {
    pub fn new(coprocessor: Arc<MockCoprocessor>, validity_days: u64) -> Self {
        Self {
            coprocessor,
            validity_days,
        }
    }
}

#[async_trait]
impl FheBackend for MockFheBackend {
    async fn create_instance(&self, config: NetworkConfig) -> Result<Arc<dyn FheInstance>, FheError> {
        match config {
            NetworkConfig::Mock { chain_id, rpc_url } => {
                info!("Creating offline FHE instance for chain {chain_id} ({rpc_url})");
                Ok(Arc::new(MockFheInstance {
                    chain_id,
                    coprocessor: self.coprocessor.clone(),
                    validity_days: self.validity_days,
                }))
            }
            NetworkConfig::Relayer { chain_id, .. } => Err(FheError::UnsupportedChain(chain_id)),
        }
    }
}

struct MockFheInstance {
    chain_id: u64,
    coprocessor: Arc<MockCoprocessor>,
    validity_days: u64,
}

impl MockFheInstance {
    fn verify_signer(&self, signature: &DecryptionSignature, user: Address) -> Result<(), FheError> {
        let hash = signature.request().eip712_signing_hash(&self.eip712_domain());
        let recovered = PrimitiveSignature::from_raw(&signature.signature)
            .and_then(|sig| sig.recover_address_from_prehash(&hash))
            .map_err(|e| FheError::Decryption(format!("invalid signature: {e}")))?;
        if recovered != user {
            return Err(FheError::Decryption(format!(
                "signature was issued by {recovered}, not {user}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FheInstance for MockFheInstance {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn encrypt_u64(
        &self,
        value: u64,
        contract: Address,
        user: Address,
    ) -> Result<EncryptedInput, FheError> {
        Ok(self.coprocessor.register_input(value, contract, user))
    }

    fn generate_keypair(&self) -> FheKeypair {
        let private_key = rand::random::<[u8; 32]>();
        FheKeypair {
            public_key: Bytes::copy_from_slice(keccak256(private_key).as_slice()),
            private_key: Bytes::copy_from_slice(&private_key),
        }
    }

    fn eip712_domain(&self) -> Eip712Domain {
        Eip712Domain::new(
            Some("Decryption".into()),
            Some("1".into()),
            Some(U256::from(self.chain_id)),
            Some(MOCK_VERIFYING_CONTRACT),
            None,
        )
    }

    fn decryption_validity_days(&self) -> u64 {
        self.validity_days
    }

    async fn user_decrypt(
        &self,
        handles: &[HandleContractPair],
        signature: &DecryptionSignature,
        user: Address,
    ) -> Result<HashMap<B256, u64>, FheError> {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        if signature.user_address != user || signature.chain_id != self.chain_id {
            return Err(FheError::Decryption(
                "signature does not belong to this user and chain".to_string(),
            ));
        }
        if !signature.is_valid_at(now) {
            return Err(FheError::Decryption("signature expired".to_string()));
        }
        self.verify_signer(signature, user)?;

        let mut clear = HashMap::with_capacity(handles.len());
        for pair in handles {
            if !signature.contract_addresses.contains(&pair.contract) {
                return Err(FheError::Decryption(format!(
                    "contract {} is not covered by the signature",
                    pair.contract
                )));
            }
            if !self.coprocessor.is_allowed(pair.handle, user)
                || !self.coprocessor.is_allowed(pair.handle, pair.contract)
            {
                return Err(FheError::Decryption(format!(
                    "{user} is not allowed to decrypt {}",
                    pair.handle
                )));
            }
            let value = self
                .coprocessor
                .value(pair.handle)
                .ok_or_else(|| FheError::Decryption(format!("unknown handle {}", pair.handle)))?;
            clear.insert(pair.handle, value);
        }
        debug!("Decrypted {} handles for {user}", clear.len());
        Ok(clear)
    }
}
