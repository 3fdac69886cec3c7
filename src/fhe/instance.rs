use alloy::{
    primitives::{Address, Bytes, B256},
    sol_types::Eip712Domain,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::error::FheError;
use crate::fhe::NetworkConfig;
use crate::signature::DecryptionSignature;

/// Ciphertext handle plus the proof the contract needs to accept it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedInput {
    pub handle: B256,
    pub input_proof: Bytes,
}

#[derive(Debug, Clone)]
pub struct FheKeypair {
    pub public_key: Bytes,
    pub private_key: Bytes,
}

/// A handle together with the contract that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleContractPair {
    pub handle: B256,
    pub contract: Address,
}

/// Encryption/decryption capability bound to one chain.
#[async_trait]
pub trait FheInstance: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Encrypt `value` as an input for `contract`, sent by `user`.
    async fn encrypt_u64(
        &self,
        value: u64,
        contract: Address,
        user: Address,
    ) -> Result<EncryptedInput, FheError>;

    /// Fresh keypair for a decryption authorization.
    fn generate_keypair(&self) -> FheKeypair;

    /// EIP-712 domain decryption authorizations are signed under.
    fn eip712_domain(&self) -> Eip712Domain;

    /// Validity window of a new decryption authorization.
    fn decryption_validity_days(&self) -> u64;

    /// Decrypt `handles` on behalf of `user`, authorized by `signature`.
    async fn user_decrypt(
        &self,
        handles: &[HandleContractPair],
        signature: &DecryptionSignature,
        user: Address,
    ) -> Result<HashMap<B256, u64>, FheError>;
}

/// Builds FHE instances from a resolved network configuration.
#[async_trait]
pub trait FheBackend: Send + Sync {
    async fn create_instance(&self, config: NetworkConfig) -> Result<Arc<dyn FheInstance>, FheError>;
}
