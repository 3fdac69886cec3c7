//! Wallet capability traits.

use alloy::{
    primitives::{Address, Bytes},
    sol_types::Eip712Domain,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::WalletError;
use crate::signature::UserDecryptRequestVerification;

/// Notifications pushed by a wallet backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// The authorized account list changed. An empty list means the user
    /// revoked access.
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnected,
}

/// Request/response wallet capability plus change notifications.
///
/// Requests follow the JSON-RPC wallet convention: a method name and a JSON
/// params array, answered with a JSON value.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WalletError>;

    /// Subscribe to account and chain notifications.
    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;

    /// Signer capability for an authorized account.
    fn signer(&self, address: Address) -> Result<Arc<dyn SessionSigner>, WalletError>;

    /// Read-only RPC endpoint the wallet uses for `chain_id`, if any.
    fn readonly_provider(&self, chain_id: u64) -> Option<String>;
}

/// Signing capability of a connected account.
#[async_trait]
pub trait SessionSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Ask the user to sign the typed decryption authorization.
    /// Returns the 65-byte signature.
    async fn sign_decryption_request(
        &self,
        request: &UserDecryptRequestVerification,
        domain: &Eip712Domain,
    ) -> Result<Bytes, WalletError>;
}
