use alloy::primitives::{Address, U256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet is not connected")]
    NotConnected,
    #[error("User rejected the request")]
    UserRejected,
    #[error("Unsupported wallet method: {0}")]
    UnsupportedMethod(String),
    #[error("Unknown account: {0}")]
    UnknownAccount(Address),
    #[error("Invalid wallet response: {0}")]
    InvalidResponse(String),
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Signing error: {0}")]
    SigningError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FheError {
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(u64),
    #[error("Unable to create FHE instance: {0}")]
    InstanceCreation(String),
    #[error("Unable to encrypt input: {0}")]
    Encryption(String),
    #[error("Unable to decrypt handle: {0}")]
    Decryption(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("User rejected the decryption signature request")]
    Rejected,
    #[error("Unable to sign decryption request: {0}")]
    SigningFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Problem from std::io library: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Contract is not deployed at {0}")]
    NotDeployed(Address),
    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),
    #[error("Message not found: {0}")]
    UnknownMessage(U256),
    #[error("Contract call failed: {0}")]
    CallFailed(String),
}

/// Errors surfaced by the message board operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageBoardError {
    #[error("Wallet is not connected")]
    WalletNotConnected,
    /// Session, chain or instance changed while the operation was suspended.
    /// Operations turn this into a discarded outcome instead of returning it.
    #[error("Session changed during the operation")]
    ChainMismatch,
    #[error("FHE instance creation failed: {0}")]
    InstanceCreationFailed(String),
    #[error("FHE instance is not ready")]
    InstanceNotReady,
    #[error("Decryption signature was rejected")]
    SignatureRejected,
    #[error("Contract is not deployed on this chain")]
    ContractNotDeployed,
    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),
    #[error("Failed to encrypt message: {0}")]
    EncryptionFailed(String),
    #[error("Failed to decrypt message: {0}")]
    DecryptionFailed(String),
    #[error("Contract call failed: {0}")]
    ContractCallFailed(String),

    #[error("Message is empty")]
    EmptyMessage,
    #[error("Message is longer than {max} characters")]
    MessageTooLong { max: usize },
    #[error("Message contains a NUL character")]
    NulInMessage,
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("Operation already in progress: {0}")]
    Busy(&'static str),
}

impl From<SignatureError> for MessageBoardError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Rejected => MessageBoardError::SignatureRejected,
            SignatureError::SigningFailed(e) => MessageBoardError::DecryptionFailed(e),
        }
    }
}

impl From<GatewayError> for MessageBoardError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotDeployed(_) => MessageBoardError::ContractNotDeployed,
            GatewayError::TransactionReverted(reason) => {
                MessageBoardError::TransactionReverted(reason)
            }
            other => MessageBoardError::ContractCallFailed(other.to_string()),
        }
    }
}

impl From<FheError> for MessageBoardError {
    fn from(err: FheError) -> Self {
        match err {
            FheError::UnsupportedChain(_) | FheError::InstanceCreation(_) => {
                MessageBoardError::InstanceCreationFailed(err.to_string())
            }
            FheError::Encryption(e) => MessageBoardError::EncryptionFailed(e),
            FheError::Decryption(e) => MessageBoardError::DecryptionFailed(e),
        }
    }
}
