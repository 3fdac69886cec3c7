use alloy::primitives::{Address, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: u64 = 86_400;

alloy::sol! {
    /// Typed payload the user signs to authorize decryption of handles held by
    /// `contractAddresses`, for `durationDays` starting at `startTimestamp`.
    #[derive(Debug, PartialEq, Eq)]
    struct UserDecryptRequestVerification {
        bytes publicKey;
        address[] contractAddresses;
        uint256 startTimestamp;
        uint256 durationDays;
        bytes extraData;
    }
}

/// Cache and persistence key of a decryption signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    pub chain_id: u64,
    pub contract: Address,
    pub user: Address,
}

impl SignatureKey {
    pub fn new(chain_id: u64, contract: Address, user: Address) -> Self {
        Self {
            chain_id,
            contract,
            user,
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "zamail.decryption-signature:{}:{:#x}:{:#x}",
            self.chain_id, self.contract, self.user
        )
    }
}

/// A signed decryption authorization with the keypair it was issued for.
/// Never mutated: an expired signature is replaced by a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionSignature {
    pub chain_id: u64,
    pub user_address: Address,
    pub contract_addresses: Vec<Address>,
    pub public_key: Bytes,
    pub private_key: Bytes,
    pub signature: Bytes,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

impl DecryptionSignature {
    pub fn expires_at(&self) -> u64 {
        self.start_timestamp
            .saturating_add(self.duration_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now >= self.start_timestamp && now < self.expires_at()
    }

    pub fn covers(&self, key: &SignatureKey) -> bool {
        self.chain_id == key.chain_id
            && self.user_address == key.user
            && self.contract_addresses.contains(&key.contract)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.start_timestamp).ok()?, 0)
    }

    /// The typed payload this signature was produced over.
    pub fn request(&self) -> UserDecryptRequestVerification {
        UserDecryptRequestVerification {
            publicKey: self.public_key.clone(),
            contractAddresses: self.contract_addresses.clone(),
            startTimestamp: U256::from(self.start_timestamp),
            durationDays: U256::from(self.duration_days),
            extraData: Bytes::new(),
        }
    }
}
