//! User decryption authorizations: the signed payload, its persistence and the
//! deduplicating store that asks the wallet for it.

mod storage;
mod store;
mod types;

pub use storage::{InMemorySignatureStorage, JsonFileSignatureStorage, SignatureStorage};
pub use store::{Clock, DecryptionSignatureStore};
pub use types::{DecryptionSignature, SignatureKey, UserDecryptRequestVerification, SECONDS_PER_DAY};
