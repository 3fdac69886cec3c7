//! Chain-bound FHE instance: collaborator traits, network resolution, the
//! lifecycle manager and the offline backend used on dev chains.

mod instance;
mod manager;
mod mock;
mod network;

pub use instance::{EncryptedInput, FheBackend, FheInstance, FheKeypair, HandleContractPair};
pub use manager::{FheInputs, FheInstanceManager, FheState, FheStatus};
pub use mock::{MockCoprocessor, MockFheBackend, MOCK_VERIFYING_CONTRACT};
pub use network::{NetworkConfig, NetworkTable, RelayerNetwork, LOCAL_DEV_CHAIN_ID};
