//! Access to the deployed message board contract.

mod gateway;
mod mock;

pub use gateway::{ContractGateway, MessageId, MessageRecord, TransactionReceipt};
pub use mock::MockMessageBoard;
