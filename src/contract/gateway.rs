use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;

use crate::error::GatewayError;
use crate::fhe::EncryptedInput;

pub type MessageId = U256;

/// On-chain message entry. The content is only reachable through `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: Address,
    pub recipient: Address,
    pub handle: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    /// Id assigned to the sent message, when the receipt exposes it.
    pub message_id: Option<MessageId>,
}

/// Read/write access to the message board contract.
#[async_trait]
pub trait ContractGateway: Send + Sync {
    /// Address of the contract on `chain_id`, or `None` if it is not deployed there.
    async fn deployment(&self, chain_id: u64) -> Result<Option<Address>, GatewayError>;

    /// Ids of the messages sent by `user`, oldest first.
    async fn sent_message_ids(
        &self,
        contract: Address,
        user: Address,
    ) -> Result<Vec<MessageId>, GatewayError>;

    /// Ids of the messages addressed to `user`, oldest first.
    async fn received_message_ids(
        &self,
        contract: Address,
        user: Address,
    ) -> Result<Vec<MessageId>, GatewayError>;

    async fn message(&self, contract: Address, id: MessageId) -> Result<MessageRecord, GatewayError>;

    /// Submit `input` to `recipient` from the `from` account and wait for the
    /// receipt. A failed transaction is reported as `TransactionReverted`.
    async fn send_message(
        &self,
        contract: Address,
        from: Address,
        recipient: Address,
        input: &EncryptedInput,
    ) -> Result<TransactionReceipt, GatewayError>;
}
