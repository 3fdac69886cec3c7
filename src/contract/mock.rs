use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use log::info;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::contract::{ContractGateway, MessageId, MessageRecord, TransactionReceipt};
use crate::error::GatewayError;
use crate::fhe::{EncryptedInput, MockCoprocessor};

#[derive(Default)]
struct Ledger {
    messages: Vec<MessageRecord>,
    sent: HashMap<Address, Vec<MessageId>>,
    received: HashMap<Address, Vec<MessageId>>,
}

/// Message board contracts deployed on offline chains, one ledger per
/// deployment.
pub struct MockMessageBoard {
    coprocessor: Arc<MockCoprocessor>,
    deployments: HashMap<u64, Address>,
    ledgers: RwLock<HashMap<Address, Ledger>>,
    block_number: AtomicU64,
}

impl MockMessageBoard {
    pub fn new(coprocessor: Arc<MockCoprocessor>) -> Self {
        Self {
            coprocessor,
            deployments: HashMap::new(),
            ledgers: RwLock::new(HashMap::new()),
            block_number: AtomicU64::new(0),
        }
    }

    pub fn with_deployment(mut self, chain_id: u64, address: Address) -> Self {
        info!("Message board deployed at {address} on chain {chain_id}");
        self.deployments.insert(chain_id, address);
        self.ledgers.get_mut().entry(address).or_default();
        self
    }

    pub fn deployments(&self) -> &HashMap<u64, Address> {
        &self.deployments
    }

    pub fn message_count(&self, contract: Address) -> usize {
        self.ledgers
            .read()
            .get(&contract)
            .map_or(0, |ledger| ledger.messages.len())
    }

    fn with_ledger<R>(
        &self,
        contract: Address,
        f: impl FnOnce(&Ledger) -> R,
    ) -> Result<R, GatewayError> {
        self.ledgers
            .read()
            .get(&contract)
            .map(f)
            .ok_or(GatewayError::NotDeployed(contract))
    }
}

#[async_trait]
impl ContractGateway for MockMessageBoard {
    async fn deployment(&self, chain_id: u64) -> Result<Option<Address>, GatewayError> {
        Ok(self.deployments.get(&chain_id).copied())
    }

    async fn sent_message_ids(
        &self,
        contract: Address,
        user: Address,
    ) -> Result<Vec<MessageId>, GatewayError> {
        self.with_ledger(contract, |ledger| {
            ledger.sent.get(&user).cloned().unwrap_or_default()
        })
    }

    async fn received_message_ids(
        &self,
        contract: Address,
        user: Address,
    ) -> Result<Vec<MessageId>, GatewayError> {
        self.with_ledger(contract, |ledger| {
            ledger.received.get(&user).cloned().unwrap_or_default()
        })
    }

    async fn message(&self, contract: Address, id: MessageId) -> Result<MessageRecord, GatewayError> {
        self.with_ledger(contract, |ledger| {
            usize::try_from(id)
                .ok()
                .and_then(|index| ledger.messages.get(index))
                .cloned()
        })?
        .ok_or(GatewayError::UnknownMessage(id))
    }

    async fn send_message(
        &self,
        contract: Address,
        from: Address,
        recipient: Address,
        input: &EncryptedInput,
    ) -> Result<TransactionReceipt, GatewayError> {
        let mut ledgers = self.ledgers.write();
        let ledger = ledgers
            .get_mut(&contract)
            .ok_or(GatewayError::NotDeployed(contract))?;
        if recipient == Address::ZERO {
            return Err(GatewayError::TransactionReverted(
                "recipient is the zero address".to_string(),
            ));
        }
        if !self.coprocessor.verify_input(input, contract, from) {
            return Err(GatewayError::TransactionReverted(
                "invalid input proof".to_string(),
            ));
        }

        let id = U256::from(ledger.messages.len());
        ledger.messages.push(MessageRecord {
            id,
            sender: from,
            recipient,
            handle: input.handle,
        });
        ledger.sent.entry(from).or_default().push(id);
        ledger.received.entry(recipient).or_default().push(id);
        let block_number = self.block_number.fetch_add(1, Ordering::SeqCst) + 1;

        self.coprocessor.allow(input.handle, contract);
        self.coprocessor.allow(input.handle, from);
        self.coprocessor.allow(input.handle, recipient);

        let mut preimage = Vec::with_capacity(80);
        preimage.extend_from_slice(&id.to_be_bytes::<32>());
        preimage.extend_from_slice(from.as_slice());
        preimage.extend_from_slice(&block_number.to_be_bytes());
        let transaction_hash: B256 = keccak256(preimage);

        info!("Message #{id} sent from {from} to {recipient}");
        Ok(TransactionReceipt {
            transaction_hash,
            block_number,
            message_id: Some(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhe::{FheBackend, MockFheBackend, NetworkConfig};

    const CHAIN: u64 = 31337;

    const BOARD: Address = Address::new([0xb0; 20]);

    fn board() -> (MockMessageBoard, Arc<MockCoprocessor>) {
        let coprocessor = Arc::new(MockCoprocessor::new());
        let board = MockMessageBoard::new(coprocessor.clone()).with_deployment(CHAIN, BOARD);
        (board, coprocessor)
    }

    async fn encrypt(coprocessor: &Arc<MockCoprocessor>, contract: Address, user: Address) -> EncryptedInput {
        let backend = MockFheBackend::new(coprocessor.clone(), 1);
        let instance = backend
            .create_instance(NetworkConfig::Mock {
                chain_id: CHAIN,
                rpc_url: "http://localhost:8545".to_string(),
            })
            .await
            .expect("Failed to create instance");
        instance
            .encrypt_u64(1, contract, user)
            .await
            .expect("Failed to encrypt")
    }

    #[tokio::test]
    async fn test_deployment_only_on_own_chain() {
        let (board, _) = board();
        assert_eq!(board.deployment(CHAIN).await.unwrap(), Some(BOARD));
        assert_eq!(board.deployment(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_indexes_and_grants_access() {
        let (board, coprocessor) = board();
        let alice = Address::repeat_byte(0x0a);
        let bob = Address::repeat_byte(0x0b);
        let input = encrypt(&coprocessor, BOARD, alice).await;

        let receipt = board
            .send_message(BOARD, alice, bob, &input)
            .await
            .expect("Failed to send");
        assert_eq!(receipt.message_id, Some(U256::ZERO));

        let sent = board.sent_message_ids(BOARD, alice).await.unwrap();
        let received = board.received_message_ids(BOARD, bob).await.unwrap();
        assert_eq!(sent, vec![U256::ZERO]);
        assert_eq!(received, vec![U256::ZERO]);
        assert!(coprocessor.is_allowed(input.handle, bob));
        assert!(coprocessor.is_allowed(input.handle, alice));

        let record = board.message(BOARD, U256::ZERO).await.unwrap();
        assert_eq!(record.sender, alice);
        assert_eq!(record.recipient, bob);
        assert_eq!(record.handle, input.handle);
    }

    #[tokio::test]
    async fn test_send_reverts_on_bad_input() {
        let (board, coprocessor) = board();
        let alice = Address::repeat_byte(0x0a);
        let mallory = Address::repeat_byte(0x0c);
        let input = encrypt(&coprocessor, BOARD, alice).await;

        let res = board
            .send_message(BOARD, alice, Address::ZERO, &input)
            .await;
        assert!(matches!(res, Err(GatewayError::TransactionReverted(_))));

        // Input encrypted by alice cannot be replayed by another sender.
        let res = board
            .send_message(BOARD, mallory, alice, &input)
            .await;
        assert!(matches!(res, Err(GatewayError::TransactionReverted(_))));
        assert_eq!(board.message_count(BOARD), 0);
    }
}
