use alloy::{
    primitives::{Address, Bytes},
    signers::{local::PrivateKeySigner, Signer},
    sol_types::{Eip712Domain, SolStruct},
};
use async_trait::async_trait;
use log::info;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;

use crate::error::WalletError;
use crate::signature::UserDecryptRequestVerification;
use crate::wallet::{SessionSigner, WalletBackend, WalletEvent};

/// Anvil/Hardhat default dev accounts 0..=2.
pub const ANVIL_DEV_KEYS: [&str; 3] = [
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
];

struct WalletState {
    chain_id: u64,
    selected: usize,
    authorized: bool,
}

/// User answers to wallet prompts, shared with the signers handed out.
struct Approvals {
    connect: AtomicBool,
    sign: AtomicBool,
    sign_prompts: AtomicUsize,
}

/// Wallet adapter holding local private keys, one of which is selected.
///
/// Connection and signature prompts are answered by approval toggles so that
/// a declining user can be simulated.
pub struct LocalWallet {
    accounts: Vec<PrivateKeySigner>,
    state: RwLock<WalletState>,
    approvals: Arc<Approvals>,
    rpc_urls: HashMap<u64, String>,
    events: broadcast::Sender<WalletEvent>,
}

impl LocalWallet {
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S], chain_id: u64) -> Result<Self, WalletError> {
        if keys.is_empty() {
            return Err(WalletError::InvalidPrivateKey("no private keys".to_string()));
        }
        let accounts = keys
            .iter()
            .map(|key| {
                PrivateKeySigner::from_str(key.as_ref())
                    .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (events, _) = broadcast::channel(32);
        Ok(Self {
            accounts,
            state: RwLock::new(WalletState {
                chain_id,
                selected: 0,
                authorized: false,
            }),
            approvals: Arc::new(Approvals {
                connect: AtomicBool::new(true),
                sign: AtomicBool::new(true),
                sign_prompts: AtomicUsize::new(0),
            }),
            rpc_urls: HashMap::new(),
            events,
        })
    }

    /// Wallet over the Anvil dev accounts.
    pub fn dev(chain_id: u64) -> Result<Self, WalletError> {
        Self::from_private_keys(&ANVIL_DEV_KEYS, chain_id)
    }

    pub fn with_rpc_urls(mut self, rpc_urls: HashMap<u64, String>) -> Self {
        self.rpc_urls = rpc_urls;
        self
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.accounts.iter().map(|a| a.address()).collect()
    }

    pub fn selected_address(&self) -> Address {
        self.accounts[self.state.read().selected].address()
    }

    pub fn chain_id(&self) -> u64 {
        self.state.read().chain_id
    }

    pub fn set_connect_approval(&self, approve: bool) {
        self.approvals.connect.store(approve, Ordering::SeqCst);
    }

    pub fn set_sign_approval(&self, approve: bool) {
        self.approvals.sign.store(approve, Ordering::SeqCst);
    }

    /// Number of signature prompts shown so far, approved or not.
    pub fn signature_prompts(&self) -> usize {
        self.approvals.sign_prompts.load(Ordering::SeqCst)
    }

    /// Select another account, as the user would in the wallet UI.
    pub fn switch_account(&self, index: usize) -> Result<Address, WalletError> {
        let signer = self
            .accounts
            .get(index)
            .ok_or_else(|| WalletError::InvalidResponse(format!("no account #{index}")))?;
        let authorized = {
            let mut state = self.state.write();
            state.selected = index;
            state.authorized
        };
        info!("[switch_account] Selected account {}", signer.address());
        if authorized {
            self.emit(WalletEvent::AccountsChanged(vec![signer.address()]));
        }
        Ok(signer.address())
    }

    pub fn switch_chain(&self, chain_id: u64) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.chain_id != chain_id;
            state.chain_id = chain_id;
            changed
        };
        if changed {
            info!("[switch_chain] Switched to chain {chain_id}");
            self.emit(WalletEvent::ChainChanged(chain_id));
        }
    }

    /// Revoke the dapp's access to the accounts.
    pub fn disconnect(&self) {
        self.state.write().authorized = false;
        self.emit(WalletEvent::AccountsChanged(Vec::new()));
    }

    fn emit(&self, event: WalletEvent) {
        // No subscribers is fine: nobody is connected yet.
        let _ = self.events.send(event);
    }

    fn selected_if_authorized(&self) -> Option<Address> {
        let state = self.state.read();
        state
            .authorized
            .then(|| self.accounts[state.selected].address())
    }
}

#[async_trait]
impl WalletBackend for LocalWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        match method {
            "eth_requestAccounts" => {
                if !self.approvals.connect.load(Ordering::SeqCst) {
                    return Err(WalletError::UserRejected);
                }
                let address = {
                    let mut state = self.state.write();
                    state.authorized = true;
                    self.accounts[state.selected].address()
                };
                Ok(json!([address.to_string()]))
            }
            "eth_accounts" => Ok(match self.selected_if_authorized() {
                Some(address) => json!([address.to_string()]),
                None => json!([]),
            }),
            "eth_chainId" => Ok(json!(format!("{:#x}", self.chain_id()))),
            "wallet_switchEthereumChain" => {
                let chain_id = params
                    .get(0)
                    .and_then(|p| p.get("chainId"))
                    .ok_or_else(|| WalletError::InvalidResponse("missing chainId".to_string()))
                    .and_then(parse_chain_id)?;
                self.switch_chain(chain_id);
                Ok(Value::Null)
            }
            other => Err(WalletError::UnsupportedMethod(other.to_string())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn signer(&self, address: Address) -> Result<Arc<dyn SessionSigner>, WalletError> {
        if self.selected_if_authorized().is_none() {
            return Err(WalletError::NotConnected);
        }
        let signer = self
            .accounts
            .iter()
            .find(|a| a.address() == address)
            .ok_or(WalletError::UnknownAccount(address))?;
        Ok(Arc::new(LocalSessionSigner {
            signer: signer.clone(),
            approvals: self.approvals.clone(),
        }))
    }

    fn readonly_provider(&self, chain_id: u64) -> Option<String> {
        self.rpc_urls.get(&chain_id).cloned()
    }
}

struct LocalSessionSigner {
    signer: PrivateKeySigner,
    approvals: Arc<Approvals>,
}

#[async_trait]
impl SessionSigner for LocalSessionSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_decryption_request(
        &self,
        request: &UserDecryptRequestVerification,
        domain: &Eip712Domain,
    ) -> Result<Bytes, WalletError> {
        self.approvals.sign_prompts.fetch_add(1, Ordering::SeqCst);
        if !self.approvals.sign.load(Ordering::SeqCst) {
            return Err(WalletError::UserRejected);
        }
        let hash = request.eip712_signing_hash(domain);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| WalletError::SigningError(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&signature.as_bytes()))
    }
}

/// Parse a chain id given as a hex quantity string or a JSON number.
pub(crate) fn parse_chain_id(value: &Value) -> Result<u64, WalletError> {
    match value {
        Value::String(s) => {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(digits, 16)
                .map_err(|e| WalletError::InvalidResponse(format!("chain id {s}: {e}")))
        }
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| WalletError::InvalidResponse(format!("chain id {n}"))),
        other => Err(WalletError::InvalidResponse(format!("chain id {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_accounts_requires_approval() {
        let wallet = LocalWallet::dev(31337).expect("Failed to create wallet");
        wallet.set_connect_approval(false);
        let res = wallet.request("eth_requestAccounts", json!([])).await;
        assert_eq!(res, Err(WalletError::UserRejected));

        let accounts = wallet.request("eth_accounts", json!([])).await.unwrap();
        assert_eq!(accounts, json!([]));

        wallet.set_connect_approval(true);
        let accounts = wallet.request("eth_requestAccounts", json!([])).await.unwrap();
        assert_eq!(accounts, json!([wallet.selected_address().to_string()]));
    }

    #[tokio::test]
    async fn test_switch_chain_emits_event() {
        let wallet = LocalWallet::dev(31337).expect("Failed to create wallet");
        let mut events = wallet.subscribe();

        wallet
            .request("wallet_switchEthereumChain", json!([{ "chainId": "0xaa36a7" }]))
            .await
            .unwrap();
        assert_eq!(wallet.chain_id(), 11155111);
        assert_eq!(events.recv().await.unwrap(), WalletEvent::ChainChanged(11155111));

        let chain = wallet.request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(chain, json!("0xaa36a7"));
    }

    #[test]
    fn test_parse_chain_id() {
        assert_eq!(parse_chain_id(&json!("0x7a69")), Ok(31337));
        assert_eq!(parse_chain_id(&json!(31337)), Ok(31337));
        assert!(parse_chain_id(&json!("0xzz")).is_err());
        assert!(parse_chain_id(&json!(null)).is_err());
    }
}
