use alloy::primitives::Address;
use log::{info, warn};
use serde_json::json;
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;

use crate::error::WalletError;
use crate::wallet::{local::parse_chain_id, SessionSigner, WalletBackend, WalletEvent};

/// A connected account on a chain. Replaced wholesale whenever the account or
/// the chain changes, never mutated.
#[derive(Clone)]
pub struct WalletSession {
    pub address: Address,
    pub chain_id: u64,
    pub signer: Arc<dyn SessionSigner>,
    pub readonly_provider: Option<String>,
}

impl WalletSession {
    /// Same account on the same chain through the same provider.
    pub fn same_context(&self, other: &WalletSession) -> bool {
        self.address == other.address
            && self.chain_id == other.chain_id
            && self.readonly_provider == other.readonly_provider
    }
}

impl fmt::Debug for WalletSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSession")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("readonly_provider", &self.readonly_provider)
            .finish()
    }
}

struct SessionInner {
    backend: Arc<dyn WalletBackend>,
    session: watch::Sender<Option<WalletSession>>,
    listening: AtomicBool,
    /// Notifications handled so far, connected or not.
    events_seen: AtomicU64,
    cancel: CancellationToken,
}

/// Tracks the wallet session and publishes every change to subscribers.
pub struct WalletSessionProvider {
    inner: Arc<SessionInner>,
}

impl WalletSessionProvider {
    pub fn new(backend: Arc<dyn WalletBackend>) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                backend,
                session,
                listening: AtomicBool::new(false),
                events_seen: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Ask the wallet to authorize this dapp and publish the resulting session.
    ///
    /// A notification handled while the wallet is answering makes the answer
    /// stale: the account and chain are then read again before publishing.
    pub async fn connect(&self) -> Result<WalletSession, WalletError> {
        self.start_listening();
        let mut seen = self.inner.events_seen.load(Ordering::SeqCst);

        let accounts = match self
            .inner
            .backend
            .request("eth_requestAccounts", json!([]))
            .await
        {
            Ok(value) => parse_accounts(&value)?,
            Err(WalletError::UserRejected) => {
                warn!("[connect] User declined the connection request");
                return Err(WalletError::NotConnected);
            }
            Err(e) => return Err(e),
        };
        let mut address = accounts.first().copied().ok_or(WalletError::NotConnected)?;

        loop {
            let chain_id =
                parse_chain_id(&self.inner.backend.request("eth_chainId", json!([])).await?)?;
            let session = self.inner.build_session(address, chain_id)?;

            let published = self.inner.session.send_if_modified(|current| {
                if self.inner.events_seen.load(Ordering::SeqCst) != seen {
                    return false;
                }
                *current = Some(session.clone());
                true
            });
            if published {
                info!(
                    "[connect] Wallet session: account {} on chain {}",
                    session.address, session.chain_id
                );
                return Ok(session);
            }

            warn!("[connect] Wallet changed while connecting, reading it again");
            seen = self.inner.events_seen.load(Ordering::SeqCst);
            let accounts = parse_accounts(
                &self
                    .inner
                    .backend
                    .request("eth_accounts", json!([]))
                    .await?,
            )?;
            address = accounts.first().copied().ok_or(WalletError::NotConnected)?;
        }
    }

    pub fn current(&self) -> Option<WalletSession> {
        self.inner.session.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.borrow().is_some()
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.session.borrow().as_ref().map(|s| s.address)
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.inner.session.borrow().as_ref().map(|s| s.chain_id)
    }

    pub fn signer(&self) -> Option<Arc<dyn SessionSigner>> {
        self.inner.session.borrow().as_ref().map(|s| s.signer.clone())
    }

    pub fn readonly_provider(&self) -> Option<String> {
        self.inner
            .session
            .borrow()
            .as_ref()
            .and_then(|s| s.readonly_provider.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<WalletSession>> {
        self.inner.session.subscribe()
    }

    /// True if the live chain is still the one captured before a suspension.
    pub fn same_chain(&self, captured_chain_id: u64) -> bool {
        self.chain_id() == Some(captured_chain_id)
    }

    /// True if the live account is still the one captured before a suspension.
    pub fn same_signer(&self, captured_address: Address) -> bool {
        self.address() == Some(captured_address)
    }

    /// Stop reacting to wallet notifications.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    fn start_listening(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut events = self.inner.backend.subscribe();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!("Wallet notification listener started");
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => inner.apply(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Wallet notification listener skipped {skipped} events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            info!("Wallet notification listener stopped");
        });
    }
}

impl Drop for WalletSessionProvider {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl SessionInner {
    fn build_session(&self, address: Address, chain_id: u64) -> Result<WalletSession, WalletError> {
        Ok(WalletSession {
            address,
            chain_id,
            signer: self.backend.signer(address)?,
            readonly_provider: self.backend.readonly_provider(chain_id),
        })
    }

    fn apply(&self, event: WalletEvent) {
        // Counted under the channel lock so `connect` sees every event that
        // could precede its publish.
        self.session.send_if_modified(|current| {
            self.events_seen.fetch_add(1, Ordering::SeqCst);
            let next = match (event, current.as_ref()) {
                (WalletEvent::Disconnected, _) => None,
                (WalletEvent::AccountsChanged(accounts), Some(session)) => {
                    match accounts.first() {
                        Some(address) => self.rebuild(*address, session.chain_id),
                        None => None,
                    }
                }
                (WalletEvent::ChainChanged(chain_id), Some(session)) => {
                    self.rebuild(session.address, chain_id)
                }
                // Not connected yet: nothing to replace.
                (_, None) => return false,
            };
            match &next {
                Some(s) => info!(
                    "Wallet session: account {} on chain {}",
                    s.address, s.chain_id
                ),
                None => info!("Wallet session closed"),
            }
            *current = next;
            true
        });
    }

    fn rebuild(&self, address: Address, chain_id: u64) -> Option<WalletSession> {
        match self.build_session(address, chain_id) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Dropping wallet session for {address} on chain {chain_id}: {e}");
                None
            }
        }
    }
}

fn parse_accounts(value: &serde_json::Value) -> Result<Vec<Address>, WalletError> {
    let accounts = value
        .as_array()
        .ok_or_else(|| WalletError::InvalidResponse(format!("accounts {value}")))?;
    accounts
        .iter()
        .map(|account| {
            account
                .as_str()
                .and_then(|s| Address::from_str(s).ok())
                .ok_or_else(|| WalletError::InvalidResponse(format!("account {account}")))
        })
        .collect()
}
