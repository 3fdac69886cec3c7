//! Integration tests for the wallet session observer.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use zamail::error::WalletError;
use zamail::wallet::{
    LocalWallet, SessionSigner, WalletBackend, WalletEvent, WalletSession, WalletSessionProvider,
};

const CHAIN: u64 = 31337;

// ─────────────────────────── Switching Wallet ───────────────────────────

/// Answers the first `eth_chainId` with the old chain after the user already
/// switched to `next_chain`, like a wallet whose answer crosses a notification.
struct SwitchingWallet {
    inner: Arc<LocalWallet>,
    next_chain: u64,
    switched: AtomicBool,
}

#[async_trait]
impl WalletBackend for SwitchingWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, WalletError> {
        let answer = self.inner.request(method, params).await?;
        if method == "eth_chainId" && !self.switched.swap(true, Ordering::SeqCst) {
            self.inner.switch_chain(self.next_chain);
            // Let the listener handle the notification before answering.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(answer)
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.inner.subscribe()
    }

    fn signer(&self, address: Address) -> Result<Arc<dyn SessionSigner>, WalletError> {
        self.inner.signer(address)
    }

    fn readonly_provider(&self, chain_id: u64) -> Option<String> {
        self.inner.readonly_provider(chain_id)
    }
}

// ─────────────────────────── Helpers ───────────────────────────

fn provider() -> (Arc<LocalWallet>, WalletSessionProvider) {
    let wallet = Arc::new(LocalWallet::dev(CHAIN).expect("Failed to create wallet"));
    let sessions = WalletSessionProvider::new(wallet.clone());
    (wallet, sessions)
}

async fn next_session(
    sessions: &mut watch::Receiver<Option<WalletSession>>,
    mut ready: impl FnMut(Option<&WalletSession>) -> bool,
) -> Option<WalletSession> {
    tokio::time::timeout(
        Duration::from_secs(5),
        sessions.wait_for(|session| ready(session.as_ref())),
    )
    .await
    .expect("Timed out waiting for session")
    .expect("Session channel closed")
    .clone()
}

// ─────────────────────────── Tests ───────────────────────────

#[tokio::test]
async fn test_declined_connection() {
    let (wallet, sessions) = provider();
    wallet.set_connect_approval(false);

    let res = sessions.connect().await;
    assert_eq!(res.unwrap_err(), WalletError::NotConnected);
    assert!(!sessions.is_connected());
    assert!(sessions.signer().is_none());

    wallet.set_connect_approval(true);
    let session = sessions.connect().await.expect("Failed to connect");
    assert_eq!(session.address, wallet.selected_address());
    assert_eq!(session.chain_id, CHAIN);
    assert!(sessions.is_connected());
}

#[tokio::test]
async fn test_account_change_replaces_session() {
    let (wallet, sessions) = provider();
    let mut updates = sessions.subscribe();
    let first = sessions.connect().await.expect("Failed to connect");

    assert!(sessions.same_signer(first.address));
    assert!(sessions.same_chain(CHAIN));

    let second = wallet.switch_account(1).expect("Failed to switch account");
    let session = next_session(&mut updates, |s| s.is_some_and(|s| s.address == second))
        .await
        .expect("Session dropped");
    assert_eq!(session.chain_id, CHAIN);
    assert_eq!(session.signer.address(), second);

    // A snapshot captured before the switch is no longer current.
    assert!(!sessions.same_signer(first.address));
    assert!(sessions.same_chain(CHAIN));
}

#[tokio::test]
async fn test_chain_change_replaces_session() {
    let (wallet, sessions) = provider();
    let mut updates = sessions.subscribe();
    let first = sessions.connect().await.expect("Failed to connect");

    wallet.switch_chain(11155111);
    let session = next_session(&mut updates, |s| s.is_some_and(|s| s.chain_id == 11155111))
        .await
        .expect("Session dropped");
    assert_eq!(session.address, first.address);
    assert!(!sessions.same_chain(CHAIN));
    assert!(sessions.same_signer(first.address));
    assert_eq!(sessions.readonly_provider(), None);
}

#[tokio::test]
async fn test_disconnect_drops_session() {
    let (wallet, sessions) = provider();
    let mut updates = sessions.subscribe();
    let first = sessions.connect().await.expect("Failed to connect");

    wallet.disconnect();
    next_session(&mut updates, |s| s.is_none()).await;
    assert!(!sessions.is_connected());
    assert!(!sessions.same_signer(first.address));
    assert!(!sessions.same_chain(CHAIN));
    assert_eq!(sessions.address(), None);
}

#[tokio::test]
async fn test_events_before_connect_are_ignored() {
    let (wallet, sessions) = provider();
    // Starts the listener without authorizing.
    wallet.set_connect_approval(false);
    let _ = sessions.connect().await;

    wallet.switch_chain(1337);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sessions.current().is_none());

    wallet.set_connect_approval(true);
    let session = sessions.connect().await.expect("Failed to connect");
    assert_eq!(session.chain_id, 1337);
}

#[tokio::test]
async fn test_chain_change_while_connecting_is_not_lost() {
    let wallet = Arc::new(LocalWallet::dev(CHAIN).expect("Failed to create wallet"));
    let sessions = WalletSessionProvider::new(Arc::new(SwitchingWallet {
        inner: wallet.clone(),
        next_chain: 1337,
        switched: AtomicBool::new(false),
    }));

    let session = sessions.connect().await.expect("Failed to connect");
    assert_eq!(wallet.chain_id(), 1337);
    assert_eq!(session.chain_id, 1337);
    assert_eq!(sessions.chain_id(), Some(1337));
    assert_eq!(session.address, wallet.selected_address());
}
