//! Wallet capability seam and the session observer built on top of it.
//!
//! - [`WalletBackend`] is the request/subscribe capability a wallet adapter implements
//! - [`LocalWallet`] is the dev adapter backed by local private keys
//! - [`WalletSessionProvider`] publishes the current [`WalletSession`] to subscribers

mod backend;
mod local;
mod session;

pub use backend::{SessionSigner, WalletBackend, WalletEvent};
pub use local::{LocalWallet, ANVIL_DEV_KEYS};
pub use session::{WalletSession, WalletSessionProvider};
