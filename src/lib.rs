//! Client-side coordinator of an encrypted messaging board.
//!
//! A connected wallet account sends short messages whose content is encrypted
//! with a chain-bound FHE instance, and recipients decrypt the messages
//! addressed to them with a signed decryption authorization.

pub mod board;
pub mod bootstrap;
pub mod cli;
pub mod contract;
pub mod error;
pub mod fhe;
pub mod signature;
pub mod wallet;

pub use board::{BoardSnapshot, BoardState, ClearMessage, Lifecycle, MessageBoardCoordinator, Outcome};
pub use error::MessageBoardError;
