//! The message board: coordinator, published state and the text codec.

mod coordinator;
mod state;
mod text;

pub use coordinator::MessageBoardCoordinator;
pub use state::{BoardSnapshot, BoardState, ClearMessage, Lifecycle, Outcome, RefreshSummary};
pub use text::{decode_text, encode_text, MAX_MESSAGE_CHARS};
