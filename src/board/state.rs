use alloy::primitives::{Address, B256};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use crate::contract::{MessageId, MessageRecord};
use crate::error::MessageBoardError;
use crate::fhe::{FheState, FheStatus};
use crate::wallet::WalletSession;

/// Decrypted content of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearMessage {
    pub handle: B256,
    pub value: u64,
    pub clear: String,
}

/// Result of an operation that may have outlived the context it started in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Committed(T),
    /// The session, chain or instance changed while suspended; nothing was
    /// written.
    Discarded,
}

impl<T> Outcome<T> {
    pub fn is_discarded(&self) -> bool {
        matches!(self, Outcome::Discarded)
    }

    pub fn committed(self) -> Option<T> {
        match self {
            Outcome::Committed(value) => Some(value),
            Outcome::Discarded => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub sent: usize,
    pub received: usize,
}

/// Stored coordinator state. Capability flags are not stored here, see
/// [`BoardSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct BoardState {
    /// Account and chain the context-bound fields below belong to.
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub contract_address: Option<Address>,
    /// `None` until the deployment lookup for `chain_id` has completed.
    pub is_deployed: Option<bool>,

    pub is_sending: bool,
    pub is_refreshing: bool,
    pub decrypting: BTreeSet<MessageId>,
    /// Another refresh was asked for while one was running.
    pub(crate) refresh_queued: bool,

    pub sent_messages: Vec<MessageId>,
    pub received_messages: Vec<MessageId>,
    pub messages: HashMap<MessageId, MessageRecord>,
    pub message_contents: HashMap<MessageId, ClearMessage>,

    /// Human-readable status line.
    pub message: String,
    pub last_error: Option<MessageBoardError>,
}

impl BoardState {
    /// Drop everything bound to the previous account/chain and rebind to the
    /// new one. In-flight flags are left to the operations owning them.
    pub(crate) fn reset_context(&mut self, account: Option<Address>, chain_id: Option<u64>) {
        self.account = account;
        self.chain_id = chain_id;
        self.contract_address = None;
        self.is_deployed = None;
        self.sent_messages.clear();
        self.received_messages.clear();
        self.messages.clear();
        self.message_contents.clear();
        self.message.clear();
        self.last_error = None;
    }

    pub(crate) fn bound_to(&self, session: &WalletSession) -> bool {
        self.account == Some(session.address) && self.chain_id == Some(session.chain_id)
    }

    pub fn is_decrypting(&self) -> bool {
        !self.decrypting.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Disconnected,
    Connected { deployed: bool },
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = match self {
            Lifecycle::Disconnected => "Disconnected",
            Lifecycle::Connected { deployed: false } => "Connected(NotDeployed)",
            Lifecycle::Connected { deployed: true } => "Connected(Ready)",
        };
        write!(f, "{lifecycle}")
    }
}

/// Point-in-time view of the session, the FHE instance and the board state.
/// Capability flags are computed from these on every call.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub session: Option<WalletSession>,
    pub fhe: FheState,
    pub board: BoardState,
}

impl BoardSnapshot {
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn instance_ready(&self) -> bool {
        match &self.session {
            Some(session) => self.fhe.is_ready() && self.fhe.chain_id == Some(session.chain_id),
            None => false,
        }
    }

    pub fn instance_status(&self) -> FheStatus {
        self.fhe.status
    }

    pub fn contract_deployed(&self) -> bool {
        match &self.session {
            Some(session) => {
                self.board.bound_to(session)
                    && self.board.is_deployed == Some(true)
                    && self.board.contract_address.is_some()
            }
            None => false,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.board.is_sending
    }

    pub fn is_refreshing(&self) -> bool {
        self.board.is_refreshing
    }

    pub fn is_decrypting(&self) -> bool {
        self.board.is_decrypting()
    }

    pub fn can_send_message(&self) -> bool {
        self.instance_ready() && self.is_connected() && self.contract_deployed() && !self.is_sending()
    }

    pub fn can_get_messages(&self) -> bool {
        self.is_connected() && self.contract_deployed() && !self.is_refreshing()
    }

    pub fn can_decrypt(&self) -> bool {
        self.instance_ready() && self.is_connected() && !self.is_decrypting()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.is_connected() {
            Lifecycle::Connected {
                deployed: self.contract_deployed(),
            }
        } else {
            Lifecycle::Disconnected
        }
    }

    /// Decrypted text of `id`, only while the board is bound to the live
    /// session.
    pub fn clear_text(&self, id: MessageId) -> Option<&str> {
        let session = self.session.as_ref()?;
        if !self.board.bound_to(session) {
            return None;
        }
        self.board
            .message_contents
            .get(&id)
            .map(|content| content.clear.as_str())
    }
}
