//! Message text is carried on-chain as a single encrypted `u64`: up to eight
//! UTF-8 bytes packed big-endian.

use crate::error::MessageBoardError;

/// Longest message the board accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 8;

/// Pack `text` into the on-chain value.
///
/// Only the byte length is checked: a character takes at least one byte, so
/// eight bytes also bound the character count. NUL is rejected because
/// leading zero bytes are indistinguishable from padding when decoding.
pub fn encode_text(text: &str) -> Result<u64, MessageBoardError> {
    if text.is_empty() {
        return Err(MessageBoardError::EmptyMessage);
    }
    if text.len() > MAX_MESSAGE_CHARS {
        return Err(MessageBoardError::MessageTooLong {
            max: MAX_MESSAGE_CHARS,
        });
    }
    if text.contains('\0') {
        return Err(MessageBoardError::NulInMessage);
    }
    Ok(text
        .bytes()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(byte)))
}

pub fn decode_text(value: u64) -> String {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
