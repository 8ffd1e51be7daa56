//! Framing. Chat records: one JSON object per newline-terminated line.
//! Discovery datagrams: length-prefix (4 bytes LE) + bincode payload.

use crate::cipher::{self, CryptoError};
use crate::identity::SessionKeys;
use crate::protocol::{ChatMessage, Message};

/// Longest accepted chat record, excluding the terminator.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Serialize a chat record to its line text (no terminator). With `keys`, the
/// `message` field is replaced by its base64 ciphertext.
pub fn encode_line(
    msg: &ChatMessage,
    keys: Option<&SessionKeys>,
) -> Result<String, LineEncodeError> {
    let line = match keys {
        Some(keys) => {
            let sealed = ChatMessage {
                message: cipher::encrypt_text(&msg.message, keys)?,
                sender_ip: msg.sender_ip.clone(),
            };
            serde_json::to_string(&sealed)?
        }
        None => serde_json::to_string(msg)?,
    };
    if line.len() > MAX_LINE_LEN {
        return Err(LineEncodeError::TooLong(line.len()));
    }
    Ok(line)
}

#[derive(Debug, thiserror::Error)]
pub enum LineEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("encrypt error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("record too long ({0} bytes)")]
    TooLong(usize),
}

/// Parse one line (terminator optional) into a chat record.
pub fn decode_line(line: &str, keys: Option<&SessionKeys>) -> Result<ChatMessage, LineDecodeError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Err(LineDecodeError::Empty);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(LineDecodeError::TooLong(line.len()));
    }
    let mut msg: ChatMessage = serde_json::from_str(line)?;
    if let Some(keys) = keys {
        msg.message = cipher::decrypt_text(&msg.message, keys)?;
    }
    Ok(msg)
}

#[derive(Debug, thiserror::Error)]
pub enum LineDecodeError {
    #[error("empty line")]
    Empty,
    #[error("record too long ({0} bytes)")]
    TooLong(usize),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("decrypt error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Encode a discovery datagram: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one datagram. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: Message =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
