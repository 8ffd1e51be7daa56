//! Nearchat record types: steady-state chat records and LAN discovery datagrams.

use serde::{Deserialize, Serialize};

use crate::identity::DeviceAddress;

/// Current discovery datagram version. Datagrams with another version are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed, pre-agreed TCP port for chat sessions.
pub const DEFAULT_TRANSPORT_PORT: u16 = 8888;

/// A chat message. Arrival order is the only ordering; there is no clock.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message: String,
    pub sender_ip: String,
}

impl ChatMessage {
    pub fn new(message: impl Into<String>, sender_ip: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sender_ip: sender_ip.into(),
        }
    }
}

/// LAN discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Periodic presence announcement.
    Beacon {
        protocol_version: u8,
        address: DeviceAddress,
        name: String,
        listen_port: u16,
    },
    /// Ask `to` to form a link with `from`. The receiver becomes the accepting side.
    LinkRequest {
        protocol_version: u8,
        from: DeviceAddress,
        to: DeviceAddress,
    },
    /// Link accepted; the requester connects to the sender on the fixed chat port.
    LinkAccept {
        protocol_version: u8,
        from: DeviceAddress,
        to: DeviceAddress,
    },
    /// Link torn down by `from`.
    LinkClose {
        protocol_version: u8,
        from: DeviceAddress,
        to: DeviceAddress,
    },
}

impl Message {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Message::Beacon {
                protocol_version, ..
            }
            | Message::LinkRequest {
                protocol_version, ..
            }
            | Message::LinkAccept {
                protocol_version, ..
            }
            | Message::LinkClose {
                protocol_version, ..
            } => *protocol_version,
        }
    }
}
