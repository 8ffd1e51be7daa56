//! Nearchat protocol core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod cipher;
pub mod controller;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use cipher::CryptoError;
pub use controller::{
    Action, ChatEvents, ControllerConfig, ControllerError, ControllerState, DiscoveryError,
    HandshakeOutcome, LinkInfo, Peer, PeerConnectionController, SessionId, SessionPlan, UiEvent,
};
pub use handshake::{HandshakeError, HandshakeState, Initiator, ProtocolError, Responder, Role};
pub use identity::{DeviceAddress, SessionKeys, StudentId};
pub use protocol::{ChatMessage, Message, DEFAULT_TRANSPORT_PORT, PROTOCOL_VERSION};
pub use wire::{decode_frame, decode_line, encode_frame, encode_line};
