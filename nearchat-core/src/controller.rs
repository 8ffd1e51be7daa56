//! Host-driven connection lifecycle: the host passes discovery, session and user
//! events in; the controller returns actions for the host to perform.
//!
//! Events must be delivered one at a time, in arrival order. The controller owns
//! at most one session; every session-scoped event carries a [`SessionId`] and
//! events for a session that is no longer current are ignored.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use crate::handshake::{HandshakeState, Role};
use crate::identity::{DeviceAddress, InvalidStudentId, StudentId};
use crate::protocol::{ChatMessage, DEFAULT_TRANSPORT_PORT};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControllerState {
    AdapterDisabled,
    Idle,
    Discovering,
    PeersAvailable,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DiscoveryStatus {
    Seen,
    NotSeen,
}

/// A device reported by the discovery service.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peer {
    pub address: DeviceAddress,
    pub name: String,
    pub status: DiscoveryStatus,
}

impl Peer {
    pub fn seen(address: DeviceAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            status: DiscoveryStatus::Seen,
        }
    }
}

/// Link-level connection reported by the discovery service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkInfo {
    /// Network address of the accepting side.
    pub group_owner_ip: IpAddr,
    /// True when this device is the accepting side.
    pub is_group_owner: bool,
    pub peer: Option<DeviceAddress>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything the host needs to open a session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionPlan {
    pub id: SessionId,
    pub role: Role,
    /// Accepting side's transport address; set for the initiator.
    pub remote: Option<SocketAddr>,
    /// Local identifier presented by the initiator.
    pub identifier: Option<String>,
    /// Identifier the responder derives keys from instead of the presented one.
    pub expected_peer_identifier: Option<String>,
    /// Run the challenge-response exchange before chat traffic.
    pub handshake: bool,
}

/// How a session's handshake ended, as reported by the host.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeOutcome {
    Authenticated { peer_identifier: Option<String> },
    Failed { reason: String },
}

/// Notification for the UI collaborator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UiEvent {
    AdapterStateChanged(bool),
    PeerListUpdated(Vec<Peer>),
    DeviceStatusChanged(Peer),
    MessageReceived(ChatMessage),
    MessageSent(ChatMessage),
    StateChanged(ControllerState),
    Connected { remote: SocketAddr },
    Authenticated { peer_identifier: Option<String> },
    Disconnected { reason: String },
    Error(String),
}

impl UiEvent {
    /// Route this event to the matching callback.
    pub fn dispatch(&self, sink: &dyn ChatEvents) {
        match self {
            UiEvent::AdapterStateChanged(enabled) => sink.on_adapter_state_changed(*enabled),
            UiEvent::PeerListUpdated(peers) => sink.on_peer_list_updated(peers),
            UiEvent::DeviceStatusChanged(device) => sink.on_device_status_changed(device),
            UiEvent::MessageReceived(message) => sink.on_message_received(message),
            other => sink.on_notification(other),
        }
    }
}

/// Callbacks exposed to the UI layer. Invoked off the UI's own execution context;
/// implementations re-dispatch if they need to.
pub trait ChatEvents: Send + Sync {
    fn on_adapter_state_changed(&self, enabled: bool);
    fn on_peer_list_updated(&self, peers: &[Peer]);
    fn on_device_status_changed(&self, device: &Peer);
    fn on_message_received(&self, message: &ChatMessage);
    fn on_notification(&self, _event: &UiEvent) {}
}

/// Action for host to perform.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Action {
    SetDeviceName(String),
    BeginDiscovery,
    StopDiscovery,
    Connect(DeviceAddress),
    DisconnectGroup,
    OpenSession(SessionPlan),
    Send {
        session: SessionId,
        message: ChatMessage,
    },
    CloseSession(SessionId),
    Notify(UiEvent),
}

/// Failure reported by the discovery service. Never fatal.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery adapter is disabled")]
    AdapterDisabled,
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceAddress),
    #[error("discovery service busy")]
    Busy,
    #[error("peer {0} did not answer the link request")]
    LinkTimeout(DeviceAddress),
    #[error("discovery failed: {0}")]
    Failed(String),
}

/// Rejected user request.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidStudentId),
    #[error("no student id set; run discovery first")]
    NoIdentifier,
    #[error("discovery adapter is disabled")]
    AdapterDisabled,
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceAddress),
    #[error("cannot {op} while {state:?}")]
    InvalidState {
        state: ControllerState,
        op: &'static str,
    },
    #[error("session is not authenticated")]
    NotAuthenticated,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub transport_port: u16,
    pub require_handshake: bool,
    pub announce_identifier: bool,
    pub expected_peer_identifier: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            transport_port: DEFAULT_TRANSPORT_PORT,
            require_handshake: true,
            announce_identifier: true,
            expected_peer_identifier: None,
        }
    }
}

/// The one session the controller owns.
struct ActiveSession {
    id: SessionId,
    role: Role,
    peer: Option<DeviceAddress>,
    opened: bool,
    local_ip: Option<String>,
    handshake: HandshakeState,
}

pub struct PeerConnectionController {
    config: ControllerConfig,
    state: ControllerState,
    adapter_enabled: bool,
    identifier: Option<StudentId>,
    peers: Vec<Peer>,
    local_device: Option<Peer>,
    pending: Option<DeviceAddress>,
    session: Option<ActiveSession>,
    next_session: u64,
}

impl PeerConnectionController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            state: ControllerState::AdapterDisabled,
            adapter_enabled: false,
            identifier: None,
            peers: Vec::new(),
            local_device: None,
            pending: None,
            session: None,
            next_session: 1,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn local_device(&self) -> Option<&Peer> {
        self.local_device.as_ref()
    }

    pub fn identifier(&self) -> Option<&StudentId> {
        self.identifier.as_ref()
    }

    /// Current session id, if one is open or opening.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn handshake_state(&self) -> Option<HandshakeState> {
        self.session.as_ref().map(|s| s.handshake)
    }

    /// Chat traffic is allowed on the current session.
    pub fn is_authorized(&self) -> bool {
        self.state == ControllerState::Connected
            && self.session.as_ref().is_some_and(|s| {
                !self.config.require_handshake || s.handshake == HandshakeState::Authenticated
            })
    }

    /// Set the student id without starting discovery.
    pub fn set_identifier(&mut self, identifier: &str) -> Result<(), ControllerError> {
        self.identifier = Some(StudentId::parse(identifier)?);
        Ok(())
    }

    pub fn on_adapter_state_changed(&mut self, enabled: bool) -> Vec<Action> {
        let mut actions = vec![Action::Notify(UiEvent::AdapterStateChanged(enabled))];
        self.adapter_enabled = enabled;
        if enabled {
            if self.state == ControllerState::AdapterDisabled {
                let next = self.resting_state();
                self.set_state(next, &mut actions);
            }
        } else {
            self.pending = None;
            self.close_session(&mut actions);
            self.set_state(ControllerState::AdapterDisabled, &mut actions);
        }
        actions
    }

    /// Replace the known peer set.
    pub fn on_peer_list_changed(&mut self, peers: Vec<Peer>) -> Vec<Action> {
        self.peers = peers;
        let mut actions = vec![Action::Notify(UiEvent::PeerListUpdated(self.peers.clone()))];
        match self.state {
            ControllerState::Idle | ControllerState::PeersAvailable => {
                let next = self.resting_state();
                self.set_state(next, &mut actions);
            }
            ControllerState::Discovering if !self.peers.is_empty() => {
                self.set_state(ControllerState::PeersAvailable, &mut actions);
            }
            _ => {}
        }
        actions
    }

    pub fn on_local_device_changed(&mut self, device: Peer) -> Vec<Action> {
        self.local_device = Some(device.clone());
        vec![Action::Notify(UiEvent::DeviceStatusChanged(device))]
    }

    /// Validate the student id, advertise it, and start discovery.
    pub fn request_discovery(&mut self, identifier: &str) -> Result<Vec<Action>, ControllerError> {
        let id = StudentId::parse(identifier)?;
        if !self.adapter_enabled {
            return Err(ControllerError::AdapterDisabled);
        }
        match self.state {
            ControllerState::Idle
            | ControllerState::PeersAvailable
            | ControllerState::Discovering => {}
            state => {
                return Err(ControllerError::InvalidState {
                    state,
                    op: "discover",
                })
            }
        }
        let mut actions = vec![
            Action::SetDeviceName(id.to_string()),
            Action::BeginDiscovery,
        ];
        self.identifier = Some(id);
        self.set_state(ControllerState::Discovering, &mut actions);
        Ok(actions)
    }

    pub fn stop_discovery(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::StopDiscovery];
        if self.state == ControllerState::Discovering {
            let next = self.resting_state();
            self.set_state(next, &mut actions);
        }
        actions
    }

    /// User selected a peer. Any existing session is torn down first.
    pub fn connect_to(&mut self, address: DeviceAddress) -> Result<Vec<Action>, ControllerError> {
        if !self.adapter_enabled {
            return Err(ControllerError::AdapterDisabled);
        }
        if self.config.require_handshake && self.identifier.is_none() {
            return Err(ControllerError::NoIdentifier);
        }
        if !self.peers.iter().any(|p| p.address == address) {
            return Err(ControllerError::UnknownPeer(address));
        }
        let mut actions = Vec::new();
        if matches!(
            self.state,
            ControllerState::Connecting | ControllerState::Connected
        ) {
            self.close_session(&mut actions);
            actions.push(Action::DisconnectGroup);
        } else {
            self.close_session(&mut actions);
        }
        self.pending = Some(address);
        actions.push(Action::Connect(address));
        self.set_state(ControllerState::Connecting, &mut actions);
        Ok(actions)
    }

    /// Outcome of a `Connect` action.
    pub fn on_connect_result(
        &mut self,
        address: DeviceAddress,
        result: Result<(), DiscoveryError>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.pending != Some(address) {
            debug!(%address, "ignoring stale connect result");
            return actions;
        }
        match result {
            Ok(()) => actions.push(Action::StopDiscovery),
            Err(e) => {
                if self.state == ControllerState::Connecting && self.session.is_none() {
                    warn!(%address, error = %e, "connect failed");
                    self.pending = None;
                    actions.push(Action::Notify(UiEvent::Error(e.to_string())));
                    let next = self.resting_state();
                    self.set_state(next, &mut actions);
                }
            }
        }
        actions
    }

    /// Link established; open a session against it.
    pub fn on_link_established(&mut self, link: LinkInfo) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.adapter_enabled {
            return actions;
        }
        if self.session.is_some() {
            debug!(group_owner = %link.group_owner_ip, "link already has a session");
            return actions;
        }
        let role = if link.is_group_owner {
            Role::Responder
        } else {
            Role::Initiator
        };
        let identifier = self.identifier.as_ref().map(|id| id.to_string());
        if role == Role::Initiator && self.config.require_handshake && identifier.is_none() {
            warn!("link established without a student id; dropping it");
            actions.push(Action::DisconnectGroup);
            actions.push(Action::Notify(UiEvent::Error(
                ControllerError::NoIdentifier.to_string(),
            )));
            return actions;
        }
        if self.state != ControllerState::Connecting {
            // Remote side formed the link.
            self.pending = link.peer;
            self.set_state(ControllerState::Connecting, &mut actions);
        }
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let remote = match role {
            Role::Initiator => Some(SocketAddr::new(
                link.group_owner_ip,
                self.config.transport_port,
            )),
            Role::Responder => None,
        };
        self.session = Some(ActiveSession {
            id,
            role,
            peer: link.peer.or(self.pending),
            opened: false,
            local_ip: None,
            handshake: HandshakeState::NotStarted,
        });
        info!(session = %id, ?role, "opening session");
        actions.push(Action::OpenSession(SessionPlan {
            id,
            role,
            remote,
            identifier,
            expected_peer_identifier: self.config.expected_peer_identifier.clone(),
            handshake: self.config.require_handshake,
        }));
        actions
    }

    /// Link reported lost by the discovery service.
    pub fn on_link_lost(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ControllerState::Connecting if self.session.is_none() => {
                self.pending = None;
                actions.push(Action::Notify(UiEvent::Error("link lost while connecting".into())));
                let next = self.resting_state();
                self.set_state(next, &mut actions);
            }
            ControllerState::Connecting | ControllerState::Connected => {
                self.pending = None;
                self.close_session(&mut actions);
                actions.push(Action::Notify(UiEvent::Disconnected {
                    reason: "link lost".into(),
                }));
                self.set_state(ControllerState::Disconnected, &mut actions);
            }
            _ => {}
        }
        actions
    }

    /// Host opened the stream for `id`.
    pub fn on_session_opened(
        &mut self,
        id: SessionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let require_handshake = self.config.require_handshake;
        let connecting = self.state == ControllerState::Connecting;
        let session = match self.current_session(id) {
            Some(s) if connecting => s,
            _ => {
                debug!(session = %id, "closing stale session");
                actions.push(Action::CloseSession(id));
                return actions;
            }
        };
        session.opened = true;
        session.local_ip = Some(local.ip().to_string());
        if !require_handshake {
            session.handshake = HandshakeState::Authenticated;
        }
        info!(session = %id, %remote, "session opened");
        actions.push(Action::Notify(UiEvent::Connected { remote }));
        self.set_state(ControllerState::Connected, &mut actions);
        actions
    }

    pub fn on_handshake_finished(
        &mut self,
        id: SessionId,
        outcome: HandshakeOutcome,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let connected = self.state == ControllerState::Connected;
        let session = match self.current_session(id) {
            Some(s) if connected && s.opened => s,
            _ => {
                debug!(session = %id, "ignoring handshake result for stale session");
                return actions;
            }
        };
        match outcome {
            HandshakeOutcome::Authenticated { peer_identifier } => {
                session.handshake = HandshakeState::Authenticated;
                let role = session.role;
                let local_ip = session.local_ip.clone().unwrap_or_default();
                info!(session = %id, peer = ?peer_identifier, "handshake authenticated");
                actions.push(Action::Notify(UiEvent::Authenticated { peer_identifier }));
                if self.config.announce_identifier && role == Role::Initiator {
                    if let Some(own) = &self.identifier {
                        let message = ChatMessage::new(format!("Student ID: {own}"), local_ip);
                        actions.push(Action::Send {
                            session: id,
                            message,
                        });
                    }
                }
            }
            HandshakeOutcome::Failed { reason } => {
                session.handshake = HandshakeState::Failed;
                warn!(session = %id, %reason, "handshake failed");
                self.pending = None;
                self.close_session(&mut actions);
                actions.push(Action::DisconnectGroup);
                actions.push(Action::Notify(UiEvent::Disconnected {
                    reason: format!("authentication failed: {reason}"),
                }));
                self.set_state(ControllerState::Disconnected, &mut actions);
            }
        }
        actions
    }

    /// A record arrived on session `id`. Delivered only once the session is authorized.
    pub fn on_message_received(&mut self, id: SessionId, message: ChatMessage) -> Vec<Action> {
        if self.session_id() != Some(id) || !self.is_authorized() {
            debug!(session = %id, "dropping message on unauthorized session");
            return Vec::new();
        }
        vec![Action::Notify(UiEvent::MessageReceived(message))]
    }

    pub fn send_message(&mut self, text: &str) -> Result<Vec<Action>, ControllerError> {
        if self.state != ControllerState::Connected {
            return Err(ControllerError::InvalidState {
                state: self.state,
                op: "send",
            });
        }
        if !self.is_authorized() {
            return Err(ControllerError::NotAuthenticated);
        }
        let session = match &self.session {
            Some(s) => s,
            None => return Err(ControllerError::NotAuthenticated),
        };
        let message = ChatMessage::new(text, session.local_ip.clone().unwrap_or_default());
        Ok(vec![
            Action::Send {
                session: session.id,
                message: message.clone(),
            },
            Action::Notify(UiEvent::MessageSent(message)),
        ])
    }

    /// The host could not hand a record to session `id`. `MessageSent` was
    /// already reported, so the failure is reported after it.
    pub fn on_send_failed(&mut self, id: SessionId, reason: &str) -> Vec<Action> {
        if self.session_id() != Some(id) {
            debug!(session = %id, "send failure on stale session");
            return Vec::new();
        }
        vec![Action::Notify(UiEvent::Error(format!("send failed: {reason}")))]
    }

    /// Receive loop of session `id` ended. A failure reason (a read or write
    /// error) is also reported as an error.
    pub fn on_transport_closed(&mut self, id: SessionId, reason: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.session_id() != Some(id) {
            return actions;
        }
        self.pending = None;
        self.close_session(&mut actions);
        actions.push(Action::DisconnectGroup);
        if let Some(reason) = &reason {
            actions.push(Action::Notify(UiEvent::Error(reason.clone())));
        }
        actions.push(Action::Notify(UiEvent::Disconnected {
            reason: reason.unwrap_or_else(|| "connection closed".into()),
        }));
        self.set_state(ControllerState::Disconnected, &mut actions);
        actions
    }

    /// Explicit user disconnect.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let had_link = matches!(
            self.state,
            ControllerState::Connecting | ControllerState::Connected
        );
        self.pending = None;
        let had_session = self.close_session(&mut actions);
        if had_link {
            actions.push(Action::DisconnectGroup);
        }
        if had_session {
            actions.push(Action::Notify(UiEvent::Disconnected {
                reason: "disconnected".into(),
            }));
            self.set_state(ControllerState::Disconnected, &mut actions);
        } else if had_link {
            let next = self.resting_state();
            self.set_state(next, &mut actions);
        }
        actions
    }

    /// Host finished tearing down session `id`.
    pub fn on_session_closed(&mut self, id: SessionId) -> Vec<Action> {
        let mut actions = Vec::new();
        debug!(session = %id, "session closed");
        if self.state == ControllerState::Disconnected && self.session.is_none() {
            let next = self.resting_state();
            self.set_state(next, &mut actions);
        }
        actions
    }

    fn current_session(&mut self, id: SessionId) -> Option<&mut ActiveSession> {
        self.session.as_mut().filter(|s| s.id == id)
    }

    /// Drop the current session, asking the host to close it. Returns whether one existed.
    fn close_session(&mut self, actions: &mut Vec<Action>) -> bool {
        match self.session.take() {
            Some(s) => {
                debug!(session = %s.id, peer = ?s.peer, "tearing down session");
                actions.push(Action::CloseSession(s.id));
                true
            }
            None => false,
        }
    }

    fn resting_state(&self) -> ControllerState {
        if !self.adapter_enabled {
            ControllerState::AdapterDisabled
        } else if self.peers.is_empty() {
            ControllerState::Idle
        } else {
            ControllerState::PeersAvailable
        }
    }

    fn set_state(&mut self, next: ControllerState, actions: &mut Vec<Action>) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "controller state");
            self.state = next;
            actions.push(Action::Notify(UiEvent::StateChanged(next)));
        }
    }
}

impl Default for PeerConnectionController {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}
