//! Runs the controller: feeds it discovery, user and session events one at a
//! time and performs the actions it returns.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use nearchat_core::{
    Action, ChatEvents, ChatMessage, DeviceAddress, HandshakeOutcome, Peer,
    PeerConnectionController, Role, SessionId, SessionPlan, UiEvent,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::console::UserCommand;
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::session::{self, Session, SessionError};
use crate::transport::{LineChannel, MessageTransport, TransportEvent};

#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Bound on TCP connect or accept once a link is up.
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Encrypt message text with the negotiated keys.
    pub encrypt_messages: bool,
    /// Used by `/discover` without an argument.
    pub student_id: Option<String>,
}

/// Reported by a session's task.
pub enum SessionEvent {
    Opened {
        local: SocketAddr,
        remote: SocketAddr,
    },
    Ready(Arc<Session>),
    HandshakeFailed(String),
    Message(ChatMessage),
    Closed(Option<String>),
    TornDown,
}

type SessionSender = mpsc::UnboundedSender<(SessionId, SessionEvent)>;

struct SessionSlot {
    task: JoinHandle<()>,
    handshake: bool,
    session: Option<Arc<Session>>,
}

pub struct Host {
    controller: PeerConnectionController,
    discovery: Arc<dyn DiscoveryService>,
    ui: Arc<dyn ChatEvents>,
    settings: HostSettings,
    listener: Arc<TcpListener>,
    sessions: HashMap<SessionId, SessionSlot>,
    session_tx: SessionSender,
    session_rx: mpsc::UnboundedReceiver<(SessionId, SessionEvent)>,
}

impl Host {
    pub fn new(
        controller: PeerConnectionController,
        discovery: Arc<dyn DiscoveryService>,
        ui: Arc<dyn ChatEvents>,
        settings: HostSettings,
        listener: TcpListener,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            discovery,
            ui,
            settings,
            listener: Arc::new(listener),
            sessions: HashMap::new(),
            session_tx,
            session_rx,
        }
    }

    #[cfg(test)]
    pub fn controller(&self) -> &PeerConnectionController {
        &self.controller
    }

    /// Process events until `/quit`, closed inputs, or `shutdown` resolves; then
    /// tear down any session.
    pub async fn run<S>(
        mut self,
        mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        shutdown: S,
    ) where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                ev = discovery.recv() => match ev {
                    Some(ev) => self.handle_discovery(ev),
                    None => {
                        warn!("discovery service stopped");
                        break;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                Some((id, ev)) = self.session_rx.recv() => self.handle_session(id, ev),
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    pub fn handle_discovery(&mut self, ev: DiscoveryEvent) {
        debug!(?ev, "discovery event");
        let actions = match ev {
            DiscoveryEvent::AdapterStateChanged(enabled) => {
                self.controller.on_adapter_state_changed(enabled)
            }
            DiscoveryEvent::PeerListChanged(peers) => self.controller.on_peer_list_changed(peers),
            DiscoveryEvent::LocalDeviceChanged(device) => {
                self.controller.on_local_device_changed(device)
            }
            DiscoveryEvent::LinkEstablished(link) => self.controller.on_link_established(link),
            DiscoveryEvent::LinkLost => self.controller.on_link_lost(),
            DiscoveryEvent::ConnectFailed(address, e) => {
                self.controller.on_connect_result(address, Err(e))
            }
        };
        self.execute(actions);
    }

    /// Returns false when the user asked to quit.
    pub fn handle_command(&mut self, cmd: UserCommand) -> bool {
        let result = match cmd {
            UserCommand::Discover(id) => {
                match id.or_else(|| self.default_identifier()) {
                    Some(id) => self.controller.request_discovery(&id),
                    None => {
                        self.notify_error("no student id; use /discover <id>");
                        return true;
                    }
                }
            }
            UserCommand::StopDiscovery => Ok(self.controller.stop_discovery()),
            UserCommand::ListPeers => {
                self.ui.on_peer_list_updated(self.controller.peers());
                return true;
            }
            UserCommand::Connect(target) => match resolve_target(&target, self.controller.peers()) {
                Some(address) => self.controller.connect_to(address),
                None => {
                    self.notify_error(&format!("no peer {target}"));
                    return true;
                }
            },
            UserCommand::Disconnect => Ok(self.controller.disconnect()),
            UserCommand::Send(text) => self.controller.send_message(&text),
            UserCommand::Quit => return false,
        };
        match result {
            Ok(actions) => self.execute(actions),
            Err(e) => self.notify_error(&e.to_string()),
        }
        true
    }

    pub fn handle_session(&mut self, id: SessionId, ev: SessionEvent) {
        let actions = match ev {
            SessionEvent::Opened { local, remote } => {
                self.controller.on_session_opened(id, local, remote)
            }
            SessionEvent::Ready(session) => {
                let Some(slot) = self.sessions.get_mut(&id) else {
                    debug!(session = %id, "session ready after teardown");
                    tokio::spawn(async move { session.close().await });
                    return;
                };
                let peer_identifier = session.peer_identifier.clone();
                let authenticated = session.authenticated;
                slot.session = Some(session);
                if slot.handshake && authenticated {
                    self.controller.on_handshake_finished(
                        id,
                        HandshakeOutcome::Authenticated { peer_identifier },
                    )
                } else {
                    Vec::new()
                }
            }
            SessionEvent::HandshakeFailed(reason) => self
                .controller
                .on_handshake_finished(id, HandshakeOutcome::Failed { reason }),
            SessionEvent::Message(message) => self.controller.on_message_received(id, message),
            SessionEvent::Closed(reason) => self.controller.on_transport_closed(id, reason),
            SessionEvent::TornDown => self.controller.on_session_closed(id),
        };
        self.execute(actions);
    }

    /// Wait for the next session event and handle it. Returns false if none
    /// arrives within `within`.
    #[cfg(test)]
    pub async fn pump_session(&mut self, within: Duration) -> bool {
        match tokio::time::timeout(within, self.session_rx.recv()).await {
            Ok(Some((id, ev))) => {
                self.handle_session(id, ev);
                true
            }
            _ => false,
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::SetDeviceName(name) => {
                    if let Err(e) = self.discovery.set_device_name(&name) {
                        warn!(error = %e, "set device name failed");
                    }
                }
                Action::BeginDiscovery => {
                    if let Err(e) = self.discovery.begin_discovery() {
                        warn!(error = %e, "begin discovery failed");
                        self.notify_error(&e.to_string());
                    }
                }
                Action::StopDiscovery => {
                    if let Err(e) = self.discovery.stop_discovery() {
                        debug!(error = %e, "stop discovery failed");
                    }
                }
                Action::Connect(address) => {
                    let result = self.discovery.connect(address);
                    queue.extend(self.controller.on_connect_result(address, result));
                }
                Action::DisconnectGroup => {
                    if let Err(e) = self.discovery.disconnect_group() {
                        debug!(error = %e, "disconnect group failed");
                    }
                }
                Action::OpenSession(plan) => self.open_session(plan),
                Action::Send { session, message } => {
                    let more = self.send(session, message);
                    queue.extend(more);
                }
                Action::CloseSession(id) => self.close_session(id),
                Action::Notify(event) => event.dispatch(self.ui.as_ref()),
            }
        }
    }

    fn open_session(&mut self, plan: SessionPlan) {
        let id = plan.id;
        let handshake = plan.handshake;
        let task = tokio::spawn(run_session(
            plan,
            self.listener.clone(),
            self.settings.clone(),
            self.session_tx.clone(),
        ));
        self.sessions.insert(
            id,
            SessionSlot {
                task,
                handshake,
                session: None,
            },
        );
    }

    /// Queue a record on the session's writer. Refusals go back to the
    /// controller; write errors later arrive as `Closed` with a reason.
    fn send(&mut self, id: SessionId, message: ChatMessage) -> Vec<Action> {
        let session = self.sessions.get(&id).and_then(|slot| slot.session.clone());
        let result = match session {
            Some(session) => session.send(message).map_err(|e| e.to_string()),
            None => Err("session not ready".to_string()),
        };
        match result {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(session = %id, error = %e, "send failed");
                self.controller.on_send_failed(id, &e)
            }
        }
    }

    /// Close the session's stream off the event loop; `TornDown` follows.
    fn close_session(&mut self, id: SessionId) {
        let tx = self.session_tx.clone();
        let slot = self.sessions.remove(&id);
        tokio::spawn(async move {
            if let Some(slot) = slot {
                slot.task.abort();
                if let Some(session) = slot.session {
                    session.close().await;
                }
            }
            let _ = tx.send((id, SessionEvent::TornDown));
        });
    }

    async fn shutdown(&mut self) {
        let actions = self.controller.disconnect();
        self.execute(actions);
        for (_, slot) in self.sessions.drain() {
            slot.task.abort();
            if let Some(session) = slot.session {
                session.close().await;
            }
        }
    }

    fn default_identifier(&self) -> Option<String> {
        self.controller
            .identifier()
            .map(|id| id.to_string())
            .or_else(|| self.settings.student_id.clone())
    }

    fn notify_error(&self, message: &str) {
        UiEvent::Error(message.to_string()).dispatch(self.ui.as_ref());
    }
}

/// `/connect` target: a 1-based index into the peer list or a device address.
pub fn resolve_target(target: &str, peers: &[Peer]) -> Option<DeviceAddress> {
    if let Ok(n) = target.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| peers.get(i)).map(|p| p.address);
    }
    DeviceAddress::from_str(target).ok()
}

async fn run_session(
    plan: SessionPlan,
    listener: Arc<TcpListener>,
    settings: HostSettings,
    tx: SessionSender,
) {
    let id = plan.id;
    if let Err(e) = establish(plan, &listener, &settings, &tx).await {
        warn!(session = %id, error = %e, "session failed");
        let _ = tx.send((id, SessionEvent::Closed(Some(e.to_string()))));
    }
}

/// Open the stream, authenticate if required, then hand the transport over and
/// start its receive loop.
async fn establish(
    plan: SessionPlan,
    listener: &TcpListener,
    settings: &HostSettings,
    tx: &SessionSender,
) -> Result<(), SessionError> {
    let id = plan.id;
    let stream = match plan.role {
        Role::Initiator => {
            let remote = plan.remote.ok_or(SessionError::NoRemote)?;
            session::connect(remote, settings.connect_timeout).await?
        }
        Role::Responder => session::accept_stream(listener, settings.connect_timeout).await?,
    };
    let local = stream.local_addr()?;
    let remote = stream.peer_addr()?;
    info!(session = %id, %local, %remote, role = ?plan.role, "stream open");
    let _ = tx.send((id, SessionEvent::Opened { local, remote }));

    let (r, w) = stream.into_split();
    let mut chan = LineChannel::new(r, w);
    let mut peer_identifier = None;
    let mut keys = None;
    if plan.handshake {
        let result = match plan.role {
            Role::Initiator => {
                let identifier = plan.identifier.as_deref().ok_or(SessionError::NoIdentifier)?;
                session::initiate(&mut chan, identifier, settings.handshake_timeout)
                    .await
                    .map(|k| (None, k))
            }
            Role::Responder => session::accept(
                &mut chan,
                plan.expected_peer_identifier.clone(),
                settings.handshake_timeout,
            )
            .await
            .map(|auth| (Some(auth.peer_identifier), auth.keys)),
        };
        match result {
            Ok((peer, k)) => {
                info!(session = %id, peer = ?peer, "handshake complete");
                peer_identifier = peer;
                keys = Some(k);
            }
            Err(e) => {
                warn!(session = %id, error = %e, "handshake failed");
                let _ = tx.send((id, SessionEvent::HandshakeFailed(e.to_string())));
                return Ok(());
            }
        }
    }

    let (reader, writer) = chan.into_parts();
    let payload_keys = if settings.encrypt_messages { keys.clone() } else { None };
    let transport = Arc::new(MessageTransport::new(writer, payload_keys));
    let authenticated = keys.is_some();
    let session = Session::new(id, plan.role, peer_identifier, authenticated, transport.clone());
    let session = Arc::new(session);
    let _ = tx.send((id, SessionEvent::Ready(session)));
    let events = tx.clone();
    transport.start(reader, move |ev| {
        let ev = match ev {
            TransportEvent::Message(m) => SessionEvent::Message(m),
            TransportEvent::Closed { error } => SessionEvent::Closed(error),
        };
        let _ = events.send((id, ev));
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearchat_core::{ControllerConfig, ControllerState, DiscoveryError, LinkInfo};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    const ID: &str = "816012345";
    const WAIT: Duration = Duration::from_millis(500);

    #[derive(Default)]
    struct FakeDiscovery {
        calls: Mutex<Vec<String>>,
    }

    impl FakeDiscovery {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DiscoveryService for FakeDiscovery {
        fn set_device_name(&self, name: &str) -> Result<(), DiscoveryError> {
            self.calls.lock().unwrap().push(format!("name {name}"));
            Ok(())
        }
        fn begin_discovery(&self) -> Result<(), DiscoveryError> {
            self.calls.lock().unwrap().push("begin".into());
            Ok(())
        }
        fn stop_discovery(&self) -> Result<(), DiscoveryError> {
            self.calls.lock().unwrap().push("stop".into());
            Ok(())
        }
        fn connect(&self, address: DeviceAddress) -> Result<(), DiscoveryError> {
            self.calls.lock().unwrap().push(format!("connect {address}"));
            Ok(())
        }
        fn disconnect_group(&self) -> Result<(), DiscoveryError> {
            self.calls.lock().unwrap().push("disconnect".into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<ChatMessage>>,
        errors: Mutex<Vec<String>>,
    }

    impl ChatEvents for Recorder {
        fn on_adapter_state_changed(&self, _enabled: bool) {}
        fn on_peer_list_updated(&self, _peers: &[Peer]) {}
        fn on_device_status_changed(&self, _device: &Peer) {}
        fn on_message_received(&self, message: &ChatMessage) {
            self.received.lock().unwrap().push(message.clone());
        }
        fn on_notification(&self, event: &UiEvent) {
            if let UiEvent::Error(e) = event {
                self.errors.lock().unwrap().push(e.clone());
            }
        }
    }

    fn address(last: u8) -> DeviceAddress {
        DeviceAddress::from_bytes([2, 0, 0, 0, 0, last])
    }

    struct Node {
        host: Host,
        discovery: Arc<FakeDiscovery>,
        ui: Arc<Recorder>,
    }

    async fn node(chat_port: u16, listener: TcpListener, expected: Option<&str>) -> Node {
        let discovery = Arc::new(FakeDiscovery::default());
        let ui = Arc::new(Recorder::default());
        let config = ControllerConfig {
            transport_port: chat_port,
            expected_peer_identifier: expected.map(str::to_string),
            ..ControllerConfig::default()
        };
        let settings = HostSettings {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            encrypt_messages: true,
            student_id: None,
        };
        let mut host = Host::new(
            PeerConnectionController::new(config),
            discovery.clone(),
            ui.clone(),
            settings,
            listener,
        );
        host.handle_discovery(DiscoveryEvent::AdapterStateChanged(true));
        Node { host, discovery, ui }
    }

    /// Initiator `a` (id `a_id`) links to responder `b` over loopback.
    async fn linked_pair(a_id: &str, expected: Option<&str>) -> (Node, Node) {
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener_b.local_addr().unwrap().port();
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut a = node(port, listener_a, None).await;
        let mut b = node(port, listener_b, expected).await;

        a.host
            .handle_discovery(DiscoveryEvent::PeerListChanged(vec![Peer::seen(address(2), "b")]));
        assert!(a.host.handle_command(UserCommand::Discover(Some(a_id.into()))));
        assert!(a.host.handle_command(UserCommand::Connect("1".into())));
        assert_eq!(a.host.controller().state(), ControllerState::Connecting);

        b.host.handle_discovery(DiscoveryEvent::LinkEstablished(LinkInfo {
            group_owner_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            is_group_owner: true,
            peer: Some(address(1)),
        }));
        a.host.handle_discovery(DiscoveryEvent::LinkEstablished(LinkInfo {
            group_owner_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            is_group_owner: false,
            peer: Some(address(2)),
        }));
        (a, b)
    }

    async fn pump_until(node: &mut Node, done: impl Fn(&Node) -> bool) -> bool {
        for _ in 0..20 {
            if done(&*node) {
                return true;
            }
            node.host.pump_session(WAIT).await;
        }
        done(&*node)
    }

    #[test]
    fn targets_resolve_by_index_or_address() {
        let peers = vec![Peer::seen(address(1), "a"), Peer::seen(address(2), "b")];
        assert_eq!(resolve_target("2", &peers), Some(address(2)));
        assert_eq!(resolve_target("0", &peers), None);
        assert_eq!(resolve_target("3", &peers), None);
        assert_eq!(resolve_target("02:00:00:00:00:09", &peers), Some(address(9)));
        assert_eq!(resolve_target("bogus", &peers), None);
    }

    #[tokio::test]
    async fn discover_and_connect_drive_discovery_service() {
        let (a, _b) = linked_pair(ID, None).await;
        assert_eq!(
            a.discovery.calls()[..4],
            [
                format!("name {ID}"),
                "begin".to_string(),
                format!("connect {}", address(2)),
                "stop".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn authenticated_chat_over_loopback() {
        let (mut a, mut b) = linked_pair(ID, Some(ID)).await;
        assert!(pump_until(&mut b, |n| n.host.controller().is_authorized()).await);
        assert!(pump_until(&mut a, |n| n.host.controller().is_authorized()).await);
        assert_eq!(a.host.controller().state(), ControllerState::Connected);
        assert_eq!(b.host.controller().state(), ControllerState::Connected);

        // The initiator announces its id first.
        assert!(pump_until(&mut b, |n| !n.ui.received.lock().unwrap().is_empty()).await);
        assert_eq!(
            b.ui.received.lock().unwrap()[0].message,
            format!("Student ID: {ID}")
        );

        assert!(b.host.handle_command(UserCommand::Send("hi there".into())));
        assert!(pump_until(&mut a, |n| n
            .ui
            .received
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.message == "hi there"))
        .await);
        assert!(a.ui.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_identifier_never_connects_responder() {
        let (mut a, mut b) = linked_pair("816000000", Some(ID)).await;
        // b rejects the response and tears down.
        assert!(pump_until(&mut b, |n| {
            !n.host.controller().is_authorized()
                && n.host.controller().state() != ControllerState::Connected
                && n.host.controller().session_id().is_none()
        })
        .await);
        assert!(b.ui.received.lock().unwrap().is_empty());
        // a sees the stream close.
        assert!(pump_until(&mut a, |n| n.host.controller().session_id().is_none()).await);
        assert!(b.discovery.calls().contains(&"disconnect".to_string()));
    }

    #[tokio::test]
    async fn disconnect_closes_both_ends() {
        let (mut a, mut b) = linked_pair(ID, None).await;
        assert!(pump_until(&mut b, |n| n.host.controller().is_authorized()).await);
        assert!(pump_until(&mut a, |n| n.host.controller().is_authorized()).await);
        assert!(a.host.handle_command(UserCommand::Disconnect));
        assert!(
            pump_until(&mut a, |n| n.host.controller().state() != ControllerState::Disconnected)
                .await
        );
        assert!(pump_until(&mut b, |n| n.host.controller().session_id().is_none()).await);
    }

    #[tokio::test]
    async fn refused_send_reported_to_ui() {
        let (mut a, mut b) = linked_pair(ID, None).await;
        assert!(pump_until(&mut b, |n| n.host.controller().is_authorized()).await);
        assert!(pump_until(&mut a, |n| n.host.controller().is_authorized()).await);
        let id = a.host.controller().session_id().unwrap();
        let session = a.host.sessions[&id].session.clone().unwrap();
        session.close().await;
        assert!(a.host.handle_command(UserCommand::Send("lost".into())));
        assert_eq!(
            *a.ui.errors.lock().unwrap(),
            vec!["send failed: connection closed".to_string()]
        );
    }

    #[tokio::test]
    async fn discover_without_id_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut n = node(8888, listener, None).await;
        assert!(n.host.handle_command(UserCommand::Discover(None)));
        assert_eq!(n.ui.errors.lock().unwrap().len(), 1);
        assert!(n.discovery.calls().is_empty());
        assert!(!n.host.handle_command(UserCommand::Quit));
    }
}
