//! LAN discovery: UDP multicast beacons build the peer list; a datagram exchange
//! (request, accept, close) stands in for link formation.
//!
//! All datagrams go to the multicast group; link datagrams carry `to` and are
//! ignored by everyone else. [`LanState`] holds the bookkeeping and does no I/O;
//! [`LanDiscovery`] drives it from a socket and timers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nearchat_core::wire::{decode_frame, encode_frame};
use nearchat_core::{DeviceAddress, DiscoveryError, LinkInfo, Message, Peer, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Link-layer operations the controller asks for. Results of asynchronous work
/// arrive later as [`DiscoveryEvent`]s.
pub trait DiscoveryService: Send + Sync {
    fn set_device_name(&self, name: &str) -> Result<(), DiscoveryError>;
    fn begin_discovery(&self) -> Result<(), DiscoveryError>;
    fn stop_discovery(&self) -> Result<(), DiscoveryError>;
    /// Ask `address` to form a link. `Ok` means the request went out.
    fn connect(&self, address: DeviceAddress) -> Result<(), DiscoveryError>;
    fn disconnect_group(&self) -> Result<(), DiscoveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    AdapterStateChanged(bool),
    PeerListChanged(Vec<Peer>),
    LocalDeviceChanged(Peer),
    LinkEstablished(LinkInfo),
    LinkLost,
    ConnectFailed(DeviceAddress, DiscoveryError),
}

struct PeerEntry {
    name: String,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Down,
    Requested { peer: DeviceAddress, since: Instant },
    Up { peer: DeviceAddress },
}

/// Events for the host and datagrams for the group, produced by one input.
#[derive(Debug, Default)]
pub struct Output {
    pub events: Vec<DiscoveryEvent>,
    pub datagrams: Vec<Message>,
}

/// Peer table and link state.
pub struct LanState {
    local: DeviceAddress,
    name: String,
    transport_port: u16,
    discovering: bool,
    peers: HashMap<DeviceAddress, PeerEntry>,
    link: Link,
    peer_timeout: Duration,
    link_timeout: Duration,
}

impl LanState {
    pub fn new(
        local: DeviceAddress,
        name: impl Into<String>,
        transport_port: u16,
        link_timeout: Duration,
    ) -> Self {
        Self {
            local,
            name: name.into(),
            transport_port,
            discovering: false,
            peers: HashMap::new(),
            link: Link::Down,
            peer_timeout: PEER_TIMEOUT,
            link_timeout,
        }
    }

    pub fn local_device(&self) -> Peer {
        Peer::seen(self.local, self.name.clone())
    }

    pub fn beacon(&self) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            address: self.local,
            name: self.name.clone(),
            listen_port: self.transport_port,
        }
    }

    /// Known peers, sorted by name then address.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .map(|(address, entry)| Peer::seen(*address, entry.name.clone()))
            .collect();
        peers.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.address.as_bytes().cmp(b.address.as_bytes()))
        });
        peers
    }

    pub fn set_name(&mut self, name: &str) -> Output {
        self.name = name.to_string();
        Output {
            events: vec![DiscoveryEvent::LocalDeviceChanged(self.local_device())],
            datagrams: vec![self.beacon()],
        }
    }

    pub fn begin(&mut self) -> Output {
        self.discovering = true;
        Output {
            events: vec![DiscoveryEvent::PeerListChanged(self.snapshot())],
            datagrams: vec![self.beacon()],
        }
    }

    pub fn stop(&mut self) {
        self.discovering = false;
    }

    pub fn connect(&mut self, peer: DeviceAddress, now: Instant) -> Result<Output, DiscoveryError> {
        if !self.peers.contains_key(&peer) {
            return Err(DiscoveryError::UnknownPeer(peer));
        }
        if self.link != Link::Down {
            return Err(DiscoveryError::Busy);
        }
        self.link = Link::Requested { peer, since: now };
        Ok(Output {
            events: Vec::new(),
            datagrams: vec![Message::LinkRequest {
                protocol_version: PROTOCOL_VERSION,
                from: self.local,
                to: peer,
            }],
        })
    }

    /// Drop the current link, telling the peer.
    pub fn disconnect(&mut self) -> Output {
        let mut out = Output::default();
        let peer = match self.link {
            Link::Down => return out,
            Link::Requested { peer, .. } | Link::Up { peer } => peer,
        };
        self.link = Link::Down;
        out.datagrams.push(self.close_to(peer));
        out
    }

    pub fn on_datagram(&mut self, msg: Message, from: SocketAddr, now: Instant) -> Output {
        let mut out = Output::default();
        if msg.protocol_version() != PROTOCOL_VERSION {
            debug!(%from, version = msg.protocol_version(), "ignoring foreign protocol version");
            return out;
        }
        match msg {
            Message::Beacon {
                address,
                name,
                listen_port,
                ..
            } => {
                if address == self.local {
                    return out;
                }
                if listen_port != self.transport_port {
                    debug!(%address, listen_port, "peer listens on a different chat port");
                }
                let changed = match self.peers.get_mut(&address) {
                    Some(entry) => {
                        entry.last_seen = now;
                        if entry.name != name {
                            entry.name = name;
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        debug!(%address, %name, "new peer");
                        self.peers.insert(
                            address,
                            PeerEntry {
                                name,
                                last_seen: now,
                            },
                        );
                        true
                    }
                };
                if changed && self.discovering {
                    out.events.push(DiscoveryEvent::PeerListChanged(self.snapshot()));
                }
            }
            Message::LinkRequest { from: peer, to, .. } if to == self.local => {
                self.on_link_request(peer, &mut out);
            }
            Message::LinkAccept { from: peer, to, .. } if to == self.local => {
                if let Link::Requested { peer: wanted, .. } = self.link {
                    if wanted == peer {
                        info!(%peer, ip = %from.ip(), "link accepted");
                        self.link = Link::Up { peer };
                        out.events.push(DiscoveryEvent::LinkEstablished(LinkInfo {
                            group_owner_ip: from.ip(),
                            is_group_owner: false,
                            peer: Some(peer),
                        }));
                    }
                }
            }
            Message::LinkClose { from: peer, to, .. } if to == self.local => match self.link {
                Link::Requested { peer: wanted, .. } if wanted == peer => {
                    self.link = Link::Down;
                    out.events
                        .push(DiscoveryEvent::ConnectFailed(peer, DiscoveryError::Busy));
                }
                Link::Up { peer: linked } if linked == peer => {
                    info!(%peer, "link closed by peer");
                    self.link = Link::Down;
                    out.events.push(DiscoveryEvent::LinkLost);
                }
                _ => {}
            },
            _ => {}
        }
        out
    }

    fn on_link_request(&mut self, peer: DeviceAddress, out: &mut Output) {
        match self.link {
            Link::Down => {}
            Link::Up { peer: linked } if linked == peer => {
                // Duplicate request; repeat the answer.
                out.datagrams.push(self.accept_to(peer));
                return;
            }
            // Both sides asked at once: the lower address accepts.
            Link::Requested { peer: wanted, .. } if wanted == peer => {
                if self.local.as_bytes() > peer.as_bytes() {
                    return;
                }
            }
            _ => {
                debug!(%peer, "busy, refusing link request");
                out.datagrams.push(self.close_to(peer));
                return;
            }
        }
        info!(%peer, "accepting link request");
        self.link = Link::Up { peer };
        out.datagrams.push(self.accept_to(peer));
        out.events.push(DiscoveryEvent::LinkEstablished(LinkInfo {
            group_owner_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            is_group_owner: true,
            peer: Some(peer),
        }));
    }

    /// Drop silent peers and expire an unanswered link request.
    pub fn sweep(&mut self, now: Instant) -> Output {
        let mut out = Output::default();
        let timeout = self.peer_timeout;
        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.duration_since(entry.last_seen) < timeout);
        if self.peers.len() != before && self.discovering {
            out.events.push(DiscoveryEvent::PeerListChanged(self.snapshot()));
        }
        match self.link {
            Link::Requested { peer, since } if now.duration_since(since) >= self.link_timeout => {
                warn!(%peer, "link request unanswered");
                self.link = Link::Down;
                out.datagrams.push(self.close_to(peer));
                out.events
                    .push(DiscoveryEvent::ConnectFailed(peer, DiscoveryError::LinkTimeout(peer)));
            }
            Link::Up { peer } if !self.peers.contains_key(&peer) => {
                info!(%peer, "linked peer went silent");
                self.link = Link::Down;
                out.events.push(DiscoveryEvent::LinkLost);
            }
            _ => {}
        }
        out
    }

    fn accept_to(&self, peer: DeviceAddress) -> Message {
        Message::LinkAccept {
            protocol_version: PROTOCOL_VERSION,
            from: self.local,
            to: peer,
        }
    }

    fn close_to(&self, peer: DeviceAddress) -> Message {
        Message::LinkClose {
            protocol_version: PROTOCOL_VERSION,
            from: self.local,
            to: peer,
        }
    }
}

/// Settings for [`LanDiscovery::start`].
#[derive(Debug, Clone)]
pub struct LanSettings {
    pub local: DeviceAddress,
    pub name: String,
    pub discovery_port: u16,
    pub transport_port: u16,
    pub link_timeout: Duration,
}

/// Multicast discovery service. Background tasks stop when it is dropped.
pub struct LanDiscovery {
    state: Arc<Mutex<LanState>>,
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanDiscovery {
    pub async fn start(
        settings: LanSettings,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(settings.discovery_port)?);
        let group = SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), settings.discovery_port);
        let state = Arc::new(Mutex::new(LanState::new(
            settings.local,
            settings.name,
            settings.transport_port,
            settings.link_timeout,
        )));
        info!(address = %settings.local, port = settings.discovery_port, "discovery started");
        let _ = events.send(DiscoveryEvent::AdapterStateChanged(true));
        let _ = events.send(DiscoveryEvent::LocalDeviceChanged(lock(&state).local_device()));

        let tasks = vec![
            tokio::spawn(beacon_loop(socket.clone(), state.clone(), group)),
            tokio::spawn(recv_loop(socket.clone(), state.clone(), group, events.clone())),
            tokio::spawn(sweep_loop(socket.clone(), state.clone(), group, events.clone())),
        ];
        Ok(Self {
            state,
            socket,
            group,
            events,
            tasks,
        })
    }

    fn apply(&self, out: Output) {
        publish(&self.socket, self.group, &self.events, out);
    }
}

impl DiscoveryService for LanDiscovery {
    fn set_device_name(&self, name: &str) -> Result<(), DiscoveryError> {
        let out = lock(&self.state).set_name(name);
        self.apply(out);
        Ok(())
    }

    fn begin_discovery(&self) -> Result<(), DiscoveryError> {
        let out = lock(&self.state).begin();
        self.apply(out);
        Ok(())
    }

    fn stop_discovery(&self) -> Result<(), DiscoveryError> {
        lock(&self.state).stop();
        Ok(())
    }

    fn connect(&self, address: DeviceAddress) -> Result<(), DiscoveryError> {
        let out = lock(&self.state).connect(address, Instant::now())?;
        self.apply(out);
        Ok(())
    }

    fn disconnect_group(&self) -> Result<(), DiscoveryError> {
        let out = lock(&self.state).disconnect();
        self.apply(out);
        Ok(())
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<LanState>) -> MutexGuard<'_, LanState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(
    socket: &UdpSocket,
    group: SocketAddr,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
    out: Output,
) {
    for msg in &out.datagrams {
        match encode_frame(msg) {
            Ok(frame) => {
                if let Err(e) = socket.try_send_to(&frame, group) {
                    debug!(error = %e, "datagram not sent");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode datagram"),
        }
    }
    for ev in out.events {
        let _ = events.send(ev);
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<LanState>>, group: SocketAddr) {
    loop {
        let beacon = lock(&state).beacon();
        match encode_frame(&beacon) {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, group).await {
                    debug!(error = %e, "beacon not sent");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode beacon"),
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LanState>>,
    group: SocketAddr,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                let _ = events.send(DiscoveryEvent::AdapterStateChanged(false));
                return;
            }
        };
        let msg = match decode_frame(&buf[..n]) {
            Ok((msg, _)) => msg,
            Err(e) => {
                debug!(%from, error = %e, "ignoring malformed datagram");
                continue;
            }
        };
        let out = lock(&state).on_datagram(msg, from, Instant::now());
        publish(&socket, group, &events, out);
    }
}

async fn sweep_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<LanState>>,
    group: SocketAddr,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let out = lock(&state).sweep(Instant::now());
        publish(&socket, group, &events, out);
    }
}
