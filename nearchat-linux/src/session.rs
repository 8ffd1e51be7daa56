//! Session establishment: TCP connect or accept, then the challenge-response
//! exchange over a line channel, bounded by a caller-supplied timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nearchat_core::handshake::Authenticated;
use nearchat_core::{
    ChatMessage, HandshakeError, Initiator, Responder, Role, SessionId, SessionKeys,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::transport::{LineChannel, MessageTransport, TransportError};

const CONNECT_RETRY: Duration = Duration::from_millis(250);

/// Records waiting for the writer task. A peer that stops reading fills it.
pub const OUTBOX_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no local identifier to present")]
    NoIdentifier,
    #[error("no remote address for initiator")]
    NoRemote,
}

/// Connect to the accepting side, retrying until `within` elapses; it may not be
/// listening yet when the link comes up.
pub async fn connect(remote: SocketAddr, within: Duration) -> Result<TcpStream, SessionError> {
    let deadline = Instant::now() + within;
    loop {
        match timeout(within, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if Instant::now() + CONNECT_RETRY < deadline => {
                debug!(%remote, error = %e, "connect failed, retrying");
                sleep(CONNECT_RETRY).await;
            }
            Ok(Err(e)) => return Err(SessionError::Io(e)),
            Err(_) => return Err(SessionError::Timeout(within)),
        }
    }
}

/// Accept the next incoming connection on the shared chat listener.
pub async fn accept_stream(
    listener: &TcpListener,
    within: Duration,
) -> Result<TcpStream, SessionError> {
    match timeout(within, listener.accept()).await {
        Ok(Ok((stream, from))) => {
            debug!(%from, "accepted chat connection");
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::Timeout(within)),
    }
}

/// Initiating side of the handshake. Returns the derived keys once the response is flushed.
pub async fn initiate<R, W>(
    chan: &mut LineChannel<R, W>,
    identifier: &str,
    within: Duration,
) -> Result<SessionKeys, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut machine = Initiator::new(identifier);
    let result = timeout(within, async {
        let id_line = machine.start()?;
        chan.write_line(&id_line).await?;
        let challenge = chan.read_line().await?;
        let response = machine.on_challenge(&challenge)?;
        chan.write_line(&response).await?;
        Ok::<_, SessionError>(machine.finish()?)
    })
    .await;
    match result {
        Ok(Ok(keys)) => Ok(keys),
        Ok(Err(e)) => {
            machine.abort();
            Err(e)
        }
        Err(_) => {
            machine.abort();
            Err(SessionError::Timeout(within))
        }
    }
}

/// Accepting side of the handshake.
pub async fn accept<R, W>(
    chan: &mut LineChannel<R, W>,
    expected_identifier: Option<String>,
    within: Duration,
) -> Result<Authenticated, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut machine = Responder::new(expected_identifier);
    let result = timeout(within, async {
        let identifier = chan.read_line().await?;
        let challenge = machine.on_identifier(&identifier)?;
        chan.write_line(&challenge).await?;
        let response = chan.read_line().await?;
        Ok::<_, SessionError>(machine.on_response(&response)?)
    })
    .await;
    match result {
        Ok(Ok(auth)) => Ok(auth),
        Ok(Err(e)) => {
            machine.abort();
            Err(e)
        }
        Err(_) => {
            machine.abort();
            Err(SessionError::Timeout(within))
        }
    }
}

/// An open connection. Owned by the host on behalf of the controller.
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub peer_identifier: Option<String>,
    /// The handshake completed and produced keys.
    pub authenticated: bool,
    transport: Arc<MessageTransport>,
    outbox: mpsc::Sender<ChatMessage>,
}

impl Session {
    /// Wrap an open transport. Outgoing records are queued and written in order
    /// by one writer task. A failed write closes the transport, and the receive
    /// loop reports the failure as its close reason.
    pub fn new(
        id: SessionId,
        role: Role,
        peer_identifier: Option<String>,
        authenticated: bool,
        transport: Arc<MessageTransport>,
    ) -> Self {
        let (outbox, mut rx) = mpsc::channel::<ChatMessage>(OUTBOX_CAPACITY);
        let writer = transport.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match writer.send(&message).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        warn!(session = %id, error = %e, "send failed");
                        writer.fail(format!("send failed: {e}")).await;
                        break;
                    }
                }
            }
        });
        debug!(session = %id, ?role, authenticated, "session open");
        Self {
            id,
            role,
            peer_identifier,
            authenticated,
            transport,
            outbox,
        }
    }

    /// Queue a record for sending. A full queue is reported, not waited on.
    pub fn send(&self, message: ChatMessage) -> Result<(), TransportError> {
        if self.transport.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbox.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub async fn close(&self) {
        debug!(session = %self.id, role = ?self.role, "closing session");
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type Chan = LineChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Chan, Chan) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (LineChannel::new(ar, aw), LineChannel::new(br, bw))
    }

    const WITHIN: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn same_identifier_authenticates() {
        let (mut client, mut server) = pair();
        let responder = tokio::spawn(async move {
            accept(&mut server, Some("816012345".into()), WITHIN).await
        });
        let keys = initiate(&mut client, "816012345", WITHIN).await.unwrap();
        let auth = responder.await.unwrap().unwrap();
        assert_eq!(auth.peer_identifier, "816012345");
        assert_eq!(auth.keys, keys);
    }

    #[tokio::test]
    async fn different_identifier_fails() {
        let (mut client, mut server) = pair();
        let responder = tokio::spawn(async move {
            accept(&mut server, Some("816012345".into()), WITHIN).await
        });
        // The initiator cannot tell; it only learns when the stream closes.
        let _ = initiate(&mut client, "816000000", WITHIN).await;
        assert!(matches!(
            responder.await.unwrap(),
            Err(SessionError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn silent_responder_times_out() {
        let (mut client, _server) = pair();
        let err = initiate(&mut client, "816012345", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_stream_fails_handshake() {
        let (mut client, server) = pair();
        drop(server);
        let err = initiate(&mut client, "816012345", WITHIN).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn responder_rejects_empty_identifier() {
        let (mut client, mut server) = pair();
        let responder = tokio::spawn(async move { accept(&mut server, None, WITHIN).await });
        client.write_line("").await.unwrap();
        assert!(matches!(
            responder.await.unwrap(),
            Err(SessionError::Handshake(HandshakeError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn tcp_connect_and_accept_on_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let stream = accept_stream(&listener, WITHIN).await.unwrap();
            let (r, w) = stream.into_split();
            let mut chan = LineChannel::new(r, w);
            accept(&mut chan, None, WITHIN).await.map(|a| a.peer_identifier)
        });
        let stream = connect(addr, WITHIN).await.unwrap();
        let (r, w) = stream.into_split();
        let mut chan = LineChannel::new(r, w);
        initiate(&mut chan, "816012345", WITHIN).await.unwrap();
        assert_eq!(server.await.unwrap().unwrap(), "816012345");
    }

    #[tokio::test]
    async fn accept_times_out_without_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            accept_stream(&listener, Duration::from_millis(50)).await,
            Err(SessionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn session_queue_preserves_order() {
        let (a, b) = duplex(1 << 16);
        let (_ar, aw) = split(a);
        let transport = Arc::new(MessageTransport::new(aw, None));
        let session = Session::new(SessionId::new(1), Role::Initiator, None, false, transport);
        assert!(!session.authenticated);
        for i in 0..10 {
            session.send(ChatMessage::new(i.to_string(), "x")).unwrap();
        }
        let (br, bw) = split(b);
        let mut chan = LineChannel::new(br, bw);
        for i in 0..10 {
            let line = chan.read_line().await.unwrap();
            let msg = nearchat_core::decode_line(&line, None).unwrap();
            assert_eq!(msg.message, i.to_string());
        }
        session.close().await;
        assert!(session.send(ChatMessage::new("late", "x")).is_err());
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_error_closes_and_reports_to_owner() {
        let (a, _b) = duplex(4096);
        let (ar, _aw) = split(a);
        let transport = Arc::new(MessageTransport::new(BrokenPipe, None));
        let (tx, mut events) = mpsc::unbounded_channel();
        transport.start(tokio::io::BufReader::new(ar), move |ev| {
            let _ = tx.send(ev);
        });
        let owned = transport.clone();
        let session = Session::new(SessionId::new(2), Role::Responder, None, true, owned);
        session.send(ChatMessage::new("hello", "x")).unwrap();
        let event = timeout(WITHIN, events.recv()).await.unwrap().unwrap();
        match event {
            TransportEvent::Closed { error: Some(reason) } => {
                assert!(reason.starts_with("send failed"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(transport.is_closed());
        assert!(matches!(
            session.send(ChatMessage::new("late", "x")),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn stalled_peer_fills_outbox() {
        let (a, _b) = duplex(64);
        let (_ar, aw) = split(a);
        let transport = Arc::new(MessageTransport::new(aw, None));
        let session = Session::new(SessionId::new(3), Role::Initiator, None, false, transport);
        let text = "q".repeat(1024);
        let mut refused = None;
        for i in 0..OUTBOX_CAPACITY * 2 {
            if let Err(e) = session.send(ChatMessage::new(text.clone(), "x")) {
                refused = Some((i, e));
                break;
            }
            tokio::task::yield_now().await;
        }
        let (at, err) = refused.expect("outbox never filled");
        assert!(matches!(err, TransportError::QueueFull));
        assert!(at <= OUTBOX_CAPACITY + 1);
        tokio::time::timeout(WITHIN, session.close()).await.unwrap();
    }
}
