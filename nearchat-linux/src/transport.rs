//! Line transport over a connected stream: a plain line channel used for the
//! handshake, then the message transport with one background receive loop and a
//! mutex-guarded write path.

use std::sync::atomic::{AtomicBool, Ordering};

use nearchat_core::wire::{self, LineDecodeError, LineEncodeError, MAX_LINE_LEN};
use nearchat_core::{ChatMessage, SessionKeys};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] LineEncodeError),
    #[error("line too long")]
    LineTooLong,
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    #[error("connection closed")]
    Closed,
    #[error("send queue full")]
    QueueFull,
}

enum ReadOutcome {
    Line(String),
    Oversized,
    InvalidUtf8,
    Eof,
}

/// Read one record of at most `MAX_LINE_LEN` bytes, not counting its `\n` or
/// `\r\n` terminator. An oversized record is consumed up to its terminator and
/// reported as such.
async fn read_record<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<ReadOutcome> {
    let limit = MAX_LINE_LEN as u64 + 2;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(ReadOutcome::Eof);
    }
    if buf.last() != Some(&b'\n') && n as u64 == limit {
        loop {
            buf.clear();
            let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            if buf.last() == Some(&b'\n') {
                return Ok(ReadOutcome::Oversized);
            }
        }
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_LINE_LEN {
        return Ok(ReadOutcome::Oversized);
    }
    match String::from_utf8(buf) {
        Ok(line) => Ok(ReadOutcome::Line(line)),
        Err(_) => Ok(ReadOutcome::InvalidUtf8),
    }
}

/// Raw line exchange, used before the receive loop exists.
pub struct LineChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next line without its terminator. End of stream is `Closed`.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        match read_record(&mut self.reader).await? {
            ReadOutcome::Line(line) => Ok(line),
            ReadOutcome::Oversized => Err(TransportError::LineTooLong),
            ReadOutcome::InvalidUtf8 => Err(TransportError::InvalidUtf8),
            ReadOutcome::Eof => Err(TransportError::Closed),
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut out = String::with_capacity(line.len() + 1);
        out.push_str(line);
        out.push('\n');
        self.writer.write_all(out.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Buffered reader (keeps anything read past the last line) and writer.
    pub fn into_parts(self) -> (BufReader<R>, W) {
        (self.reader, self.writer)
    }
}

/// Delivered to the owner's callback from the receive loop's task.
#[derive(Debug)]
pub enum TransportEvent {
    Message(ChatMessage),
    /// Loop ended. `error` is `None` for end of stream or a local close, and
    /// carries the reason for a read or write failure.
    Closed { error: Option<String> },
}

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Seen by the receive loop and by in-flight sends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed { error: Option<String> },
}

/// Steady-state chat transport. With `keys`, message text is encrypted on the wire.
pub struct MessageTransport {
    writer: Mutex<Option<BoxedWriter>>,
    keys: Option<SessionKeys>,
    started: AtomicBool,
    closed: AtomicBool,
    lifecycle: watch::Sender<Lifecycle>,
}

impl MessageTransport {
    /// Write side only; call [`start`](Self::start) to begin receiving.
    pub fn new<W>(writer: W, keys: Option<SessionKeys>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        Self {
            writer: Mutex::new(Some(Box::new(writer))),
            keys,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lifecycle,
        }
    }

    /// Take both halves of a connected stream and start the receive loop.
    #[cfg(test)]
    pub fn open<R, W, F>(reader: R, writer: W, keys: Option<SessionKeys>, on_event: F) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        let transport = Self::new(writer, keys);
        transport.start(reader, on_event);
        transport
    }

    /// Spawn the receive loop. Only the first call has an effect.
    pub fn start<R, F>(&self, reader: R, on_event: F)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("receive loop already running");
            return;
        }
        let lifecycle = self.lifecycle.subscribe();
        let keys = self.keys.clone();
        tokio::spawn(receive_loop(reader, keys, lifecycle, on_event));
    }

    /// Serialize and write one record, then flush. Writers are serialized, and
    /// a close abandons a write the peer is not draining.
    pub async fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        let mut lifecycle = self.lifecycle.subscribe();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut line = wire::encode_line(message, self.keys.as_ref())?;
        line.push('\n');
        tokio::select! {
            r = self.write_record(&line) => r,
            _ = lifecycle.changed() => Err(TransportError::Closed),
        }
    }

    async fn write_record(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the stream and release the receive loop. Later calls do nothing.
    pub async fn close(&self) {
        self.shut(None).await;
    }

    /// Close after a failed write. The receive loop reports `reason` as the
    /// close error.
    pub async fn fail(&self, reason: String) {
        self.shut(Some(reason)).await;
    }

    async fn shut(&self, error: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Pending sends drop the writer lock when they see this.
        self.lifecycle.send_replace(Lifecycle::Closed { error });
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "shutdown on close");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn receive_loop<R, F>(
    mut reader: R,
    keys: Option<SessionKeys>,
    mut lifecycle: watch::Receiver<Lifecycle>,
    on_event: F,
) where
    R: AsyncBufRead + Unpin + Send,
    F: Fn(TransportEvent),
{
    let error = loop {
        let state = lifecycle.borrow_and_update().clone();
        if let Lifecycle::Closed { error } = state {
            break error;
        }
        let outcome = tokio::select! {
            r = read_record(&mut reader) => r,
            _ = lifecycle.changed() => continue,
        };
        match outcome {
            Ok(ReadOutcome::Line(line)) => match wire::decode_line(&line, keys.as_ref()) {
                Ok(message) => on_event(TransportEvent::Message(message)),
                Err(LineDecodeError::Empty) => {}
                Err(e) => warn!(error = %e, "dropping malformed line"),
            },
            Ok(ReadOutcome::Oversized) => warn!("dropping oversized line"),
            Ok(ReadOutcome::InvalidUtf8) => warn!("dropping non utf-8 line"),
            Ok(ReadOutcome::Eof) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };
    debug!(?error, "receive loop finished");
    on_event(TransportEvent::Closed { error });
}
