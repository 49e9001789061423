//! TCP stream transport.
//!
//! Addresses are `host:port`. Each link splits the socket into owned
//! halves: the read half feeds a reader task through [`LineCodec`], the
//! write half stays with the transport and is flushed on every send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::{LineCodec, preview};
use crate::error::LinkError;
use crate::transport::{
    FrameHandler, FrameSink, HandlerSlot, Transport, TransportKind, next_queued,
};

/// Default connect timeout, matching the radio side.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ── StreamSettings ───────────────────────────────────────────────

/// Tuning for [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// How long a connect may take before it fails.
    pub connect_timeout: Duration,
    /// Disable Nagle so small frames leave immediately.
    pub nodelay: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

// ── Address parsing ──────────────────────────────────────────────

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_host_port(address: &str) -> Result<(String, u16), LinkError> {
    let malformed = || LinkError::MalformedAddress(format!("expected host:port, got {address:?}"));

    let (host, port) = address.trim().rsplit_once(':').ok_or_else(malformed)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(malformed());
    }
    let port: u16 = port.parse().map_err(|_| malformed())?;
    Ok((host.to_string(), port))
}

// ── StreamTransport ──────────────────────────────────────────────

struct StreamLink {
    peer: String,
    writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// `host:port` TCP transport.
pub struct StreamTransport {
    settings: StreamSettings,
    handler: HandlerSlot,
    link: Option<StreamLink>,
    inbox: Option<mpsc::UnboundedReceiver<String>>,
}

impl StreamTransport {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            handler: Arc::new(RwLock::new(None)),
            link: None,
            inbox: None,
        }
    }

    /// Adopt an already-connected socket (accepted or dialled elsewhere).
    pub fn from_stream(stream: TcpStream, settings: StreamSettings) -> Result<Self, LinkError> {
        let mut transport = Self::new(settings);
        transport.attach(stream)?;
        Ok(transport)
    }

    /// Address of the connected peer, if any.
    pub fn peer(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.peer.as_str())
    }

    fn attach(&mut self, stream: TcpStream) -> Result<(), LinkError> {
        if self.settings.nodelay {
            stream.set_nodelay(true)?;
        }
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());

        let (read_half, write_half) = stream.into_split();
        let alive = Arc::new(AtomicBool::new(true));
        let (sink, inbox) = FrameSink::new(self.handler.clone());

        let reader = tokio::spawn(read_frames(
            FramedRead::new(read_half, LineCodec::new()),
            sink,
            alive.clone(),
            peer.clone(),
        ));

        self.link = Some(StreamLink {
            peer,
            writer: FramedWrite::new(write_half, LineCodec::new()),
            alive,
            reader,
        });
        self.inbox = Some(inbox);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.alive.store(false, Ordering::SeqCst);
            link.reader.abort();
            info!(peer = %link.peer, "stream link closed");
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(&mut self, address: &str) -> Result<(), LinkError> {
        self.teardown();

        let (host, port) = parse_host_port(address)?;
        let timeout = self.settings.connect_timeout;
        debug!(address, "stream connecting");

        let connecting = TcpStream::connect((host.as_str(), port));
        let stream = match tokio::time::timeout(timeout, connecting).await {
            Err(_) => {
                return Err(LinkError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                });
            }
            Ok(Err(e)) => {
                return Err(LinkError::Connect {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };

        self.attach(stream)?;
        info!(address, "stream connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.teardown();
        self.inbox = None;
    }

    async fn send(&mut self, line: &str) -> Result<(), LinkError> {
        let link = match self.link.as_mut() {
            Some(link) if link.alive.load(Ordering::SeqCst) => link,
            _ => return Err(LinkError::NotConnected),
        };

        match link.writer.send(line).await {
            Ok(()) => {}
            Err(LinkError::Io(e)) => {
                self.teardown();
                return Err(LinkError::Write(e));
            }
            // Framing rejections leave the link intact.
            Err(e) => return Err(e),
        }

        // The reader may have seen EOF while the write sat in the kernel.
        if !link.alive.load(Ordering::SeqCst) {
            self.teardown();
            return Err(LinkError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link dropped during write",
            )));
        }
        debug!(frame = %preview(line), "stream frame sent");
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, LinkError> {
        next_queued(self.inbox.as_mut()).await
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.alive.load(Ordering::SeqCst))
    }

    fn set_incoming_handler(&mut self, handler: FrameHandler) {
        *self.handler.write() = Some(handler);
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Reader task: forward frames until EOF or a read fault, then mark the
/// link dead. It never reconnects.
pub(crate) async fn read_frames<R>(
    mut frames: FramedRead<R, LineCodec>,
    sink: FrameSink,
    alive: Arc<AtomicBool>,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    while let Some(result) = frames.next().await {
        match result {
            Ok(line) => {
                debug!(%peer, frame = %preview(&line), "frame received");
                sink.deliver(line);
            }
            Err(e) => {
                warn!(%peer, "read error: {e}");
                break;
            }
        }
        if !alive.load(Ordering::SeqCst) {
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
    debug!(%peer, "reader ended");
}

// ── Tests ────────────────────────────────────────────────────────
