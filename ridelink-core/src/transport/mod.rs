//! Physical transports behind the pipe.
//!
//! Every medium implements [`Transport`]: connect to an address, write
//! one frame at a time, and run a reader task that pushes inbound frames
//! to the installed [`FrameHandler`] (or queues them for
//! [`Transport::receive`] when no handler is installed).
//!
//! - [`StreamTransport`]: `host:port` TCP stream.
//! - [`RadioTransport`]: paired-device serial profile via its device node.
//! - [`MockTransport`]: scripted in-memory transport for tests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LinkError;

pub mod mock;
pub mod radio;
pub mod stream;

pub use mock::MockTransport;
pub use radio::{RadioSettings, RadioTransport};
pub use stream::{StreamSettings, StreamTransport};

/// Callback invoked with every inbound frame, delimiter stripped.
pub type FrameHandler = Arc<dyn Fn(String) + Send + Sync>;

// ── TransportKind ────────────────────────────────────────────────

/// Which physical medium a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP-style stream socket addressed by `host:port`.
    Stream,
    /// Short-range radio serial link addressed by peer identifier.
    #[default]
    Radio,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Radio => write!(f, "radio"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(Self::Stream),
            "radio" | "bluetooth" | "bt" => Ok(Self::Radio),
            other => Err(LinkError::Other(format!("unknown transport kind: {other}"))),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────

/// One physical medium carrying newline-delimited frames.
///
/// Implementations keep `is_connected() == true` only while both the
/// reader and the writer of the current link are usable. Reader tasks
/// never restart themselves; reconnecting is the caller's decision.
#[async_trait]
pub trait Transport: Send {
    /// The medium this transport drives.
    fn kind(&self) -> TransportKind;

    /// Open the medium and start the reader task.
    ///
    /// An existing link is torn down first.
    async fn connect(&mut self, address: &str) -> Result<(), LinkError>;

    /// Close the current link. Idempotent, never fails.
    async fn disconnect(&mut self);

    /// Write one frame and flush it before returning.
    async fn send(&mut self, line: &str) -> Result<(), LinkError>;

    /// Wait for the next frame not consumed by an incoming handler.
    async fn receive(&mut self) -> Result<String, LinkError>;

    /// Whether the current link is believed alive.
    fn is_connected(&self) -> bool;

    /// Install the single inbound handler, replacing any previous one.
    fn set_incoming_handler(&mut self, handler: FrameHandler);
}

// ── FrameSink ────────────────────────────────────────────────────

/// Shared slot holding the installed incoming handler.
pub(crate) type HandlerSlot = Arc<RwLock<Option<FrameHandler>>>;

/// Delivery end used by reader tasks.
///
/// Frames go to the installed handler, synchronously on the reader's
/// task, or into the link's receive queue when no handler is set.
#[derive(Clone)]
pub(crate) struct FrameSink {
    handler: HandlerSlot,
    queue: mpsc::UnboundedSender<String>,
}

impl FrameSink {
    /// Create a sink for a fresh link plus the receive side of its queue.
    pub(crate) fn new(handler: HandlerSlot) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (queue, rx) = mpsc::unbounded_channel();
        (Self { handler, queue }, rx)
    }

    pub(crate) fn deliver(&self, line: String) {
        // Clone out of the lock so a slow handler never blocks replacement.
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(line),
            None => {
                let _ = self.queue.send(line);
            }
        }
    }
}

/// Pull the next queued frame of a link.
pub(crate) async fn next_queued(
    inbox: Option<&mut mpsc::UnboundedReceiver<String>>,
) -> Result<String, LinkError> {
    match inbox {
        None => Err(LinkError::NotConnected),
        Some(rx) => rx.recv().await.ok_or(LinkError::Closed),
    }
}

// ── TransportFactory ─────────────────────────────────────────────

/// Builds a fresh transport for a medium.
pub trait TransportFactory: Send + Sync {
    fn build(&self, kind: TransportKind) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(TransportKind) -> Box<dyn Transport> + Send + Sync,
{
    fn build(&self, kind: TransportKind) -> Box<dyn Transport> {
        self(kind)
    }
}

/// Factory producing the real stream and radio transports.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    pub stream: StreamSettings,
    pub radio: RadioSettings,
}

impl DefaultTransportFactory {
    pub fn new(stream: StreamSettings, radio: RadioSettings) -> Self {
        Self { stream, radio }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::Stream => Box::new(StreamTransport::new(self.stream.clone())),
            TransportKind::Radio => Box::new(RadioTransport::new(self.radio.clone())),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
