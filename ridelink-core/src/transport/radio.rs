//! Radio transport over the paired-device serial profile.
//!
//! The host's Bluetooth stack binds the serial profile of a paired peer to
//! a device node (`/dev/rfcomm0` and friends). Peers are addressed either
//! by their Bluetooth address, resolved through [`RadioSettings::devices`],
//! or by the device path itself.
//!
//! `serialport` is blocking, so the reader loop runs on a blocking thread
//! with a short read timeout that lets it notice a local disconnect, and
//! each write is handed to the blocking pool and flushed before `send`
//! returns.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::codec::{LineCodec, preview};
use crate::error::LinkError;
use crate::transport::{
    FrameHandler, FrameSink, HandlerSlot, Transport, TransportKind, next_queued,
};

/// Read timeout of the blocking reader; bounds how long a disconnected
/// reader thread lingers.
const READ_POLL: Duration = Duration::from_millis(200);

// ── RadioSettings ────────────────────────────────────────────────

/// Tuning and peer table for [`RadioTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSettings {
    /// Line speed of the serial device.
    pub baud_rate: u32,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bluetooth address → bound serial device node.
    pub devices: HashMap<String, PathBuf>,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            connect_timeout_ms: 2000,
            devices: HashMap::new(),
        }
    }
}

impl RadioSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Map a peer identifier to the device node to open.
    pub fn resolve(&self, peer: &str) -> Result<PathBuf, LinkError> {
        let peer = peer.trim();
        if peer.starts_with('/') {
            return Ok(PathBuf::from(peer));
        }
        if !is_peer_address(peer) {
            return Err(LinkError::MalformedAddress(format!(
                "expected AA:BB:CC:DD:EE:FF or a device path, got {peer:?}"
            )));
        }
        self.devices
            .iter()
            .find(|(addr, _)| addr.eq_ignore_ascii_case(peer))
            .map(|(_, path)| path.clone())
            .ok_or_else(|| {
                LinkError::MediumUnavailable(format!("no serial device bound for peer {peer}"))
            })
    }
}

/// Whether `s` is a colon-separated 48-bit Bluetooth address.
pub fn is_peer_address(s: &str) -> bool {
    let groups: Vec<&str> = s.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

// ── RadioTransport ───────────────────────────────────────────────

struct RadioLink {
    peer: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Serial-profile transport to a paired peer.
pub struct RadioTransport {
    settings: RadioSettings,
    handler: HandlerSlot,
    codec: LineCodec,
    link: Option<RadioLink>,
    inbox: Option<mpsc::UnboundedReceiver<String>>,
}

impl RadioTransport {
    pub fn new(settings: RadioSettings) -> Self {
        Self {
            settings,
            handler: Arc::new(RwLock::new(None)),
            codec: LineCodec::new(),
            link: None,
            inbox: None,
        }
    }

    /// Close the link, returning the reader so a reconnect can wait for it.
    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        let link = self.link.take()?;
        // The reader thread owns a cloned handle and exits on its next poll.
        link.alive.store(false, Ordering::SeqCst);
        info!(peer = %link.peer, "radio link closed");
        Some(link.reader)
    }

    fn open(path: &Path, baud_rate: u32) -> Result<Box<dyn SerialPort>, LinkError> {
        if !path.exists() {
            return Err(LinkError::MediumUnavailable(format!(
                "serial device {} not present",
                path.display()
            )));
        }
        let builder = serialport::new(path.to_string_lossy(), baud_rate).timeout(READ_POLL);
        #[cfg(unix)]
        {
            // Not exclusive: the device is reopened after every link drop.
            let mut port = serialport::TTYPort::open(&builder)?;
            port.set_exclusive(false)?;
            Ok(Box::new(port))
        }
        #[cfg(not(unix))]
        {
            Ok(builder.open()?)
        }
    }
}

#[async_trait]
impl Transport for RadioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn connect(&mut self, address: &str) -> Result<(), LinkError> {
        // The old reader must release its handle before the device is reopened.
        if let Some(reader) = self.teardown() {
            let _ = reader.await;
        }

        let path = self.settings.resolve(address)?;
        let baud = self.settings.baud_rate;
        let timeout = self.settings.connect_timeout();
        debug!(peer = address, device = %path.display(), "radio connecting");

        let opening = tokio::task::spawn_blocking(move || Self::open(&path, baud));
        let port = match tokio::time::timeout(timeout, opening).await {
            Err(_) => {
                return Err(LinkError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                });
            }
            Ok(Err(join)) => return Err(LinkError::Other(format!("radio open task: {join}"))),
            Ok(Ok(Err(LinkError::Other(reason)))) => {
                return Err(LinkError::Connect {
                    address: address.to_string(),
                    reason,
                });
            }
            Ok(Ok(result)) => result?,
        };

        let reader_port = port.try_clone()?;
        let alive = Arc::new(AtomicBool::new(true));
        let (sink, inbox) = FrameSink::new(self.handler.clone());

        let reader_alive = alive.clone();
        let peer = address.to_string();
        let reader = tokio::task::spawn_blocking(move || {
            read_serial(reader_port, sink, reader_alive, peer)
        });

        self.link = Some(RadioLink {
            peer: address.to_string(),
            port: Arc::new(Mutex::new(port)),
            alive,
            reader,
        });
        self.inbox = Some(inbox);
        info!(peer = address, "radio connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        let _ = self.teardown();
        self.inbox = None;
    }

    async fn send(&mut self, line: &str) -> Result<(), LinkError> {
        let (port, alive) = match self.link.as_ref() {
            Some(link) if link.alive.load(Ordering::SeqCst) => {
                (link.port.clone(), link.alive.clone())
            }
            _ => return Err(LinkError::NotConnected),
        };

        let mut frame = BytesMut::new();
        self.codec.encode(line, &mut frame)?;

        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut port = port.lock();
            port.write_all(&frame)?;
            port.flush()
        })
        .await
        .map_err(|join| LinkError::Other(format!("radio write task: {join}")))?;

        if let Err(e) = written {
            let _ = self.teardown();
            return Err(LinkError::Write(e));
        }
        if !alive.load(Ordering::SeqCst) {
            let _ = self.teardown();
            return Err(LinkError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link dropped during write",
            )));
        }
        debug!(frame = %preview(line), "radio frame sent");
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

impl Drop for RadioTransport {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Blocking reader loop over a serial handle.
fn read_serial(
    mut port: Box<dyn SerialPort>,
    sink: FrameSink,
    alive: Arc<AtomicBool>,
    peer: String,
) {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 1024];

    'link: while alive.load(Ordering::SeqCst) {
        match port.read(&mut chunk) {
            Ok(0) => {
                debug!(%peer, "radio peer hung up");
                break;
            }
            Ok(_) if !alive.load(Ordering::SeqCst) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(%peer, "radio read error: {e}");
                break;
            }
        }

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(line)) => {
                    debug!(%peer, frame = %preview(&line), "frame received");
                    sink.deliver(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, "radio framing error: {e}");
                    break 'link;
                }
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    debug!(%peer, "radio reader ended");
}

// ── Tests ────────────────────────────────────────────────────────
