//! Passive endpoint for the display role.
//!
//! The [`Listener`] accepts one source connection at a time, hands every
//! inbound frame to a caller-supplied handler and keeps the write side of
//! that connection as the return path for [`Listener::send_reverse`].
//! A newer inbound connection replaces the current one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{LineCodec, MAX_FRAME_LEN, preview, validate_payload};
use crate::error::LinkError;
use crate::transport::FrameHandler;

/// Port the display side listens on by default.
pub const DEFAULT_LISTEN_PORT: u16 = 6000;

const BACKLOG: u32 = 16;

/// Pause after a failed `accept` so a persistent fault (fd exhaustion)
/// does not spin.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Upper bound on one reverse write to a source that stopped reading.
const REVERSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type ReverseWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, LineCodec>>>;

#[derive(Clone)]
struct ReturnPath {
    id: u64,
    peer: SocketAddr,
    writer: ReverseWriter,
}

struct Inbound {
    id: u64,
    peer: SocketAddr,
    frames: FramedRead<OwnedReadHalf, LineCodec>,
}

/// Accepting endpoint with a single reverse channel.
///
/// Clones share the bound socket and the return path, so one clone can
/// drive [`Listener::run`] while another sends replies.
#[derive(Clone)]
pub struct Listener {
    socket: Arc<TcpListener>,
    local: SocketAddr,
    path: Arc<Mutex<Option<ReturnPath>>>,
    next_id: Arc<AtomicU64>,
}

impl Listener {
    /// Bind once with address reuse enabled.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let socket = socket.listen(BACKLOG)?;
        let local = socket.local_addr()?;
        info!(%local, "listener bound");

        Ok(Self {
            socket: Arc::new(socket),
            local,
            path: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether a return path is currently held.
    pub async fn has_peer(&self) -> bool {
        self.path.lock().await.is_some()
    }

    /// Accept and read until `cancel` fires.
    ///
    /// Frames reach `on_frame` on this task, delimiter stripped. `role`
    /// tags the log lines.
    pub async fn run(
        &self,
        on_frame: FrameHandler,
        role: &str,
        cancel: CancellationToken,
    ) -> Result<(), LinkError> {
        info!(role, local = %self.local, "accepting connections");
        let mut current: Option<Inbound> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = self.socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Some(old) = current.take() {
                            info!(
                                role,
                                old = %old.peer,
                                new = %peer,
                                "newer connection replaces current peer"
                            );
                        } else {
                            info!(role, %peer, "peer connected");
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, "set_nodelay failed: {e}");
                        }
                        let (read_half, write_half) = stream.into_split();
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        *self.path.lock().await = Some(ReturnPath {
                            id,
                            peer,
                            writer: Arc::new(Mutex::new(FramedWrite::new(
                                write_half,
                                LineCodec::new(),
                            ))),
                        });
                        current = Some(Inbound {
                            id,
                            peer,
                            frames: FramedRead::new(read_half, LineCodec::new()),
                        });
                    }
                    Err(e) => {
                        warn!(role, "accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY).await;
                    }
                },

                frame = next_frame(&mut current) => match frame {
                    Some(Ok(line)) => {
                        debug!(role, frame = %preview(&line), "frame received");
                        on_frame(line);
                    }
                    Some(Err(e)) => {
                        if let Some(inbound) = current.take() {
                            warn!(role, peer = %inbound.peer, "read error, dropping peer: {e}");
                            self.clear_path(inbound.id).await;
                        }
                    }
                    None => {
                        if let Some(inbound) = current.take() {
                            info!(role, peer = %inbound.peer, "peer disconnected");
                            self.clear_path(inbound.id).await;
                        }
                    }
                },
            }
        }

        *self.path.lock().await = None;
        info!(role, "listener stopped");
        Ok(())
    }

    /// Write one frame back to the connected source.
    ///
    /// The return path lock is not held during the write, so a source
    /// that stops reading stalls only this call, for at most
    /// `REVERSE_WRITE_TIMEOUT`, never the accept loop.
    pub async fn send_reverse(&self, line: &str) -> Result<(), LinkError> {
        validate_payload(line, MAX_FRAME_LEN)?;

        let current = self.path.lock().await.clone();
        let Some(ret) = current else {
            warn!(frame = %preview(line), "no peer connected, reverse frame dropped");
            return Err(LinkError::NoPeer);
        };

        let written = {
            let mut writer = ret.writer.lock().await;
            tokio::time::timeout(REVERSE_WRITE_TIMEOUT, writer.send(line)).await
        };
        let error = match written {
            Ok(Ok(())) => {
                debug!(peer = %ret.peer, frame = %preview(line), "reverse frame sent");
                return Ok(());
            }
            Ok(Err(LinkError::Io(io))) => LinkError::Write(io),
            Ok(Err(other)) => other,
            Err(_) => LinkError::Write(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "source stopped reading",
            )),
        };
        warn!(peer = %ret.peer, "reverse write failed, clearing return path: {error}");
        self.clear_path(ret.id).await;
        Err(error)
    }

    async fn clear_path(&self, id: u64) {
        let mut path = self.path.lock().await;
        if path.as_ref().is_some_and(|p| p.id == id) {
            *path = None;
        }
    }
}

/// Next frame of the current connection; pends while there is none.
async fn next_frame(current: &mut Option<Inbound>) -> Option<Result<String, LinkError>> {
    match current {
        Some(inbound) => inbound.frames.next().await,
        None => std::future::pending().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────
