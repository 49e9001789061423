//! Persistent, self-healing message pipe.
//!
//! A [`Pipe`] owns one [`Transport`] and a single worker task. Callers
//! push payloads with [`Pipe::send`], which never blocks on I/O: the
//! payload is queued and the worker (re)establishes the transport as
//! needed, then writes it. Inbound frames on the live link go to the
//! last non-`None` reply handler supplied to `send`.
//!
//! ```text
//!  send() ──► gate ──► queue ──► worker ──► ensure_link ──► transport.send
//!                                             │   ▲
//!                                    connect fails, sleep backoff
//! ```
//!
//! The service gate (`set_active`) is the only cancellation primitive.
//! It is checked before every connect attempt and cuts the backoff sleep
//! short. An in-flight connect is not interrupted.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{MutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{MAX_FRAME_LEN, preview, validate_payload};
use crate::error::LinkError;
use crate::transport::{FrameHandler, HandlerSlot, Transport, TransportKind};

/// Wait between failed connect attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Frames that may wait for the worker before `send` rejects.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ── PipeSettings ─────────────────────────────────────────────────

/// Tuning for [`Pipe`].
#[derive(Debug, Clone)]
pub struct PipeSettings {
    pub backoff: Duration,
    pub queue_capacity: usize,
    pub max_frame_len: usize,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

/// Outcome of one queued payload.
///
/// Dropping it is the fire-and-forget path; awaiting [`Delivery::wait`]
/// reports whether the worker wrote the frame.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), LinkError>>,
}

impl Delivery {
    /// Resolve once the worker has written or abandoned the payload.
    pub async fn wait(self) -> Result<(), LinkError> {
        self.rx.await.unwrap_or(Err(LinkError::Closed))
    }
}

struct Outbound {
    payload: String,
    done: oneshot::Sender<Result<(), LinkError>>,
}

// ── Shared state ─────────────────────────────────────────────────

struct Link {
    transport: Box<dyn Transport>,
    address: String,
}

struct Shared {
    /// Service gate; receivers double as the backoff wake-up.
    active: watch::Sender<bool>,
    /// Last non-`None` reply handler.
    reply: HandlerSlot,
    link: tokio::sync::Mutex<Link>,
    settings: PipeSettings,
}

impl Shared {
    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Handler installed on every fresh link: forwards to whatever reply
    /// handler is current when the frame arrives.
    fn forwarder(&self) -> FrameHandler {
        let reply = self.reply.clone();
        Arc::new(move |line: String| {
            let handler = reply.read().clone();
            match handler {
                Some(handler) => handler(line),
                None => debug!(frame = %preview(&line), "reply dropped: no handler installed"),
            }
        })
    }

    /// Return the link with a healthy transport, connecting as needed.
    ///
    /// Fails only with [`LinkError::Inactive`] once the gate closes.
    async fn ensure_link(
        &self,
        gate: &mut watch::Receiver<bool>,
    ) -> Result<MutexGuard<'_, Link>, LinkError> {
        loop {
            if !self.is_active() {
                return Err(LinkError::Inactive);
            }
            let mut link = self.link.lock().await;
            if !self.is_active() {
                return Err(LinkError::Inactive);
            }
            if link.transport.is_connected() {
                return Ok(link);
            }

            let address = link.address.clone();
            let kind = link.transport.kind();
            let forwarder = self.forwarder();
            link.transport.set_incoming_handler(forwarder);
            info!(%address, %kind, "establishing pipe");

            let connected = link.transport.connect(&address).await;
            match connected {
                Ok(()) => {
                    if !self.is_active() {
                        link.transport.disconnect().await;
                        return Err(LinkError::Inactive);
                    }
                    info!(%address, %kind, "pipe established");
                    return Ok(link);
                }
                Err(e) => {
                    drop(link);
                    let backoff = self.settings.backoff;
                    if e.is_retryable() {
                        info!(%address, "peer not ready ({e}), retrying in {backoff:?}");
                    } else {
                        warn!(%address, "connect failed ({e}), retrying in {backoff:?}");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.backoff) => {}
                _ = gate_closed(gate) => {}
            }
        }
    }

    async fn deliver(
        &self,
        payload: &str,
        gate: &mut watch::Receiver<bool>,
    ) -> Result<(), LinkError> {
        let mut link = self.ensure_link(gate).await?;
        let written = link.transport.send(payload).await;
        match written {
            Ok(()) => {
                debug!(frame = %preview(payload), "frame pushed");
                Ok(())
            }
            Err(e) => {
                warn!("send failed, dropping link: {e}");
                link.transport.disconnect().await;
                Err(e)
            }
        }
    }
}

/// Resolve when the gate reads closed.
async fn gate_closed(gate: &mut watch::Receiver<bool>) {
    while *gate.borrow_and_update() {
        if gate.changed().await.is_err() {
            // Sender gone: the gate can no longer close.
            std::future::pending::<()>().await;
        }
    }
}

async fn run_worker(shared: Arc<Shared>, mut queue: mpsc::Receiver<Outbound>) {
    let mut gate = shared.active.subscribe();
    while let Some(Outbound { payload, done }) = queue.recv().await {
        let result = shared.deliver(&payload, &mut gate).await;
        if let Err(e) = &result {
            debug!("frame not delivered: {e}");
        }
        let _ = done.send(result);
    }
    debug!("pipe worker stopped");
}

// ── Pipe ─────────────────────────────────────────────────────────

/// Persistent reconnecting sender/receiver over one transport.
///
/// Must be created inside a Tokio runtime. The pipe starts inactive;
/// its owner opens the gate with [`Pipe::set_active`] once the service
/// is running.
pub struct Pipe {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Outbound>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipe {
    pub fn new(
        transport: Box<dyn Transport>,
        address: impl Into<String>,
        settings: PipeSettings,
    ) -> Self {
        let (active, _) = watch::channel(false);
        let (queue, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            active,
            reply: Arc::new(RwLock::new(None)),
            link: tokio::sync::Mutex::new(Link {
                transport,
                address: address.into(),
            }),
            settings,
        });
        let worker = tokio::spawn(run_worker(shared.clone(), rx));
        Self {
            shared,
            queue,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue one payload for delivery.
    ///
    /// Returns immediately. A closed gate rejects with
    /// [`LinkError::Inactive`] and installs nothing. A `Some` handler
    /// replaces the reply handler; `None` keeps the current one.
    pub fn send(
        &self,
        payload: impl Into<String>,
        on_reply: Option<FrameHandler>,
    ) -> Result<Delivery, LinkError> {
        if !self.shared.is_active() {
            debug!("pipe inactive, frame blocked");
            return Err(LinkError::Inactive);
        }
        if let Some(handler) = on_reply {
            *self.shared.reply.write() = Some(handler);
        }

        let payload = payload.into();
        validate_payload(&payload, self.shared.settings.max_frame_len)?;

        let (done, rx) = oneshot::channel();
        match self.queue.try_send(Outbound { payload, done }) {
            Ok(()) => Ok(Delivery { rx }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, frame dropped");
                Err(LinkError::QueueFull(self.shared.settings.queue_capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::Closed),
        }
    }

    /// Open or close the service gate.
    ///
    /// Closing disconnects the current transport; opening does not
    /// connect, the next `send` does.
    pub async fn set_active(&self, active: bool) {
        let was = self.shared.active.send_replace(active);
        if active {
            if !was {
                info!("pipe activated");
            }
            return;
        }
        let mut link = self.shared.link.lock().await;
        link.transport.disconnect().await;
        if was {
            info!("pipe deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Point the pipe at a different address on the same transport.
    ///
    /// A live link to the old address is closed.
    pub async fn set_address(&self, address: impl Into<String>) {
        let address = address.into();
        let mut link = self.shared.link.lock().await;
        if link.address == address {
            return;
        }
        link.transport.disconnect().await;
        info!(from = %link.address, to = %address, "pipe retargeted");
        link.address = address;
    }

    /// Swap the transport (and its address), closing the old one.
    pub async fn retarget(&self, transport: Box<dyn Transport>, address: impl Into<String>) {
        let address = address.into();
        let mut link = self.shared.link.lock().await;
        link.transport.disconnect().await;
        info!(kind = %transport.kind(), %address, "pipe transport replaced");
        link.transport = transport;
        link.address = address;
    }

    /// Current transport kind and address.
    pub async fn target(&self) -> (TransportKind, String) {
        let link = self.shared.link.lock().await;
        (link.transport.kind(), link.address.clone())
    }

    /// Whether a healthy link exists right now.
    ///
    /// Reports `false` while the worker is busy connecting.
    pub fn is_linked(&self) -> bool {
        self.shared
            .link
            .try_lock()
            .map(|link| link.transport.is_connected())
            .unwrap_or(false)
    }

    /// Close the gate, drop the link and stop the worker.
    pub async fn shutdown(&self) {
        self.set_active(false).await;
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
