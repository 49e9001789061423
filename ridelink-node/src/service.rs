//! Role services.
//!
//! [`SourceService`] drives the pipe and session from console input;
//! [`DisplayService`] runs the listener and sends console lines back to
//! the source. Both run until their cancellation token fires or the
//! operator types `/quit`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ridelink_core::codec::preview;
use ridelink_core::{
    DefaultTransportFactory, FilePreferences, FrameHandler, Listener, Pipe, PeerEvent,
    SessionManager, TransportFactory, TransportKind,
};

use crate::config::NodeConfig;
use crate::console::{Command, HELP, parse_line};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one console line.
enum Flow {
    Continue,
    Quit,
}

/// Parse a console line, reporting errors and commands the role does not
/// support.
fn accept_line(line: &str, role: &str, source_only_ok: bool) -> Option<Command> {
    match parse_line(line) {
        Ok(Command::Empty) => None,
        Ok(Command::Help) => {
            println!("{HELP}");
            None
        }
        Ok(command) if command.source_only() && !source_only_ok => {
            warn!(role, ?command, "command not available in this role");
            None
        }
        Ok(command) => Some(command),
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}

/// Log one inbound frame, naming its `type` when it is a JSON object.
fn log_frame(direction: &str, line: &str) {
    let kind = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
    match kind {
        Some(kind) => info!(direction, %kind, frame = %preview(line), "frame"),
        None => info!(direction, frame = %preview(line), "frame"),
    }
}

// ── SourceService ────────────────────────────────────────────────

/// Phone-side role: pipe + session.
pub struct SourceService {
    pipe: Arc<Pipe>,
    session: SessionManager,
    events: mpsc::Sender<PeerEvent>,
    on_reply: FrameHandler,
}

impl SourceService {
    /// Build the pipe and session from `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &NodeConfig) -> Result<Self, BoxError> {
        let factory = Arc::new(DefaultTransportFactory::new(
            config.stream_settings(),
            config.radio.clone(),
        ));
        let prefs = Arc::new(FilePreferences::open(&config.preferences.path)?);

        let pipe = Arc::new(Pipe::new(
            factory.build(TransportKind::Stream),
            config.network.stream_target.clone(),
            config.pipe_settings(),
        ));
        let session = SessionManager::new(pipe.clone(), prefs, factory, config.session_settings());

        session.on_status_changed(Arc::new(|status| info!(%status, "link status")));
        let (events, rx) = mpsc::channel(16);
        session.watch_peer_events(rx);

        Ok(Self {
            pipe,
            session,
            events,
            on_reply: Arc::new(|line: String| log_frame("reverse", &line)),
        })
    }

    /// Also hand every reverse command to `handler`.
    pub fn with_reply_handler(mut self, handler: FrameHandler) -> Self {
        self.on_reply = Arc::new(move |line: String| {
            log_frame("reverse", &line);
            handler(line);
        });
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Run until cancelled or `/quit`.
    pub async fn run(
        &self,
        mut lines: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let on_reply = self.on_reply.clone();
        self.pipe.set_active(true).await;
        self.session.initialize().await;

        let mut console_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.recv(), if console_open => match line {
                    Some(line) => {
                        let Some(command) = accept_line(&line, "source", true) else { continue };
                        if let Flow::Quit = self.handle(command, &on_reply).await {
                            break;
                        }
                    }
                    None => console_open = false,
                },
            }
        }

        self.session.shutdown();
        self.pipe.shutdown().await;
        info!("source stopped");
        Ok(())
    }

    async fn handle(&self, command: Command, on_reply: &FrameHandler) -> Flow {
        match command {
            Command::Connect => self.session.manual_connect(),
            Command::Peer(peer) => {
                if let Err(e) = self.session.select_peer(&peer).await {
                    warn!("cannot select peer: {e}");
                }
            }
            Command::Mode(kind) => self.session.set_transport_kind(kind).await,
            Command::Link(event) => {
                if self.events.send(event).await.is_err() {
                    warn!("peer event source closed");
                }
            }
            Command::Pause => self.pipe.set_active(false).await,
            Command::Resume => self.pipe.set_active(true).await,
            Command::Status => {
                let config = self.session.config();
                info!(
                    status = %self.session.status(),
                    kind = %config.transport_kind,
                    target = %config.target_address,
                    peer = config.last_known_peer.as_deref().unwrap_or("-"),
                    active = self.pipe.is_active(),
                    linked = self.pipe.is_linked(),
                    "status"
                );
            }
            Command::Payload(payload) => match self.pipe.send(payload, Some(on_reply.clone())) {
                Ok(delivery) => {
                    tokio::spawn(async move {
                        if let Err(e) = delivery.wait().await {
                            warn!("frame not delivered: {e}");
                        }
                    });
                }
                Err(e) => warn!("frame rejected: {e}"),
            },
            Command::Quit => return Flow::Quit,
            Command::Help | Command::Empty => {}
        }
        Flow::Continue
    }
}

// ── DisplayService ───────────────────────────────────────────────

/// Tablet-side role: listener + reverse channel.
pub struct DisplayService {
    listener: Listener,
    on_frame: FrameHandler,
}

impl DisplayService {
    /// Bind the listener from `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &NodeConfig) -> Result<Self, BoxError> {
        let listener = Listener::bind(config.listen_addr()?)?;
        Ok(Self {
            listener,
            on_frame: Arc::new(|line: String| log_frame("forward", &line)),
        })
    }

    /// Also hand every forwarded frame to `handler`.
    pub fn with_frame_handler(mut self, handler: FrameHandler) -> Self {
        self.on_frame = Arc::new(move |line: String| {
            log_frame("forward", &line);
            handler(line);
        });
        self
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Run until cancelled or `/quit`.
    pub async fn run(
        &self,
        mut lines: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let accept = cancel.child_token();
        let runner = self.listener.clone();
        let token = accept.clone();
        let on_frame = self.on_frame.clone();
        let mut accepting =
            tokio::spawn(async move { runner.run(on_frame, "display", token).await });

        let mut console_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                finished = &mut accepting => {
                    match finished {
                        Ok(Ok(())) => info!("listener finished"),
                        Ok(Err(e)) => error!("listener failed: {e}"),
                        Err(e) => error!("listener task failed: {e}"),
                    }
                    return Ok(());
                }
                line = lines.recv(), if console_open => match line {
                    Some(line) => {
                        let Some(command) = accept_line(&line, "display", false) else { continue };
                        match command {
                            Command::Quit => break,
                            Command::Status => {
                                let peer = self.listener.has_peer().await;
                                info!(local = %self.listener.local_addr(), peer, "status");
                            }
                            Command::Payload(payload) => {
                                if let Err(e) = self.listener.send_reverse(&payload).await {
                                    warn!("command not sent: {e}");
                                }
                            }
                            _ => {}
                        }
                    }
                    None => console_open = false,
                },
            }
        }

        accept.cancel();
        if let Ok(Err(e)) = accepting.await {
            warn!("listener stopped with error: {e}");
        }
        info!("display stopped");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
