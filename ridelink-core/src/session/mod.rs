//! Connection session management for the source role.
//!
//! The [`SessionManager`] owns the user-facing view of the link: it picks
//! the transport and target from preferences, probes the display to decide
//! whether the link is usable, reacts to peer link events and user actions,
//! and reports [`ConnectionStatus`] changes to a single observer.
//!
//! All I/O goes through the shared [`Pipe`]; the session never touches a
//! transport directly except to hand a freshly built one to the pipe.

use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::pipe::Pipe;
use crate::transport::{TransportFactory, TransportKind};

pub mod config;
pub mod preferences;
pub mod status;

pub use config::{
    PROBE_PAYLOAD, PeerEvent, PeerLink, SELECTED_PEER_KEY, SessionConfig, SessionSettings,
    USE_RADIO_MODE_KEY,
};
pub use preferences::{FilePreferences, MemoryPreferences, PreferenceStore};
pub use status::{ConnectionStatus, StatusObserver};

/// Status plus the id of the attempt allowed to change it.
#[derive(Default)]
struct StatusState {
    status: ConnectionStatus,
    /// Bumped by every user action or peer event; a probe task only
    /// reports while its generation is current.
    generation: u64,
}

struct Inner {
    pipe: Arc<Pipe>,
    prefs: Arc<dyn PreferenceStore>,
    factory: Arc<dyn TransportFactory>,
    settings: SessionSettings,
    config: RwLock<SessionConfig>,
    state: Mutex<StatusState>,
    /// Held across a transition and its notification so the observer sees
    /// transitions in the order they were applied. Reentrant so an
    /// observer may itself drive the session.
    notify_order: ReentrantMutex<()>,
    observer: RwLock<Option<StatusObserver>>,
    attempt: Mutex<Option<JoinHandle<()>>>,
}

/// Connection session manager.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Load the session configuration from `prefs`.
    ///
    /// Nothing is connected until [`SessionManager::initialize`].
    pub fn new(
        pipe: Arc<Pipe>,
        prefs: Arc<dyn PreferenceStore>,
        factory: Arc<dyn TransportFactory>,
        settings: SessionSettings,
    ) -> Self {
        let transport_kind = if settings.force_stream {
            info!("stream transport forced by configuration");
            TransportKind::Stream
        } else if prefs.get_bool(USE_RADIO_MODE_KEY, true) {
            TransportKind::Radio
        } else {
            TransportKind::Stream
        };
        let last_known_peer = prefs.get_string(SELECTED_PEER_KEY).filter(|p| !p.is_empty());
        let target_address = match transport_kind {
            TransportKind::Stream => settings.stream_address.clone(),
            TransportKind::Radio => last_known_peer.clone().unwrap_or_default(),
        };

        Self {
            inner: Arc::new(Inner {
                pipe,
                prefs,
                factory,
                settings,
                config: RwLock::new(SessionConfig {
                    transport_kind,
                    target_address,
                    last_known_peer,
                }),
                state: Mutex::new(StatusState::default()),
                notify_order: ReentrantMutex::new(()),
                observer: RwLock::new(None),
                attempt: Mutex::new(None),
            }),
        }
    }

    /// Point the pipe at the configured target and, when there is one,
    /// start connecting.
    pub async fn initialize(&self) {
        let config = self.config();
        info!(
            kind = %config.transport_kind,
            target = %config.target_address,
            "initializing session"
        );
        self.inner.retarget(&config).await;

        match (config.transport_kind, &config.last_known_peer) {
            (TransportKind::Stream, _) | (TransportKind::Radio, Some(_)) => {
                self.attempt_connection();
            }
            (TransportKind::Radio, None) => {
                info!("no peer selected, waiting for user configuration");
                self.inner.set_status(|s| s.drop_link(), None);
            }
        }
    }

    /// Enter `Connecting` and probe the display in the background.
    ///
    /// Ends `Connected` on the first delivered probe, `Disconnected` once
    /// the deadline passes. A running attempt is aborted first.
    pub fn attempt_connection(&self) {
        let generation = self.inner.begin_connecting();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.probe(generation).await });
        if let Some(previous) = self.inner.attempt.lock().replace(task) {
            previous.abort();
        }
    }

    /// React to a link signal from the host's radio stack.
    ///
    /// Ignored in stream mode and for peers other than the selected one.
    pub fn handle_peer_event(&self, event: PeerEvent) {
        let config = self.config();
        if config.transport_kind == TransportKind::Stream {
            debug!(peer = %event.peer, "peer event ignored in stream mode");
            return;
        }
        let selected = config.last_known_peer.as_deref();
        if !selected.is_some_and(|peer| event.concerns(peer)) {
            debug!(peer = %event.peer, "event for unselected peer ignored");
            return;
        }

        match event.link {
            PeerLink::Up => {
                info!(peer = %event.peer, "peer link up");
                self.attempt_connection();
            }
            PeerLink::Down => {
                info!(peer = %event.peer, "peer link down");
                self.inner.abort_attempt();
                self.inner.set_status(|s| s.drop_link(), None);
            }
        }
    }

    /// Feed peer events from a host source until it closes.
    pub fn watch_peer_events(&self, mut events: mpsc::Receiver<PeerEvent>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_peer_event(event);
            }
            debug!("peer event source closed");
        })
    }

    /// Remember `peer` as the display and reconnect.
    ///
    /// The pipe is retargeted only in radio mode.
    pub async fn select_peer(&self, peer: &str) -> Result<(), LinkError> {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(LinkError::MalformedAddress("empty peer identifier".into()));
        }
        if let Err(e) = self.inner.prefs.set_string(SELECTED_PEER_KEY, peer) {
            warn!("could not persist selected peer: {e}");
        }

        let kind = {
            let mut config = self.inner.config.write();
            config.last_known_peer = Some(peer.to_string());
            if config.transport_kind == TransportKind::Radio {
                config.target_address = peer.to_string();
            }
            config.transport_kind
        };
        info!(peer, %kind, "peer selected");

        if kind == TransportKind::Radio {
            self.inner.pipe.set_address(peer).await;
        }
        self.attempt_connection();
        Ok(())
    }

    /// Switch medium, rebuild the transport and reconnect.
    pub async fn set_transport_kind(&self, kind: TransportKind) {
        let kind = if self.inner.settings.force_stream && kind == TransportKind::Radio {
            warn!("radio mode requested but stream transport is forced");
            TransportKind::Stream
        } else {
            kind
        };
        if let Err(e) = self
            .inner
            .prefs
            .set_bool(USE_RADIO_MODE_KEY, kind == TransportKind::Radio)
        {
            warn!("could not persist transport mode: {e}");
        }

        let config = {
            let mut config = self.inner.config.write();
            config.transport_kind = kind;
            config.target_address = match kind {
                TransportKind::Stream => self.inner.settings.stream_address.clone(),
                TransportKind::Radio => config.last_known_peer.clone().unwrap_or_default(),
            };
            config.clone()
        };
        info!(%kind, target = %config.target_address, "transport switched");

        let transport = self.inner.factory.build(kind);
        self.inner.pipe.retarget(transport, config.target_address).await;
        self.attempt_connection();
    }

    /// User-requested reconnect.
    pub fn manual_connect(&self) {
        info!("manual connect requested");
        self.attempt_connection();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    /// Install the status observer, replacing any previous one.
    pub fn on_status_changed(&self, observer: StatusObserver) {
        *self.inner.observer.write() = Some(observer);
    }

    /// Stop any running attempt. The pipe is left to its owner.
    pub fn shutdown(&self) {
        self.inner.abort_attempt();
        info!("session stopped");
    }
}

impl Inner {
    /// Apply a transition, notifying the observer on change.
    ///
    /// With `Some(generation)` the transition only applies while that
    /// attempt is still current.
    fn set_status(
        &self,
        transition: impl FnOnce(&mut ConnectionStatus) -> bool,
        generation: Option<u64>,
    ) {
        let _order = self.notify_order.lock();
        let changed = {
            let mut state = self.state.lock();
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            if generation.is_none() {
                state.generation += 1;
            }
            transition(&mut state.status).then_some(state.status)
        };
        if let Some(status) = changed {
            self.notify(status);
        }
    }

    /// Enter `Connecting` and open a new attempt generation.
    fn begin_connecting(&self) -> u64 {
        let _order = self.notify_order.lock();
        let (generation, changed) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let changed = state.status.begin_connect();
            (state.generation, changed)
        };
        if changed {
            self.notify(ConnectionStatus::Connecting);
        }
        generation
    }

    fn notify(&self, status: ConnectionStatus) {
        info!(%status, "connection status changed");
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(status);
        }
    }

    fn abort_attempt(&self) {
        if let Some(task) = self.attempt.lock().take() {
            task.abort();
        }
    }

    /// Align the pipe with `config`, keeping its transport when the kind
    /// already matches.
    async fn retarget(&self, config: &SessionConfig) {
        let (kind, _) = self.pipe.target().await;
        if kind == config.transport_kind {
            self.pipe.set_address(config.target_address.clone()).await;
        } else {
            let transport = self.factory.build(config.transport_kind);
            self.pipe.retarget(transport, config.target_address.clone()).await;
        }
    }

    /// Probe until one ping is written or the deadline passes.
    async fn probe(&self, generation: u64) {
        let deadline = Instant::now() + self.settings.probe_deadline;
        let target = self.config.read().target_address.clone();
        debug!(%target, "probing display");

        loop {
            match self.pipe.send(self.settings.probe_payload.clone(), None) {
                Ok(delivery) => match tokio::time::timeout_at(deadline, delivery.wait()).await {
                    Ok(Ok(())) => {
                        info!(%target, "display reachable");
                        self.set_status(
                            |s| s.complete().unwrap_or_else(|e| {
                                debug!("{e}");
                                false
                            }),
                            Some(generation),
                        );
                        return;
                    }
                    Ok(Err(e)) => debug!("probe not delivered: {e}"),
                    Err(_) => break,
                },
                Err(e) => debug!("probe rejected: {e}"),
            }

            let next = Instant::now() + self.settings.probe_interval;
            if next >= deadline {
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        warn!(%target, "display not reachable within {:?}", self.settings.probe_deadline);
        self.set_status(|s| s.drop_link(), Some(generation));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pipe::PipeSettings;
    use crate::transport::{MockTransport, Transport};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        session: SessionManager,
        pipe: Arc<Pipe>,
        prefs: Arc<MemoryPreferences>,
        /// Every transport the pipe has driven, in creation order.
        built: Arc<Mutex<Vec<MockTransport>>>,
        seen: Arc<Mutex<Vec<ConnectionStatus>>>,
    }

    impl Harness {
        async fn new(prefs: MemoryPreferences, settings: SessionSettings) -> Self {
            Self::with_script(prefs, settings, |_| {}).await
        }

        async fn with_script(
            prefs: MemoryPreferences,
            settings: SessionSettings,
            script: impl Fn(&MockTransport) + Send + Sync + 'static,
        ) -> Self {
            let built: Arc<Mutex<Vec<MockTransport>>> = Arc::new(Mutex::new(Vec::new()));
            let initial = MockTransport::with_kind(TransportKind::Stream);
            script(&initial);
            built.lock().push(initial.clone());

            let registry = built.clone();
            let factory = move |kind: TransportKind| -> Box<dyn Transport> {
                let mock = MockTransport::with_kind(kind);
                script(&mock);
                registry.lock().push(mock.clone());
                Box::new(mock)
            };

            let pipe = Arc::new(Pipe::new(
                Box::new(initial),
                "",
                PipeSettings {
                    backoff: Duration::from_millis(20),
                    ..Default::default()
                },
            ));
            pipe.set_active(true).await;
            let prefs = Arc::new(prefs);
            let session =
                SessionManager::new(pipe.clone(), prefs.clone(), Arc::new(factory), settings);

            let seen: Arc<Mutex<Vec<ConnectionStatus>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            session.on_status_changed(Arc::new(move |status| sink.lock().push(status)));

            Self {
                session,
                pipe,
                prefs,
                built,
                seen,
            }
        }

        fn current(&self) -> MockTransport {
            self.built.lock().last().cloned().expect("no transport")
        }

        fn seen(&self) -> Vec<ConnectionStatus> {
            self.seen.lock().clone()
        }

        async fn wait_for(&self, status: ConnectionStatus) {
            tokio::time::timeout(WAIT, async {
                while self.session.status() != status {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("status {status} not reached, saw {:?}", self.seen()));
        }
    }

    fn quick() -> SessionSettings {
        SessionSettings {
            probe_deadline: Duration::from_millis(300),
            probe_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn radio_prefs(peer: Option<&str>) -> MemoryPreferences {
        let prefs = MemoryPreferences::new();
        if let Some(peer) = peer {
            prefs.set_string(SELECTED_PEER_KEY, peer).unwrap();
        }
        prefs
    }

    fn stream_prefs() -> MemoryPreferences {
        let prefs = MemoryPreferences::new();
        prefs.set_bool(USE_RADIO_MODE_KEY, false).unwrap();
        prefs
    }

    #[tokio::test]
    async fn config_comes_from_preferences() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        let config = h.session.config();
        assert_eq!(config.transport_kind, TransportKind::Radio);
        assert_eq!(config.target_address, "AA:BB:CC:DD:EE:FF");

        let h = Harness::new(stream_prefs(), quick()).await;
        let config = h.session.config();
        assert_eq!(config.transport_kind, TransportKind::Stream);
        assert_eq!(config.target_address, "127.0.0.1:6000");
    }

    #[tokio::test]
    async fn force_stream_overrides_preferences() {
        let settings = SessionSettings {
            force_stream: true,
            stream_address: "10.0.2.2:6000".into(),
            ..quick()
        };
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), settings).await;
        assert_eq!(h.session.config().transport_kind, TransportKind::Stream);
        assert_eq!(h.session.config().target_address, "10.0.2.2:6000");

        h.session.set_transport_kind(TransportKind::Radio).await;
        assert_eq!(h.session.config().transport_kind, TransportKind::Stream);
        assert!(!h.prefs.get_bool(USE_RADIO_MODE_KEY, true));
        h.session.shutdown();
    }

    #[tokio::test]
    async fn initialize_without_peer_stays_disconnected() {
        let h = Harness::new(radio_prefs(None), quick()).await;
        h.session.initialize().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);
        assert!(h.seen().is_empty());
        assert_eq!(h.current().connect_attempts(), 0);
    }

    #[tokio::test]
    async fn initialize_in_stream_mode_connects() {
        let h = Harness::new(stream_prefs(), quick()).await;
        h.session.initialize().await;
        h.wait_for(ConnectionStatus::Connected).await;

        assert_eq!(
            h.seen(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        let mock = h.current();
        assert_eq!(mock.addresses(), vec!["127.0.0.1:6000".to_string()]);
        assert_eq!(mock.written(), vec![PROBE_PAYLOAD.to_string()]);
    }

    #[tokio::test]
    async fn select_peer_connects_and_notifies_twice() {
        let h = Harness::new(radio_prefs(None), quick()).await;
        h.session.initialize().await;
        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);

        h.session.select_peer("AA:BB:CC:DD:EE:FF").await.unwrap();
        h.wait_for(ConnectionStatus::Connected).await;

        assert_eq!(
            h.seen(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(
            h.prefs.get_string(SELECTED_PEER_KEY).as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            h.pipe.target().await,
            (TransportKind::Radio, "AA:BB:CC:DD:EE:FF".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_display_ends_disconnected() {
        let h = Harness::with_script(stream_prefs(), quick(), |mock| mock.refuse_connects(true))
            .await;
        h.session.initialize().await;
        h.wait_for(ConnectionStatus::Connecting).await;
        h.wait_for(ConnectionStatus::Disconnected).await;

        assert_eq!(
            h.seen(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
        h.pipe.shutdown().await;
    }

    #[tokio::test]
    async fn paused_pipe_fails_the_probe() {
        let h = Harness::new(stream_prefs(), quick()).await;
        h.pipe.set_active(false).await;
        h.session.manual_connect();
        h.wait_for(ConnectionStatus::Disconnected).await;

        assert!(h.current().written().is_empty());
        assert_eq!(
            h.seen(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn peer_events_for_selected_peer_drive_status() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        h.session.initialize().await;
        h.wait_for(ConnectionStatus::Connected).await;

        h.session.handle_peer_event(PeerEvent::down("aa:bb:cc:dd:ee:ff"));
        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);

        h.session.handle_peer_event(PeerEvent::up("AA:BB:CC:DD:EE:FF"));
        h.wait_for(ConnectionStatus::Connected).await;
        assert_eq!(
            h.seen(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn unrelated_and_stream_mode_events_are_ignored() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        h.session.handle_peer_event(PeerEvent::up("11:22:33:44:55:66"));
        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);

        let prefs = stream_prefs();
        prefs.set_string(SELECTED_PEER_KEY, "AA:BB:CC:DD:EE:FF").unwrap();
        let h = Harness::new(prefs, quick()).await;
        assert_eq!(
            h.session.config().last_known_peer.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        h.session.handle_peer_event(PeerEvent::up("AA:BB:CC:DD:EE:FF"));
        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);
        assert!(h.seen().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_observer_sees_transitions_in_order() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        let sink = h.seen.clone();
        h.session.on_status_changed(Arc::new(move |status| {
            if status == ConnectionStatus::Connected {
                std::thread::sleep(Duration::from_millis(200));
            }
            sink.lock().push(status);
        }));

        h.session.initialize().await;
        h.wait_for(ConnectionStatus::Connected).await;
        h.session.handle_peer_event(PeerEvent::down("AA:BB:CC:DD:EE:FF"));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.session.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            h.seen(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
            ]
        );
        assert_eq!(h.seen().last().copied(), Some(h.session.status()));
    }

    #[tokio::test]
    async fn watched_events_reach_the_session() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        let (tx, rx) = mpsc::channel(4);
        let pump = h.session.watch_peer_events(rx);

        tx.send(PeerEvent::up("AA:BB:CC:DD:EE:FF")).await.unwrap();
        h.wait_for(ConnectionStatus::Connected).await;

        drop(tx);
        tokio::time::timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn switching_transport_rebuilds_and_persists() {
        let h = Harness::new(radio_prefs(Some("AA:BB:CC:DD:EE:FF")), quick()).await;
        h.session.set_transport_kind(TransportKind::Stream).await;
        h.wait_for(ConnectionStatus::Connected).await;

        assert!(!h.prefs.get_bool(USE_RADIO_MODE_KEY, true));
        let mock = h.current();
        assert_eq!(mock.addresses(), vec!["127.0.0.1:6000".to_string()]);
        assert_eq!(h.pipe.target().await.0, TransportKind::Stream);

        h.session.set_transport_kind(TransportKind::Radio).await;
        h.wait_for(ConnectionStatus::Connected).await;
        assert_eq!(
            h.pipe.target().await,
            (TransportKind::Radio, "AA:BB:CC:DD:EE:FF".to_string())
        );
        assert!(h.prefs.get_bool(USE_RADIO_MODE_KEY, false));
    }

    #[tokio::test]
    async fn empty_peer_is_rejected() {
        let h = Harness::new(radio_prefs(None), quick()).await;
        assert!(matches!(
            h.session.select_peer("  ").await,
            Err(LinkError::MalformedAddress(_))
        ));
        assert_eq!(h.session.config().last_known_peer, None);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_running_attempt() {
        let h = Harness::with_script(stream_prefs(), quick(), |mock| mock.refuse_connects(true))
            .await;
        h.session.manual_connect();
        h.wait_for(ConnectionStatus::Connecting).await;
        h.session.shutdown();

        tokio::time::sleep(quick().probe_deadline * 2).await;
        assert_eq!(h.session.status(), ConnectionStatus::Connecting);
        h.pipe.shutdown().await;
    }
}
