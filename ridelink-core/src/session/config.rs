//! Session configuration and peer events.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::listener::DEFAULT_LISTEN_PORT;
use crate::transport::TransportKind;

/// Preference key of the selected radio peer.
pub const SELECTED_PEER_KEY: &str = "selected_peer";

/// Preference key of the radio/stream toggle.
pub const USE_RADIO_MODE_KEY: &str = "use_radio_mode";

/// Payload used to check that the display is reachable.
pub const PROBE_PAYLOAD: &str = r#"{"type":"ping"}"#;

/// What the session currently targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub transport_kind: TransportKind,
    /// Address handed to the pipe: `host:port` or a peer identifier.
    pub target_address: String,
    /// Last peer the user selected, if any.
    pub last_known_peer: Option<String>,
}

/// Tuning for [`SessionManager`](super::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Pin the stream transport regardless of preferences.
    pub force_stream: bool,
    /// Target used in stream mode.
    pub stream_address: String,
    pub probe_payload: String,
    /// Overall budget of one connection attempt.
    pub probe_deadline: Duration,
    /// Pause between rejected probes.
    pub probe_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            force_stream: false,
            stream_address: format!("127.0.0.1:{DEFAULT_LISTEN_PORT}"),
            probe_payload: PROBE_PAYLOAD.to_string(),
            probe_deadline: Duration::from_secs(10),
            probe_interval: Duration::from_millis(500),
        }
    }
}

/// Link state reported by the host for a radio peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLink {
    Up,
    Down,
}

/// Low-level link signal from the host's radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: String,
    pub link: PeerLink,
}

impl PeerEvent {
    pub fn up(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            link: PeerLink::Up,
        }
    }

    pub fn down(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            link: PeerLink::Down,
        }
    }

    /// Whether the event concerns `peer`; peer addresses compare
    /// case-insensitively.
    pub fn concerns(&self, peer: &str) -> bool {
        self.peer.eq_ignore_ascii_case(peer)
    }
}
