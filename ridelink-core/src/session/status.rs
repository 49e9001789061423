//! Link status as seen by the user.
//!
//! Provides a `ConnectionStatus` enum with validated transitions that
//! return `Result` instead of panicking.

use std::fmt;
use std::sync::Arc;

use crate::error::LinkError;

// ── ConnectionStatus ─────────────────────────────────────────────

/// The user-visible state of the link to the display.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲                │             │
///       └────────────────┴─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// No usable link. Initial state.
    #[default]
    Disconnected,

    /// A connection attempt is running.
    Connecting,

    /// The probe reached the display.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
        }
    }
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    // ── Transitions ──────────────────────────────────────────────
    //
    // Each returns whether the status actually changed, so callers only
    // notify observers on a real transition.

    /// Transition to `Connecting`.
    ///
    /// Valid from any state; a fresh attempt may start at any time.
    pub fn begin_connect(&mut self) -> bool {
        self.replace(Self::Connecting)
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete(&mut self) -> Result<bool, LinkError> {
        match self {
            Self::Connecting => Ok(self.replace(Self::Connected)),
            _ => Err(LinkError::InvalidTransition(
                "cannot complete: not in Connecting state",
            )),
        }
    }

    /// Transition to `Disconnected` from any state.
    pub fn drop_link(&mut self) -> bool {
        self.replace(Self::Disconnected)
    }

    fn replace(&mut self, next: Self) -> bool {
        let changed = *self != next;
        *self = next;
        changed
    }
}

/// Single status observer; installing another replaces it.
pub type StatusObserver = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

// ── Tests ────────────────────────────────────────────────────────
