//! Domain-specific error types for the ridelink pipe.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! Transport and pipe failures are recovered locally; they reach callers
//! only as typed values and log events, never as panics.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for ridelink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Connection Errors ────────────────────────────────────────
    /// The peer could not be reached.
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// The peer did not answer within the connect timeout.
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// The address does not match the transport's addressing scheme.
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    /// The physical medium (adapter, device node) is not present.
    #[error("medium unavailable: {0}")]
    MediumUnavailable(String),

    /// A send or receive was attempted on a dead transport.
    #[error("not connected")]
    NotConnected,

    /// The medium reported a fault while writing a frame.
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The medium reported a fault while reading.
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    /// The peer closed the link (EOF) or the link was torn down.
    #[error("link closed")]
    Closed,

    /// A reverse-channel send found no accepted connection.
    #[error("no peer connected")]
    NoPeer,

    // ── Pipe / Session Errors ────────────────────────────────────
    /// The pipe's service gate is closed; the payload was not admitted.
    #[error("pipe inactive")]
    Inactive,

    /// The pipe's outbound queue is full.
    #[error("outbound queue full ({0} frames)")]
    QueueFull(usize),

    /// A status transition was requested from the wrong state.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Framing Errors ───────────────────────────────────────────
    /// An outbound payload contains a raw line delimiter.
    #[error("payload contains a line delimiter")]
    EmbeddedDelimiter,

    /// A frame exceeded the codec limit.
    #[error("frame too long (max {max} bytes)")]
    FrameTooLong { max: usize },

    /// Inbound bytes were not valid UTF-8.
    #[error("invalid utf-8 in frame")]
    InvalidUtf8,

    // ── Ambient Errors ───────────────────────────────────────────
    /// The OS reported an I/O error outside a read or write.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The preference store could not be read or written.
    #[error("preferences: {0}")]
    Preferences(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// Whether the failure is transient, such as a peer that is not up
    /// yet. The pipe retries every connect failure but warns about the
    /// ones that are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::MediumUnavailable(_)
                | Self::NotConnected
                | Self::Io(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        LinkError::Other(s)
    }
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => LinkError::MediumUnavailable(e.description),
            serialport::ErrorKind::InvalidInput => LinkError::MalformedAddress(e.description),
            _ => LinkError::Other(e.description),
        }
    }
}
