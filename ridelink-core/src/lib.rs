//! # ridelink-core
//!
//! Resilient line-oriented link between a phone-side *source* and a
//! tablet-side *display*.
//!
//! This crate contains:
//! - **Codec**: `LineCodec` for newline-delimited UTF-8 frames via `tokio_util`
//! - **Transport**: the `Transport` trait with stream (TCP), radio (serial
//!   profile) and mock implementations, plus `TransportFactory`
//! - **Pipe**: `Pipe`, the persistent self-healing sender with a service gate
//! - **Listener**: `Listener`, the display-side acceptor with a reverse channel
//! - **Session**: `SessionManager`, status tracking, peer events and preferences
//! - **Error**: `LinkError`, a typed `thiserror`-based error hierarchy

pub mod codec;
pub mod error;
pub mod listener;
pub mod pipe;
pub mod session;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{LineCodec, MAX_FRAME_LEN};
pub use error::LinkError;
pub use listener::{DEFAULT_LISTEN_PORT, Listener};
pub use pipe::{Delivery, Pipe, PipeSettings};
pub use session::{
    ConnectionStatus, FilePreferences, MemoryPreferences, PeerEvent, PeerLink, PreferenceStore,
    SessionConfig, SessionManager, SessionSettings,
};
pub use transport::{
    DefaultTransportFactory, FrameHandler, MockTransport, RadioSettings, RadioTransport,
    StreamSettings, StreamTransport, Transport, TransportFactory, TransportKind,
};
