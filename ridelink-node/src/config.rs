//! Configuration for the ridelink node.

use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use ridelink_core::session::PROBE_PAYLOAD;
use ridelink_core::{
    DEFAULT_LISTEN_PORT, MAX_FRAME_LEN, PipeSettings, RadioSettings, SessionSettings,
    StreamSettings,
};

/// Which end of the link this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Phone side: pushes frames through the pipe.
    #[default]
    Source,
    /// Tablet side: accepts the source and sends commands back.
    Display,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Display => write!(f, "display"),
        }
    }
}

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: Role,
    /// Stream transport and listener settings.
    pub network: NetworkConfig,
    /// Radio transport settings and the peer → device table.
    pub radio: RadioSettings,
    /// Reconnect loop tuning.
    pub pipe: PipeConfig,
    /// Connection probing.
    pub session: SessionTuning,
    pub preferences: PreferencesConfig,
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the display role listens on.
    pub listen_address: String,
    /// Display address used by the source in stream mode.
    pub stream_target: String,
    /// Stream connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Disable Nagle on stream links.
    pub nodelay: bool,
}

/// Pipe tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Wait between failed connect attempts, in milliseconds.
    pub backoff_ms: u64,
    /// Frames that may wait for the link before sends are rejected.
    pub queue_capacity: usize,
    /// Largest accepted frame in bytes.
    pub max_frame_len: usize,
}

/// Session probing and transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    /// Always use the stream transport (emulators, bench setups).
    pub force_stream: bool,
    pub probe_payload: String,
    pub probe_deadline_ms: u64,
    pub probe_interval_ms: u64,
}

/// Where user choices are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    pub path: PathBuf,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{DEFAULT_LISTEN_PORT}"),
            stream_target: format!("127.0.0.1:{DEFAULT_LISTEN_PORT}"),
            connect_timeout_ms: 2000,
            nodelay: true,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 3000,
            queue_capacity: 256,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            force_stream: false,
            probe_payload: PROBE_PAYLOAD.into(),
            probe_deadline_ms: 10_000,
            probe_interval_ms: 500,
        }
    }
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ridelink-prefs.toml"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Apply a `--target` override: the stream target for the source,
    /// the listen address for the display.
    pub fn apply_target(&mut self, target: String) {
        match self.role {
            Role::Source => self.network.stream_target = target,
            Role::Display => self.network.listen_address = target,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.network.listen_address.parse()
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            nodelay: self.network.nodelay,
        }
    }

    pub fn pipe_settings(&self) -> PipeSettings {
        PipeSettings {
            backoff: Duration::from_millis(self.pipe.backoff_ms),
            queue_capacity: self.pipe.queue_capacity.max(1),
            max_frame_len: self.pipe.max_frame_len.clamp(1, MAX_FRAME_LEN),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            force_stream: self.session.force_stream,
            stream_address: self.network.stream_target.clone(),
            probe_payload: self.session.probe_payload.clone(),
            probe_deadline: Duration::from_millis(self.session.probe_deadline_ms),
            probe_interval: Duration::from_millis(self.session.probe_interval_ms.max(10)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
