//! Line-oriented operator console on stdin.
//!
//! Lines starting with `/` are commands; anything else is sent as a
//! payload frame.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use ridelink_core::{PeerEvent, TransportKind};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/connect`: reconnect now.
    Connect,
    /// `/peer <id>`: select the radio peer.
    Peer(String),
    /// `/mode stream|radio`
    Mode(TransportKind),
    Status,
    /// `/link up|down <peer>`: simulate a radio link event.
    Link(PeerEvent),
    /// `/pause`: close the service gate.
    Pause,
    /// `/resume`: reopen it.
    Resume,
    Help,
    Quit,
    /// A line to forward verbatim.
    Payload(String),
    /// Blank line.
    Empty,
}

pub const HELP: &str = "\
commands:
  /connect                reconnect now (source)
  /peer <id>              select the display peer (source)
  /mode stream|radio      switch transport (source)
  /link up|down <peer>    inject a radio link event (source)
  /pause | /resume        close or reopen the pipe (source)
  /status                 show link state
  /help                   this text
  /quit                   exit
anything else is sent as one frame";

impl Command {
    /// Whether the command only makes sense on the source side.
    pub fn source_only(&self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::Peer(_)
                | Self::Mode(_)
                | Self::Link(_)
                | Self::Pause
                | Self::Resume
        )
    }
}

/// Parse a console line.
pub fn parse_line(line: &str) -> Result<Command, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Ok(Command::Payload(line.to_string()));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let command = match (name, args.as_slice()) {
        ("connect", []) => Command::Connect,
        ("peer", [peer]) => Command::Peer((*peer).to_string()),
        ("mode", [kind]) => Command::Mode(kind.parse().map_err(|e| format!("/mode: {e}"))?),
        ("status", []) => Command::Status,
        ("link", ["up", peer]) => Command::Link(PeerEvent::up(*peer)),
        ("link", ["down", peer]) => Command::Link(PeerEvent::down(*peer)),
        ("pause", []) => Command::Pause,
        ("resume", []) => Command::Resume,
        ("help", []) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        ("peer", _) => return Err("usage: /peer <id>".into()),
        ("mode", _) => return Err("usage: /mode stream|radio".into()),
        ("link", _) => return Err("usage: /link up|down <peer>".into()),
        (other, _) => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(command)
}

/// Read stdin line by line on a background task.
///
/// The channel closes when stdin reaches EOF.
pub fn spawn_stdin() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("console read error: {e}");
                    break;
                }
            }
        }
        debug!("console input closed");
    });
    rx
}

// ── Tests ────────────────────────────────────────────────────────
