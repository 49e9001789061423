//! Scripted in-memory transport.
//!
//! Clones share state, so a test can hand one clone to a pipe and keep
//! another to script connect outcomes, inject inbound frames and inspect
//! what was written.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::{MAX_FRAME_LEN, validate_payload};
use crate::error::LinkError;
use crate::transport::{FrameHandler, Transport, TransportKind};

#[derive(Default)]
struct MockState {
    /// Remaining connect attempts that fail before connects succeed.
    failing_connects: usize,
    /// Refuse every connect while set.
    refuse_all: bool,
    connect_attempts: usize,
    addresses: Vec<String>,
    connected: bool,
    fail_next_write: bool,
    written: Vec<String>,
    handler: Option<FrameHandler>,
    inbox: VecDeque<String>,
}

/// Mock transport for unit and integration tests.
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
    wake: Arc<Notify>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Stream)
    }

    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    /// Refuse (`true`) or allow (`false`) every connect attempt.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    /// Make the next write fail and drop the link.
    pub fn fail_next_write(&self) {
        self.state.lock().fail_next_write = true;
    }

    /// Number of connect attempts so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Addresses passed to `connect`, in order.
    pub fn addresses(&self) -> Vec<String> {
        self.state.lock().addresses.clone()
    }

    /// Frames successfully written so far.
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Simulate an inbound frame, as the reader task would.
    ///
    /// Delivered to the installed handler on the caller's thread, or
    /// queued for `receive` when none is installed. Ignored while
    /// disconnected.
    pub fn inject(&self, line: &str) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        let handler = state.handler.clone();
        match handler {
            Some(handler) => {
                drop(state);
                handler(line.to_string());
            }
            None => {
                state.inbox.push_back(line.to_string());
                drop(state);
                self.wake.notify_waiters();
            }
        }
    }

    /// Simulate the peer closing the link.
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
        self.wake.notify_waiters();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&mut self, address: &str) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.addresses.push(address.to_string());
        state.connected = false;

        if state.refuse_all || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(LinkError::Connect {
                address: address.to_string(),
                reason: "mock refused".into(),
            });
        }
        state.connected = true;
        state.inbox.clear();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.drop_link();
    }

    async fn send(&mut self, line: &str) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        validate_payload(line, MAX_FRAME_LEN)?;
        if state.fail_next_write {
            state.fail_next_write = false;
            state.connected = false;
            return Err(LinkError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        state.written.push(line.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, LinkError> {
        loop {
            let notified = self.wake.notified();
            {
                let mut state = self.state.lock();
                if let Some(line) = state.inbox.pop_front() {
                    return Ok(line);
                }
                if !state.connected {
                    return Err(LinkError::Closed);
                }
            }
            notified.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_incoming_handler(&mut self, handler: FrameHandler) {
        self.state.lock().handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let mock = MockTransport::new();
        mock.fail_connects(2);
        let mut t = mock.clone();

        assert!(t.connect("a:1").await.is_err());
        assert!(t.connect("a:1").await.is_err());
        assert!(t.connect("a:1").await.is_ok());
        assert_eq!(mock.connect_attempts(), 3);
        assert!(mock.connected());
    }

    #[tokio::test]
    async fn write_failure_drops_link() {
        let mock = MockTransport::new();
        let mut t = mock.clone();
        t.connect("a:1").await.unwrap();

        mock.fail_next_write();
        assert!(matches!(t.send("lost").await, Err(LinkError::Write(_))));
        assert!(!t.is_connected());
        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn injected_frames_are_received() {
        let mock = MockTransport::new();
        let mut t = mock.clone();
        t.connect("a:1").await.unwrap();

        let feeder = mock.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            feeder.inject("PLAY");
        });
        assert_eq!(t.receive().await.unwrap(), "PLAY");

        mock.drop_link();
        assert!(matches!(t.receive().await, Err(LinkError::Closed)));
    }
}
