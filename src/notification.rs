//! Periodic notification of the fixed payload to the connected central.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::ble::connection::StateReader;
use crate::ble::gatt::PeerHandle;
use crate::ble::stack::BleStack;
use crate::error::{Error, Result};

/// Default payload pushed to the central.
pub const DEFAULT_PAYLOAD: &[u8] = b"55";

/// Fixed notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NotificationPayload(Bytes);

impl NotificationPayload {
    /// Wrap the given bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// The payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for NotificationPayload {
    fn default() -> Self {
        Self(Bytes::from_static(DEFAULT_PAYLOAD))
    }
}

/// Result of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The payload was written and notified to this peer.
    Sent(PeerHandle),
    /// No central was connected, nothing was sent.
    Skipped,
}

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotificationStats {
    /// Successful notifications.
    pub sent: u64,
    /// Failed write or notify attempts.
    pub failed: u64,
    /// Ticks with no central connected.
    pub skipped: u64,
}

/// Sends the payload to the connected central once per tick.
pub struct NotificationScheduler {
    stack: Arc<dyn BleStack>,
    state: StateReader,
    payload: NotificationPayload,
    send_timeout: Duration,
    sent: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl NotificationScheduler {
    /// Default timeout for a single write or notify call.
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

    /// Create a scheduler.
    pub fn new(stack: Arc<dyn BleStack>, state: StateReader, payload: NotificationPayload) -> Self {
        Self {
            stack,
            state,
            payload,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Set the per-call timeout.
    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    /// The payload being sent.
    pub fn payload(&self) -> &NotificationPayload {
        &self.payload
    }

    /// Counters so far.
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }

    /// Run one send attempt, logging failures instead of returning them.
    pub async fn tick(&self) -> Option<SendOutcome> {
        match self.send_once().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Error sending payload: {}", e);
                None
            }
        }
    }

    /// Write the payload locally, then notify the connected central.
    ///
    /// The connection state is read before each step so a disconnect that
    /// lands in between stops the send.
    pub async fn send_once(&self) -> Result<SendOutcome> {
        let snapshot = self.state.snapshot();
        let peer = match snapshot.peer_handle() {
            Some(peer) if snapshot.is_connected() => peer,
            _ => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(SendOutcome::Skipped);
            }
        };
        let handle = snapshot.characteristic();
        let value = self.payload.as_bytes();

        trace!("Sending payload {:02X?} to {} via {}", value, peer, handle);

        let write = self.stack.write_characteristic(handle, value);
        if let Err(e) = self.with_timeout("write characteristic", write).await {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        if self.state.peer_handle() != Some(peer) {
            debug!("{} went away before notify, skipping", peer);
            self.skipped.fetch_add(1, Ordering::SeqCst);
            return Ok(SendOutcome::Skipped);
        }

        let notify = self.stack.notify(peer, handle, value);
        if let Err(e) = self.with_timeout("notify", notify).await {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        self.sent.fetch_add(1, Ordering::SeqCst);
        debug!("Sent payload to {}", peer);

        Ok(SendOutcome::Sent(peer))
    }

    async fn with_timeout<F>(&self, operation: &'static str, call: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.send_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::SendFailure {
                reason: format!("{} failed: {}", operation, e),
            }),
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.send_timeout,
            }),
        }
    }
}
