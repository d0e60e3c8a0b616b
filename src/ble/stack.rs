//! BLE stack collaborator interface.
//!
//! The radio, GATT server and link layer live behind [`BleStack`]. The stack
//! reports central connect/disconnect through an [`EventSink`], which only
//! queues the event, so stack callbacks return immediately.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::ble::gatt::{CharacteristicHandle, PeerHandle, ServiceDefinition};
use crate::error::{Error, Result};

/// Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter {
            name: "address".to_string(),
            value: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

/// Address type reported with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AddressType {
    /// Public device address.
    #[default]
    Public = 0,
    /// Random (static or private) device address.
    Random = 1,
}

impl AddressType {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Public,
            _ => Self::Random,
        }
    }
}

/// HCI disconnect reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisconnectReason(pub u8);

impl DisconnectReason {
    /// Connection supervision timeout (link lost).
    pub const SUPERVISION_TIMEOUT: Self = Self(0x08);
    /// The central terminated the connection.
    pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
    /// This host terminated the connection.
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
    /// The connection was never fully established.
    pub const FAILED_TO_ESTABLISH: Self = Self(0x3E);

    /// Raw reason code.
    pub fn code(&self) -> u8 {
        self.0
    }

    /// Check whether the central chose to leave.
    pub fn is_peer_initiated(&self) -> bool {
        *self == Self::REMOTE_USER_TERMINATED
    }

    /// Readable name for known codes.
    pub fn description(&self) -> &'static str {
        match *self {
            Self::SUPERVISION_TIMEOUT => "supervision timeout",
            Self::REMOTE_USER_TERMINATED => "remote user terminated",
            Self::LOCAL_HOST_TERMINATED => "local host terminated",
            Self::FAILED_TO_ESTABLISH => "failed to establish",
            _ => "unknown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// Events delivered by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StackEvent {
    /// A central connected.
    CentralConnected {
        /// Handle of the new connection.
        peer: PeerHandle,
        /// Type of the central's address.
        address_type: AddressType,
        /// The central's address.
        address: BdAddr,
    },
    /// A central disconnected.
    CentralDisconnected {
        /// Handle of the closed connection.
        peer: PeerHandle,
        /// HCI reason code.
        reason: DisconnectReason,
    },
}

impl StackEvent {
    /// Short name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CentralConnected { .. } => "central connected",
            Self::CentralDisconnected { .. } => "central disconnected",
        }
    }

    /// The connection handle carried by the event.
    pub fn peer(&self) -> PeerHandle {
        match self {
            Self::CentralConnected { peer, .. } | Self::CentralDisconnected { peer, .. } => *peer,
        }
    }
}

/// Non-blocking handle the stack uses to deliver events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StackEvent>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Safe to call from a stack callback.
    ///
    /// Returns `false` if the peripheral has shut down and the event was dropped.
    pub fn deliver(&self, event: StackEvent) -> bool {
        trace!("Stack event queued: {:?}", event);
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                warn!("Dropping {} event, peripheral not running", event.kind());
                false
            }
        }
    }

    /// Check whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The BLE stack operations the peripheral relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleStack: Send + Sync {
    /// Power up the radio.
    async fn activate(&self) -> Result<()>;

    /// Register the GATT service table, returning the characteristic value handle.
    async fn register_service(&self, service: &ServiceDefinition) -> Result<CharacteristicHandle>;

    /// Begin (or re-issue) advertising with the given AD payload.
    async fn advertise(&self, interval_ms: u32, payload: &[u8], connectable: bool) -> Result<()>;

    /// Cease advertising.
    async fn stop_advertising(&self) -> Result<()>;

    /// Store a new value for a local characteristic.
    async fn write_characteristic(&self, handle: CharacteristicHandle, value: &[u8])
        -> Result<()>;

    /// Push a characteristic value to a connected central.
    async fn notify(
        &self,
        peer: PeerHandle,
        handle: CharacteristicHandle,
        value: &[u8],
    ) -> Result<()>;

    /// Install the sink connect/disconnect events are reported through.
    fn set_event_sink(&self, sink: EventSink);
}
