//! Single-connection lifecycle.
//!
//! [`ConnectionStateMachine`] is the only writer of [`ConnectionState`]. It
//! reacts to stack events and drives advertising. Everything else reads the
//! state through a [`StateReader`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ble::advertising::AdvertisingController;
use crate::ble::gatt::{CharacteristicHandle, PeerHandle, PeripheralIdentity};
use crate::ble::stack::{AddressType, BdAddr, DisconnectReason, StackEvent};
use crate::error::{Error, Result};

/// Lifecycle phase of the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionPhase {
    /// Not yet advertising. Only seen before startup completes.
    #[default]
    Idle,
    /// Advertising and waiting for a central.
    Advertising,
    /// A central is connected.
    Connected,
}

impl ConnectionPhase {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Advertising => write!(f, "Advertising"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// The connected central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectedPeer {
    /// Connection handle.
    pub handle: PeerHandle,
    /// Type of the central's address.
    pub address_type: AddressType,
    /// The central's address.
    pub address: BdAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

/// Snapshot of the connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionState {
    phase: ConnectionPhase,
    peer: Option<ConnectedPeer>,
    characteristic: CharacteristicHandle,
}

impl ConnectionState {
    fn new(characteristic: CharacteristicHandle) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            peer: None,
            characteristic,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// The connected central. `Some` only while [`ConnectionPhase::Connected`].
    pub fn peer(&self) -> Option<&ConnectedPeer> {
        self.peer.as_ref()
    }

    /// Handle of the connected central.
    pub fn peer_handle(&self) -> Option<PeerHandle> {
        self.peer.map(|p| p.handle)
    }

    /// The registered characteristic value handle.
    pub fn characteristic(&self) -> CharacteristicHandle {
        self.characteristic
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.phase.is_connected()
    }
}

/// Event for phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    /// Phase before the transition.
    pub from: ConnectionPhase,
    /// Phase after the transition.
    pub to: ConnectionPhase,
}

/// Read-only view of the connection state.
#[derive(Debug, Clone)]
pub struct StateReader {
    state: Arc<RwLock<ConnectionState>>,
}

impl StateReader {
    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    /// Handle of the connected central.
    pub fn peer_handle(&self) -> Option<PeerHandle> {
        self.state.read().peer_handle()
    }

    /// The registered characteristic value handle.
    pub fn characteristic(&self) -> CharacteristicHandle {
        self.state.read().characteristic
    }

    /// Copy of the full state.
    pub fn snapshot(&self) -> ConnectionState {
        self.state.read().clone()
    }
}

/// Owns the connection lifecycle.
pub struct ConnectionStateMachine {
    identity: PeripheralIdentity,
    interval_ms: u32,
    advertise_attempts: u32,
    advertising: AdvertisingController,
    state: Arc<RwLock<ConnectionState>>,
    phase_tx: broadcast::Sender<PhaseChange>,
}

impl ConnectionStateMachine {
    /// Create a state machine in [`ConnectionPhase::Idle`].
    pub fn new(
        identity: PeripheralIdentity,
        characteristic: CharacteristicHandle,
        advertising: AdvertisingController,
        interval_ms: u32,
    ) -> Self {
        let (phase_tx, _) = broadcast::channel(16);

        Self {
            identity,
            interval_ms,
            advertise_attempts: 1,
            advertising,
            state: Arc::new(RwLock::new(ConnectionState::new(characteristic))),
            phase_tx,
        }
    }

    /// Set how many times advertising is attempted per transition.
    pub fn set_advertise_attempts(&mut self, attempts: u32) {
        self.advertise_attempts = attempts.max(1);
    }

    /// A read-only handle to the state.
    pub fn reader(&self) -> StateReader {
        StateReader {
            state: self.state.clone(),
        }
    }

    /// Subscribe to phase transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChange> {
        self.phase_tx.subscribe()
    }

    pub(crate) fn phase_sender(&self) -> broadcast::Sender<PhaseChange> {
        self.phase_tx.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Copy of the full state.
    pub fn snapshot(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Whether the radio is believed to be advertising.
    pub fn is_advertising(&self) -> bool {
        self.advertising.is_advertising()
    }

    /// Leave [`ConnectionPhase::Idle`] by starting to advertise.
    ///
    /// The phase becomes [`ConnectionPhase::Advertising`] even if the stack
    /// refuses; [`ensure_advertising`](Self::ensure_advertising) retries later.
    pub async fn start(&mut self) -> Result<()> {
        let phase = self.phase();
        if phase != ConnectionPhase::Idle {
            return Err(Error::UnexpectedEvent {
                event: "startup",
                phase,
            });
        }

        let result = self.advertise().await;
        self.set_phase(ConnectionPhase::Advertising, None);
        result
    }

    /// React to a stack event.
    ///
    /// Events that do not fit the current phase are logged and discarded with
    /// [`Error::UnexpectedEvent`]; the state is left untouched.
    pub async fn handle_event(&mut self, event: StackEvent) -> Result<()> {
        match event {
            StackEvent::CentralConnected {
                peer,
                address_type,
                address,
            } => self.on_connected(peer, address_type, address).await,
            StackEvent::CentralDisconnected { peer, reason } => {
                self.on_disconnected(peer, reason).await
            }
        }
    }

    /// Re-issue advertising if an earlier attempt failed.
    ///
    /// Returns `true` if advertising was restarted.
    pub async fn ensure_advertising(&mut self) -> Result<bool> {
        if self.phase() != ConnectionPhase::Advertising || self.advertising.is_advertising() {
            return Ok(false);
        }

        debug!("Advertising is down while waiting for a central, retrying");
        self.advertise().await?;
        Ok(true)
    }

    /// Stop advertising ahead of process exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.advertising.stop_advertising().await
    }

    async fn on_connected(
        &mut self,
        peer: PeerHandle,
        address_type: AddressType,
        address: BdAddr,
    ) -> Result<()> {
        let phase = self.phase();
        if phase != ConnectionPhase::Advertising {
            warn!(
                "Discarding connect from {} ({}) while {}",
                address, peer, phase
            );
            return Err(Error::UnexpectedEvent {
                event: "central connected",
                phase,
            });
        }

        info!("Central {} connected ({})", address, peer);
        self.set_phase(
            ConnectionPhase::Connected,
            Some(ConnectedPeer {
                handle: peer,
                address_type,
                address,
                connected_at: Utc::now(),
            }),
        );

        if let Err(e) = self.advertising.stop_advertising().await {
            // The link layer halts connectable advertising on connect anyway.
            warn!("Failed to stop advertising after connect: {}", e);
            self.advertising.mark_stopped();
            return Err(e);
        }

        Ok(())
    }

    async fn on_disconnected(&mut self, peer: PeerHandle, reason: DisconnectReason) -> Result<()> {
        let (phase, live_peer) = {
            let state = self.state.read();
            (state.phase, state.peer_handle())
        };

        if phase != ConnectionPhase::Connected {
            warn!(
                "Discarding disconnect of {} (reason {}) while {}",
                peer, reason, phase
            );
            return Err(Error::UnexpectedEvent {
                event: "central disconnected",
                phase,
            });
        }

        // Only one link exists, so any disconnect while connected ends it.
        if live_peer != Some(peer) {
            warn!(
                "Disconnect reported for {} but connected peer is {:?}",
                peer, live_peer
            );
        }

        if reason.is_peer_initiated() {
            info!("Central left ({}), reason {}", peer, reason);
        } else {
            info!("Central disconnected ({}), reason {}", peer, reason);
        }
        self.set_phase(ConnectionPhase::Advertising, None);

        self.advertise().await
    }

    async fn advertise(&mut self) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.advertise_attempts {
            match self
                .advertising
                .start_advertising(&self.identity, self.interval_ms)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Advertising attempt {} of {} failed: {}",
                        attempt, self.advertise_attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let e = last_error.unwrap_or_else(|| Error::Internal("no advertising attempt".into()));
        error!("Advertising unavailable: {}", e);
        Err(e)
    }

    fn set_phase(&self, new_phase: ConnectionPhase, peer: Option<ConnectedPeer>) {
        let old_phase = {
            let mut state = self.state.write();
            let old = state.phase;
            state.phase = new_phase;
            state.peer = peer;
            old
        };

        if old_phase != new_phase {
            debug!("Connection phase changed: {} -> {}", old_phase, new_phase);

            let _ = self.phase_tx.send(PhaseChange {
                from: old_phase,
                to: new_phase,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::MockBleStack;
    use pretty_assertions::assert_eq;

    const CHAR: CharacteristicHandle = CharacteristicHandle(0x10);

    fn connect(peer: u16) -> StackEvent {
        StackEvent::CentralConnected {
            peer: PeerHandle(peer),
            address_type: AddressType::Public,
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
        }
    }

    fn disconnect(peer: u16, reason: u8) -> StackEvent {
        StackEvent::CentralDisconnected {
            peer: PeerHandle(peer),
            reason: DisconnectReason(reason),
        }
    }

    fn machine(stack: MockBleStack) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            PeripheralIdentity::default(),
            CHAR,
            AdvertisingController::new(Arc::new(stack)),
            100,
        )
    }

    #[test]
    fn test_connection_phase() {
        assert!(ConnectionPhase::Connected.is_connected());
        assert!(!ConnectionPhase::Advertising.is_connected());
        assert!(!ConnectionPhase::Idle.is_connected());
        assert_eq!(ConnectionPhase::default(), ConnectionPhase::Idle);
    }

    #[test]
    fn test_connection_phase_display() {
        assert_eq!(format!("{}", ConnectionPhase::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionPhase::Advertising), "Advertising");
    }

    #[tokio::test]
    async fn test_startup_advertises() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(1).returning(|_, _, _| Ok(()));

        let mut sm = machine(stack);
        let mut rx = sm.subscribe();
        assert_eq!(sm.phase(), ConnectionPhase::Idle);

        sm.start().await.unwrap();
        assert_eq!(sm.phase(), ConnectionPhase::Advertising);
        assert!(sm.is_advertising());
        assert_eq!(
            rx.try_recv().unwrap(),
            PhaseChange {
                from: ConnectionPhase::Idle,
                to: ConnectionPhase::Advertising
            }
        );

        assert!(matches!(
            sm.start().await,
            Err(Error::UnexpectedEvent { event: "startup", .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(2).returning(|_, _, _| Ok(()));
        stack.expect_stop_advertising().times(1).returning(|| Ok(()));

        let mut sm = machine(stack);
        sm.start().await.unwrap();

        sm.handle_event(connect(1)).await.unwrap();
        let state = sm.snapshot();
        assert_eq!(state.phase(), ConnectionPhase::Connected);
        assert_eq!(state.peer_handle(), Some(PeerHandle(1)));
        assert_eq!(
            state.peer().unwrap().address.to_string(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert!(!sm.is_advertising());

        sm.handle_event(disconnect(1, 19)).await.unwrap();
        let state = sm.snapshot();
        assert_eq!(state.phase(), ConnectionPhase::Advertising);
        assert_eq!(state.peer_handle(), None);
        assert_eq!(state.characteristic(), CHAR);
        assert!(sm.is_advertising());
    }

    #[tokio::test]
    async fn test_spurious_disconnect_is_discarded() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(1).returning(|_, _, _| Ok(()));
        stack.expect_stop_advertising().times(0);

        let mut sm = machine(stack);
        sm.start().await.unwrap();
        let before = sm.snapshot();

        let result = sm.handle_event(disconnect(1, 19)).await;
        assert!(matches!(
            result,
            Err(Error::UnexpectedEvent {
                phase: ConnectionPhase::Advertising,
                ..
            })
        ));
        assert_eq!(sm.snapshot(), before);
    }

    #[tokio::test]
    async fn test_second_connect_is_discarded() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(1).returning(|_, _, _| Ok(()));
        stack.expect_stop_advertising().times(1).returning(|| Ok(()));

        let mut sm = machine(stack);
        sm.start().await.unwrap();
        sm.handle_event(connect(1)).await.unwrap();

        assert!(sm.handle_event(connect(2)).await.is_err());
        assert_eq!(sm.snapshot().peer_handle(), Some(PeerHandle(1)));
    }

    #[tokio::test]
    async fn test_disconnect_with_other_handle_ends_connection() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(2).returning(|_, _, _| Ok(()));
        stack.expect_stop_advertising().times(1).returning(|| Ok(()));

        let mut sm = machine(stack);
        sm.start().await.unwrap();
        sm.handle_event(connect(2)).await.unwrap();

        sm.handle_event(disconnect(1, 8)).await.unwrap();
        assert_eq!(sm.phase(), ConnectionPhase::Advertising);
        assert_eq!(sm.snapshot().peer_handle(), None);
        assert!(sm.is_advertising());
    }

    #[tokio::test]
    async fn test_connect_before_startup_is_discarded() {
        let mut stack = MockBleStack::new();
        stack.expect_stop_advertising().times(0);

        let mut sm = machine(stack);
        assert!(sm.handle_event(connect(1)).await.is_err());
        assert_eq!(sm.phase(), ConnectionPhase::Idle);
        assert_eq!(sm.snapshot().peer_handle(), None);
    }

    #[tokio::test]
    async fn test_failed_restart_is_retried_later() {
        let mut stack = MockBleStack::new();
        let mut seq = mockall::Sequence::new();
        stack
            .expect_advertise()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        stack
            .expect_advertise()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(Error::stack("advertise", "controller busy")));
        stack
            .expect_advertise()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        stack.expect_stop_advertising().times(1).returning(|| Ok(()));

        let mut sm = machine(stack);
        sm.set_advertise_attempts(2);
        sm.start().await.unwrap();
        sm.handle_event(connect(1)).await.unwrap();

        let result = sm.handle_event(disconnect(1, 19)).await;
        assert!(matches!(result, Err(Error::StackUnavailable { .. })));
        assert_eq!(sm.phase(), ConnectionPhase::Advertising);
        assert!(!sm.is_advertising());

        assert!(sm.ensure_advertising().await.unwrap());
        assert!(sm.is_advertising());
        assert!(!sm.ensure_advertising().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_failure_still_connects() {
        let mut stack = MockBleStack::new();
        stack.expect_advertise().times(1).returning(|_, _, _| Ok(()));
        stack
            .expect_stop_advertising()
            .times(1)
            .returning(|| Err(Error::stack("stop advertising", "radio not active")));

        let mut sm = machine(stack);
        sm.start().await.unwrap();

        assert!(sm.handle_event(connect(1)).await.is_err());
        assert_eq!(sm.phase(), ConnectionPhase::Connected);
        assert!(!sm.is_advertising());
    }

    #[tokio::test]
    async fn test_startup_failure_still_leaves_idle() {
        let mut stack = MockBleStack::new();
        stack
            .expect_advertise()
            .times(1)
            .returning(|_, _, _| Err(Error::stack("advertise", "radio not active")));

        let mut sm = machine(stack);
        assert!(sm.start().await.is_err());
        assert_eq!(sm.phase(), ConnectionPhase::Advertising);
        assert!(!sm.is_advertising());
    }
}
