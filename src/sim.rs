//! In-memory BLE stack and indicator.
//!
//! [`SimulatedStack`] records every call, can inject failures and plays the
//! role of a central through [`SimulatedStack::connect_central`] and
//! [`SimulatedStack::disconnect_central`]. Used by the tests and the demo.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicHandle, PeerHandle, ServiceDefinition};
use crate::ble::stack::{AddressType, BdAddr, BleStack, DisconnectReason, EventSink, StackEvent};
use crate::error::{Error, Result};
use crate::indicator::Indicator;

/// A call made into the simulated stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    /// `activate`.
    Activate,
    /// `register_service`.
    RegisterService(Uuid),
    /// `advertise`.
    Advertise {
        /// Advertising interval.
        interval_ms: u32,
        /// AD payload.
        payload: Vec<u8>,
    },
    /// `stop_advertising`.
    StopAdvertising,
    /// `write_characteristic`.
    Write {
        /// Target handle.
        handle: CharacteristicHandle,
        /// Value written.
        value: Vec<u8>,
    },
    /// `notify`.
    Notify {
        /// Target peer.
        peer: PeerHandle,
        /// Notified handle.
        handle: CharacteristicHandle,
        /// Value notified.
        value: Vec<u8>,
    },
}

#[derive(Default)]
struct SimState {
    active: bool,
    advertising: Option<Vec<u8>>,
    connected: Option<PeerHandle>,
    values: HashMap<CharacteristicHandle, Vec<u8>>,
    next_handle: u16,
    calls: Vec<StackCall>,
    delivered: Vec<(PeerHandle, Vec<u8>)>,
    sink: Option<EventSink>,
    fail_advertise: u32,
    fail_write: u32,
    fail_notify: u32,
    notify_delay: Option<Duration>,
}

impl SimState {
    fn take_failure(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

/// Simulated BLE stack.
#[derive(Default)]
pub struct SimulatedStack {
    state: Mutex<SimState>,
}

impl SimulatedStack {
    /// First attribute handle handed out by `register_service`.
    pub const FIRST_HANDLE: u16 = 0x0010;

    /// Create a powered-down stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` advertise calls.
    pub fn fail_next_advertise(&self, count: u32) {
        self.state.lock().fail_advertise = count;
    }

    /// Fail the next `count` characteristic writes.
    pub fn fail_next_write(&self, count: u32) {
        self.state.lock().fail_write = count;
    }

    /// Fail the next `count` notify calls.
    pub fn fail_next_notify(&self, count: u32) {
        self.state.lock().fail_notify = count;
    }

    /// Delay every notify call, simulating a stalled link.
    pub fn set_notify_delay(&self, delay: Option<Duration>) {
        self.state.lock().notify_delay = delay;
    }

    /// Simulate a central connecting. Connectable advertising halts, as on a
    /// real link layer.
    pub fn connect_central(&self, peer: PeerHandle, address: BdAddr) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.connected = Some(peer);
            state.advertising = None;
            state.sink.clone()
        };
        Self::deliver(
            sink,
            StackEvent::CentralConnected {
                peer,
                address_type: AddressType::Public,
                address,
            },
        )
    }

    /// Simulate the central leaving.
    pub fn disconnect_central(&self, peer: PeerHandle, reason: DisconnectReason) -> bool {
        let sink = {
            let mut state = self.state.lock();
            if state.connected == Some(peer) {
                state.connected = None;
            }
            state.sink.clone()
        };
        Self::deliver(sink, StackEvent::CentralDisconnected { peer, reason })
    }

    /// Deliver an arbitrary event without touching link state.
    pub fn inject_event(&self, event: StackEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        Self::deliver(sink, event)
    }

    fn deliver(sink: Option<EventSink>, event: StackEvent) -> bool {
        match sink {
            Some(sink) => sink.deliver(event),
            None => {
                debug!("No event sink installed, dropping {}", event.kind());
                false
            }
        }
    }

    /// Whether the radio is advertising.
    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising.is_some()
    }

    /// The payload currently advertised.
    pub fn advertised_payload(&self) -> Option<Vec<u8>> {
        self.state.lock().advertising.clone()
    }

    /// Whether the radio was activated.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Stored value of a characteristic.
    pub fn characteristic_value(&self, handle: CharacteristicHandle) -> Option<Vec<u8>> {
        self.state.lock().values.get(&handle).cloned()
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<StackCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `advertise` calls so far.
    pub fn advertise_count(&self) -> usize {
        self.count(|c| matches!(c, StackCall::Advertise { .. }))
    }

    /// Number of `stop_advertising` calls so far.
    pub fn stop_count(&self) -> usize {
        self.count(|c| matches!(c, StackCall::StopAdvertising))
    }

    /// Peers that accepted a notification, in order.
    pub fn notified_peers(&self) -> Vec<PeerHandle> {
        self.state
            .lock()
            .delivered
            .iter()
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Notifications accepted by a connected peer, in order.
    pub fn delivered(&self) -> Vec<(PeerHandle, Vec<u8>)> {
        self.state.lock().delivered.clone()
    }

    fn count(&self, pred: impl Fn(&StackCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn ensure_active(state: &SimState, operation: &'static str) -> Result<()> {
        if state.active {
            Ok(())
        } else {
            Err(Error::stack(operation, "radio not active"))
        }
    }
}

#[async_trait]
impl BleStack for SimulatedStack {
    async fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::Activate);
        state.active = true;
        Ok(())
    }

    async fn register_service(&self, service: &ServiceDefinition) -> Result<CharacteristicHandle> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::RegisterService(service.uuid));
        Self::ensure_active(&state, "register service")?;

        let handle = CharacteristicHandle(Self::FIRST_HANDLE + state.next_handle);
        state.next_handle += 1;
        state.values.insert(handle, Vec::new());

        Ok(handle)
    }

    async fn advertise(&self, interval_ms: u32, payload: &[u8], _connectable: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::Advertise {
            interval_ms,
            payload: payload.to_vec(),
        });
        Self::ensure_active(&state, "advertise")?;
        if SimState::take_failure(&mut state.fail_advertise) {
            return Err(Error::stack("advertise", "controller busy"));
        }

        state.advertising = Some(payload.to_vec());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::StopAdvertising);
        Self::ensure_active(&state, "stop advertising")?;

        state.advertising = None;
        Ok(())
    }

    async fn write_characteristic(&self, handle: CharacteristicHandle, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(StackCall::Write {
            handle,
            value: value.to_vec(),
        });
        if SimState::take_failure(&mut state.fail_write) {
            return Err(Error::stack("write characteristic", "write rejected"));
        }

        match state.values.get_mut(&handle) {
            Some(stored) => {
                *stored = value.to_vec();
                Ok(())
            }
            None => Err(Error::stack("write characteristic", "invalid handle")),
        }
    }

    async fn notify(
        &self,
        peer: PeerHandle,
        handle: CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        let delay = self.state.lock().notify_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.calls.push(StackCall::Notify {
            peer,
            handle,
            value: value.to_vec(),
        });
        if SimState::take_failure(&mut state.fail_notify) {
            return Err(Error::stack("notify", "link busy"));
        }
        if state.connected != Some(peer) {
            return Err(Error::stack("notify", "peer not connected"));
        }

        state.delivered.push((peer, value.to_vec()));
        Ok(())
    }

    fn set_event_sink(&self, sink: EventSink) {
        self.state.lock().sink = Some(sink);
    }
}

/// Indicator that keeps its level and history in memory.
#[derive(Debug, Default)]
pub struct MemoryIndicator {
    levels: Mutex<Vec<bool>>,
}

impl MemoryIndicator {
    /// Create an indicator that starts off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level.
    pub fn is_on(&self) -> bool {
        self.levels.lock().last().copied().unwrap_or(false)
    }

    /// Every level driven so far, oldest first.
    pub fn history(&self) -> Vec<bool> {
        self.levels.lock().clone()
    }

    fn push(&self, level: bool) {
        self.levels.lock().push(level);
    }
}

impl Indicator for MemoryIndicator {
    fn set_on(&self) -> Result<()> {
        self.push(true);
        Ok(())
    }

    fn set_off(&self) -> Result<()> {
        self.push(false);
        Ok(())
    }

    fn toggle(&self) -> Result<()> {
        let level = !self.is_on();
        self.push(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_requires_activation() {
        let stack = SimulatedStack::new();
        assert!(stack.advertise(100, b"\x02\x09a", true).await.is_err());

        stack.activate().await.unwrap();
        stack.advertise(100, b"\x02\x09a", true).await.unwrap();
        assert!(stack.is_advertising());
        assert_eq!(stack.advertise_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_halts_advertising() {
        let stack = SimulatedStack::new();
        let (sink, mut rx) = EventSink::channel();
        stack.set_event_sink(sink);
        stack.activate().await.unwrap();
        stack.advertise(100, b"\x02\x09a", true).await.unwrap();

        assert!(stack.connect_central(PeerHandle(1), BdAddr::default()));
        assert!(!stack.is_advertising());
        assert_eq!(rx.recv().await.unwrap().peer(), PeerHandle(1));
    }

    #[tokio::test]
    async fn test_notify_needs_live_peer() {
        let stack = SimulatedStack::new();
        stack.activate().await.unwrap();
        let handle = stack
            .register_service(crate::ble::gatt::PeripheralIdentity::default().service())
            .await
            .unwrap();
        assert_eq!(handle, CharacteristicHandle(SimulatedStack::FIRST_HANDLE));

        stack.write_characteristic(handle, b"55").await.unwrap();
        assert_eq!(stack.characteristic_value(handle), Some(b"55".to_vec()));
        assert!(stack.notify(PeerHandle(1), handle, b"55").await.is_err());

        stack.connect_central(PeerHandle(1), BdAddr::default());
        stack.notify(PeerHandle(1), handle, b"55").await.unwrap();
        assert_eq!(stack.notified_peers(), vec![PeerHandle(1)]);
        let notify_calls = stack
            .calls()
            .into_iter()
            .filter(|c| matches!(c, StackCall::Notify { .. }))
            .count();
        assert_eq!(notify_calls, 2);
    }

    #[test]
    fn test_memory_indicator() {
        let line = MemoryIndicator::new();
        assert!(!line.is_on());
        line.toggle().unwrap();
        line.toggle().unwrap();
        line.set_on().unwrap();
        line.set_off().unwrap();
        assert_eq!(line.history(), vec![true, false, true, false]);
    }
}
