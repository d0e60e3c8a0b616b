//! BLE peripheral module.
//!
//! Advertising, GATT identity, the stack collaborator interface and the
//! connection lifecycle.

pub mod advertising;
pub mod connection;
pub mod gatt;
pub mod stack;
pub mod uuids;

pub use advertising::{AdvertisingController, AdvertisingPayload};
pub use connection::{ConnectionPhase, ConnectionState, ConnectionStateMachine, StateReader};
pub use gatt::{CharacteristicHandle, PeerHandle, PeripheralIdentity};
pub use stack::{BleStack, EventSink, StackEvent};
pub use uuids::*;
