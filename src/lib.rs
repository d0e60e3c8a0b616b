//! # ble-status-peripheral
//!
//! A Bluetooth Low Energy peripheral that advertises a single service,
//! accepts one central at a time, pushes a fixed notification to it once per
//! period and shows the connection status on an LED.
//!
//! The radio and the LED are collaborators behind the [`BleStack`] and
//! [`Indicator`] traits. This crate provides the lifecycle around them:
//!
//! - **Advertising**: Complete Local Name payload, idempotent start/stop
//! - **Connection state machine**: `Idle → Advertising → Connected → Advertising`,
//!   with out-of-phase events logged and discarded
//! - **Notifications**: write + notify of a fixed payload while connected
//! - **Status indicator**: blinking while advertising, solid while connected
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_status_peripheral::sim::{MemoryIndicator, SimulatedStack};
//! use ble_status_peripheral::{Peripheral, PeripheralConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let stack = Arc::new(SimulatedStack::new());
//!     let led = Arc::new(MemoryIndicator::new());
//!
//!     let peripheral = Peripheral::new(PeripheralConfig::default(), stack, led);
//!     peripheral.run_until_interrupted().await
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config and state types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod indicator;
pub mod notification;
pub mod peripheral;
pub mod sim;

// Re-exports for convenience
pub use config::PeripheralConfig;
pub use error::{Error, Result};
pub use indicator::{Indicator, IndicatorPattern, StatusIndicator};
pub use notification::{NotificationPayload, NotificationScheduler, NotificationStats, SendOutcome};
pub use peripheral::Peripheral;

// Re-export commonly used types from submodules
pub use ble::advertising::{AdvertisingController, AdvertisingPayload};
pub use ble::connection::{
    ConnectedPeer, ConnectionPhase, ConnectionState, ConnectionStateMachine, PhaseChange,
    StateReader,
};
pub use ble::gatt::{CharacteristicFlags, CharacteristicHandle, PeerHandle, PeripheralIdentity};
pub use ble::stack::{AddressType, BdAddr, BleStack, DisconnectReason, EventSink, StackEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Peripheral>();
        let _ = std::any::TypeId::of::<ConnectionStateMachine>();
        let _ = std::any::TypeId::of::<NotificationScheduler>();
        let _ = std::any::TypeId::of::<StatusIndicator>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<PeripheralConfig>();
    }
}
