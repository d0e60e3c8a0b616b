//! Run the peripheral against the in-memory stack, with a scripted central
//! that connects, receives a few notifications and leaves.
//!
//! Run with: cargo run --example simulated_peripheral

use std::sync::Arc;
use std::time::Duration;

use ble_status_peripheral::sim::{MemoryIndicator, SimulatedStack};
use ble_status_peripheral::{
    BdAddr, DisconnectReason, PeerHandle, Peripheral, PeripheralConfig, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_status_peripheral=debug".parse().unwrap()),
        )
        .init();

    let stack = Arc::new(SimulatedStack::new());
    let led = Arc::new(MemoryIndicator::new());
    let peripheral = Arc::new(Peripheral::new(
        PeripheralConfig::default(),
        stack.clone(),
        led.clone(),
    ));

    println!("LED starts flashing... press Ctrl-C to stop.\n");

    let central = {
        let stack = stack.clone();
        tokio::spawn(async move {
            let peer = PeerHandle(64);
            let address: BdAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();

            tokio::time::sleep(Duration::from_secs(3)).await;
            println!("Central {} connecting", address);
            stack.connect_central(peer, address);

            tokio::time::sleep(Duration::from_secs(5)).await;
            println!("Central leaving");
            stack.disconnect_central(peer, DisconnectReason::REMOTE_USER_TERMINATED);
        })
    };

    let result = peripheral.run_until_interrupted().await;
    central.abort();

    println!("\nNotifications delivered: {}", stack.delivered().len());
    println!("LED level changes: {}", led.history().len());
    println!("LED on at exit: {}", led.is_on());

    result
}
