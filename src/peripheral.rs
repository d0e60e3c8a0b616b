//! Peripheral bring-up, background tasks and shutdown.
//!
//! [`Peripheral`] activates the stack, registers the service and then runs
//! two tasks: the event task, which owns the [`ConnectionStateMachine`] and
//! applies stack events in arrival order, and the tick task, which drives the
//! indicator and sends the notification once per period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::ble::advertising::AdvertisingController;
use crate::ble::connection::{
    ConnectionPhase, ConnectionState, ConnectionStateMachine, PhaseChange, StateReader,
};
use crate::ble::stack::{BleStack, EventSink, StackEvent};
use crate::config::PeripheralConfig;
use crate::error::{Error, Result};
use crate::indicator::{Indicator, StatusIndicator};
use crate::notification::{NotificationScheduler, NotificationStats};

struct Running {
    state: StateReader,
    phase_tx: broadcast::Sender<PhaseChange>,
    scheduler: Arc<NotificationScheduler>,
    shutdown_tx: watch::Sender<bool>,
    event_task: JoinHandle<ConnectionStateMachine>,
    tick_task: JoinHandle<StatusIndicator>,
}

/// A single-connection BLE peripheral with a status indicator.
pub struct Peripheral {
    config: PeripheralConfig,
    stack: Arc<dyn BleStack>,
    line: Arc<dyn Indicator>,
    is_running: AtomicBool,
    running: RwLock<Option<Running>>,
}

impl Peripheral {
    /// Create a peripheral. Nothing touches the stack until [`start`](Self::start).
    pub fn new(
        config: PeripheralConfig,
        stack: Arc<dyn BleStack>,
        line: Arc<dyn Indicator>,
    ) -> Self {
        Self {
            config,
            stack,
            line,
            is_running: AtomicBool::new(false),
            running: RwLock::new(None),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// Activate the stack, register the service, start advertising and spawn
    /// the background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the peripheral is already
    /// running, or the stack cannot be activated or the service registered.
    /// A failure to advertise is not an error here; it is retried.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        match self.bring_up().await {
            Ok(running) => {
                *self.running.write() = Some(running);
                Ok(())
            }
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<Running> {
        self.config.validate()?;

        info!("Activating BLE stack");
        self.stack.activate().await?;

        let identity = self.config.identity.clone();
        let characteristic = self.stack.register_service(identity.service()).await?;
        info!(
            "Registered service {} with characteristic {} at {}",
            identity.service().uuid,
            identity.service().characteristic.uuid,
            characteristic
        );

        let (sink, events) = EventSink::channel();
        self.stack.set_event_sink(sink);

        let mut machine = ConnectionStateMachine::new(
            identity,
            characteristic,
            AdvertisingController::new(self.stack.clone()),
            self.config.advertising_interval_ms,
        );
        machine.set_advertise_attempts(self.config.advertising_attempts);

        if let Err(e) = machine.start().await {
            error!("Initial advertising failed, will retry: {}", e);
        }

        let state = machine.reader();
        let phase_tx = machine.phase_sender();
        let phase_rx = machine.subscribe();

        let mut scheduler = NotificationScheduler::new(
            self.stack.clone(),
            state.clone(),
            self.config.payload.clone(),
        );
        scheduler.set_send_timeout(self.config.send_timeout);
        let scheduler = Arc::new(scheduler);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let event_task = tokio::spawn(run_events(
            machine,
            events,
            self.config.advertising_retry_period,
            shutdown_rx.clone(),
        ));
        let tick_task = tokio::spawn(run_ticks(
            StatusIndicator::new(self.line.clone()),
            scheduler.clone(),
            state.clone(),
            phase_rx,
            self.config.tick_period,
            shutdown_rx,
        ));

        Ok(Running {
            state,
            phase_tx,
            scheduler,
            shutdown_tx,
            event_task,
            tick_task,
        })
    }

    /// Stop both tasks, stop advertising and turn the indicator off.
    pub async fn shutdown(&self) -> Result<()> {
        let running = self.running.write().take();
        let running = match running {
            Some(running) => running,
            None => return Ok(()),
        };

        info!("Shutting down peripheral");
        let _ = running.shutdown_tx.send(true);

        let (machine, indicator) =
            futures::future::join(running.event_task, running.tick_task).await;

        let mut result = Ok(());
        match machine {
            Ok(mut machine) => {
                if let Err(e) = machine.shutdown().await {
                    warn!("Failed to stop advertising: {}", e);
                    result = Err(e);
                }
            }
            Err(e) => error!("Event task ended abnormally: {}", e),
        }

        // A finished tick task has already turned the indicator off.
        if let Err(e) = indicator {
            error!("Tick task ended abnormally: {}", e);
            StatusIndicator::new(self.line.clone()).force_off();
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Finished");

        result
    }

    /// Start, run until Ctrl-C, then shut down.
    pub async fn run_until_interrupted(&self) -> Result<()> {
        self.start().await?;
        info!(
            "Advertising started. Look for '{}' on your phone.",
            self.config.identity.name()
        );

        let signal = tokio::signal::ctrl_c().await;
        if signal.is_ok() {
            info!("Interrupted");
        }

        let result = self.shutdown().await;
        signal.map_err(|e| Error::Internal(format!("Failed to listen for Ctrl-C: {}", e)))?;
        result
    }

    /// Check if the background tasks are running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Current phase. [`ConnectionPhase::Idle`] when not running.
    pub fn phase(&self) -> ConnectionPhase {
        self.running
            .read()
            .as_ref()
            .map(|r| r.state.phase())
            .unwrap_or_default()
    }

    /// Copy of the connection state, if running.
    pub fn state(&self) -> Option<ConnectionState> {
        self.running.read().as_ref().map(|r| r.state.snapshot())
    }

    /// Subscribe to phase transitions, if running.
    pub fn subscribe_phase_changes(&self) -> Option<broadcast::Receiver<PhaseChange>> {
        self.running.read().as_ref().map(|r| r.phase_tx.subscribe())
    }

    /// Notification counters, zero when not running.
    pub fn notification_stats(&self) -> NotificationStats {
        self.running
            .read()
            .as_ref()
            .map(|r| r.scheduler.stats())
            .unwrap_or_default()
    }
}

impl Drop for Peripheral {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(true);
        }
        self.is_running.store(false, Ordering::SeqCst);
    }
}

async fn run_events(
    mut machine: ConnectionStateMachine,
    mut events: mpsc::UnboundedReceiver<StackEvent>,
    retry_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> ConnectionStateMachine {
    let mut retry =
        tokio::time::interval_at(tokio::time::Instant::now() + retry_period, retry_period);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = machine.handle_event(event).await {
                        match e {
                            Error::UnexpectedEvent { .. } => debug!("{}", e),
                            _ if e.is_transient() => warn!("Transition incomplete: {}", e),
                            _ => error!("Transition incomplete: {}", e),
                        }
                    }
                }
                None => {
                    debug!("Event sink closed");
                    break;
                }
            },
            _ = retry.tick() => {
                if let Err(e) = machine.ensure_advertising().await {
                    error!("Advertising still unavailable: {}", e);
                }
            }
        }
    }

    debug!("Event task ended");
    machine
}

async fn run_ticks(
    mut indicator: StatusIndicator,
    scheduler: Arc<NotificationScheduler>,
    state: StateReader,
    mut phase_rx: broadcast::Receiver<PhaseChange>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> StatusIndicator {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut phase_open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            change = phase_rx.recv(), if phase_open => {
                match change {
                    Ok(change) => debug!("Phase {} -> {}", change.from, change.to),
                    Err(RecvError::Lagged(skipped)) => debug!("Missed {} phase changes", skipped),
                    Err(RecvError::Closed) => {
                        phase_open = false;
                        continue;
                    }
                }
                indicator.apply(state.phase());
                ticker.reset();
            }
            _ = ticker.tick() => {
                indicator.apply(state.phase());
                scheduler.tick().await;
            }
        }
    }

    indicator.force_off();
    debug!("Tick task ended");
    indicator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{CharacteristicHandle, PeerHandle};
    use crate::ble::stack::{BdAddr, DisconnectReason, MockBleStack};
    use crate::sim::{MemoryIndicator, SimulatedStack};
    use pretty_assertions::assert_eq;

    fn peripheral(stack: Arc<SimulatedStack>, line: Arc<MemoryIndicator>) -> Peripheral {
        Peripheral::new(PeripheralConfig::default(), stack, line)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let stack = Arc::new(SimulatedStack::new());
        let line = Arc::new(MemoryIndicator::new());
        let peripheral = peripheral(stack.clone(), line.clone());

        peripheral.start().await.unwrap();
        assert!(peripheral.is_running());
        assert!(stack.is_active());
        assert!(stack.is_advertising());
        assert_eq!(peripheral.phase(), ConnectionPhase::Advertising);
        assert!(matches!(peripheral.start().await, Err(Error::AlreadyRunning)));

        peripheral.shutdown().await.unwrap();
        assert!(!peripheral.is_running());
        assert!(!stack.is_advertising());
        assert!(!line.is_on());
        assert_eq!(peripheral.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_turns_indicator_off() {
        let stack = Arc::new(SimulatedStack::new());
        let line = Arc::new(MemoryIndicator::new());
        let peripheral = peripheral(stack.clone(), line.clone());
        peripheral.start().await.unwrap();

        stack.connect_central(PeerHandle(1), BdAddr::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(line.is_on());

        drop(peripheral);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!line.is_on());
        assert_eq!(line.history().last(), Some(&false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_not_blocked_by_stalled_notify() {
        let stack = Arc::new(SimulatedStack::new());
        let line = Arc::new(MemoryIndicator::new());
        let peripheral = peripheral(stack.clone(), line.clone());
        peripheral.start().await.unwrap();

        stack.set_notify_delay(Some(Duration::from_secs(30)));
        stack.connect_central(PeerHandle(1), BdAddr::default());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // The tick task is now waiting on notify.
        stack.disconnect_central(PeerHandle(1), DisconnectReason::SUPERVISION_TIMEOUT);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(peripheral.phase(), ConnectionPhase::Advertising);
        assert_eq!(peripheral.state().unwrap().peer_handle(), None);
        assert!(stack.is_advertising());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(peripheral.notification_stats().failed, 1);

        peripheral.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_activation_failure_is_returned() {
        let mut stack = MockBleStack::new();
        stack
            .expect_activate()
            .times(1)
            .returning(|| Err(Error::stack("activate", "no controller")));

        let peripheral = Peripheral::new(
            PeripheralConfig::default(),
            Arc::new(stack),
            Arc::new(MemoryIndicator::new()),
        );
        assert!(peripheral.start().await.is_err());
        assert!(!peripheral.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut stack = MockBleStack::new();
        stack.expect_activate().times(0);

        let peripheral = Peripheral::new(
            PeripheralConfig::default().advertising_attempts(0),
            Arc::new(stack),
            Arc::new(MemoryIndicator::new()),
        );
        assert!(matches!(
            peripheral.start().await,
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_service_once() {
        let stack = Arc::new(SimulatedStack::new());
        let peripheral = peripheral(stack.clone(), Arc::new(MemoryIndicator::new()));
        peripheral.start().await.unwrap();

        assert_eq!(
            peripheral.state().unwrap().characteristic(),
            CharacteristicHandle(SimulatedStack::FIRST_HANDLE)
        );
        peripheral.shutdown().await.unwrap();
        peripheral.shutdown().await.unwrap();
    }
}
