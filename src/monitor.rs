//! Connection monitor: keeps a device connected across drops.
//!
//! The monitor watches one connection, votes to keep it alive while the
//! keep-alive flag is set, and schedules reconnect attempts with
//! exponential backoff after every disconnect. A radio power-on event
//! short-circuits the wait, since a scheduled attempt is pointless while
//! the adapter is off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::connection::{
    Connection, ConnectionHandler, ConnectionListener, IdleDecision, ListenerId,
};
use crate::platform::AdapterEvent;
use crate::registry::Central;
use crate::types::{Address, ConnectionState, Transport};

const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(2500);
const MAX_RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`ConnectionMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay before the first reconnect attempt after a disconnect.
    pub initial_timeout: Duration,

    /// Ceiling for the doubled delays.
    pub max_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_timeout: MAX_RECONNECT_TIMEOUT,
        }
    }
}

/// Exponential backoff bookkeeping: yields the current delay and doubles it
/// up to the cap; reset on every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// The delay to use for the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Registration {
    connection: Arc<Connection>,
    listener_id: ListenerId,
    handler_id: ListenerId,
    adapter_task: JoinHandle<()>,
}

struct MonitorShared {
    keep_alive: AtomicBool,
    listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
    backoff: Mutex<Backoff>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorShared {
    fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }
}

/// Schedule a reconnect attempt after the current backoff delay, replacing
/// any attempt already scheduled.
fn schedule_reconnect(shared: &Arc<MonitorShared>, connection: &Arc<Connection>) {
    let delay = shared.backoff.lock().unwrap().next_delay();
    debug!(
        "will try to reconnect to {} in {:?}",
        connection.address(),
        delay
    );
    let task_shared = Arc::clone(shared);
    let task_connection = Arc::clone(connection);
    let task = tokio::spawn(async move {
        sleep(delay).await;
        if task_shared.keep_alive() {
            debug!("reconnecting to {}", task_connection.address());
            task_connection.connect();
        }
    });
    let mut slot = shared.reconnect.lock().unwrap();
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

/// The monitor's view on the connection: forwards events to the user
/// listener, reschedules reconnects, and casts the idle keep-alive vote.
struct MonitorListener {
    shared: Arc<MonitorShared>,
    connection: Arc<Connection>,
}

impl ConnectionListener for MonitorListener {
    fn on_connection_state_changed(&self, connection: &Connection, state: ConnectionState) {
        let forward = self.shared.listener.lock().unwrap().clone();
        if let Some(listener) = forward {
            listener.on_connection_state_changed(connection, state);
        }
        match state {
            ConnectionState::Disconnected => {
                if self.shared.keep_alive() {
                    schedule_reconnect(&self.shared, &self.connection);
                }
            }
            ConnectionState::Connected => {
                self.shared.backoff.lock().unwrap().reset();
            }
            ConnectionState::Connecting => {}
        }
    }

    fn on_services_discovered(&self, connection: &Connection) {
        let forward = self.shared.listener.lock().unwrap().clone();
        if let Some(listener) = forward {
            listener.on_services_discovered(connection);
        }
    }
}

impl ConnectionHandler for MonitorListener {
    fn on_connection_idle(&self, _connection: &Connection) -> IdleDecision {
        if self.shared.keep_alive() {
            IdleDecision::KeepAlive
        } else {
            IdleDecision::Disconnect
        }
    }
}

/// Long-lived policy object keeping one device connected.
pub struct ConnectionMonitor {
    central: Arc<Central>,
    address: Address,
    transport: Mutex<Transport>,
    shared: Arc<MonitorShared>,
    registration: Mutex<Option<Registration>>,
}

impl ConnectionMonitor {
    pub(crate) fn new(central: Arc<Central>, address: Address, config: MonitorConfig) -> Self {
        Self {
            central,
            address,
            transport: Mutex::new(Transport::default()),
            shared: Arc::new(MonitorShared {
                keep_alive: AtomicBool::new(false),
                listener: Mutex::new(None),
                backoff: Mutex::new(Backoff::new(config.initial_timeout, config.max_timeout)),
                reconnect: Mutex::new(None),
            }),
            registration: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the monitor should hold the connection open and re-establish
    /// it after drops.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.shared.keep_alive.store(keep_alive, Ordering::SeqCst);
    }

    pub fn keep_alive(&self) -> bool {
        self.shared.keep_alive()
    }

    pub fn set_transport(&self, transport: Transport) {
        *self.transport.lock().unwrap() = transport;
        let registration = self.registration.lock().unwrap();
        if let Some(registration) = registration.as_ref() {
            registration.connection.set_transport(transport);
        }
    }

    /// Forward connection state and discovery events to `listener`.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }

    /// The monitored connection, while started.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        let registration = self.registration.lock().unwrap();
        registration.as_ref().map(|r| Arc::clone(&r.connection))
    }

    /// Attach to the connection and, with keep-alive set, connect. No-op if
    /// already started.
    pub fn start(&self) {
        let mut registration = self.registration.lock().unwrap();
        if registration.is_some() {
            return;
        }
        let connection = self.central.connection(self.address);
        connection.set_transport(*self.transport.lock().unwrap());

        let listener = Arc::new(MonitorListener {
            shared: Arc::clone(&self.shared),
            connection: Arc::clone(&connection),
        });
        let listener_id = connection.add_connection_listener(listener.clone());
        let handler_id = connection.add_connection_handler(listener);

        // a power cycle preempts any scheduled attempt: retry right away
        let mut events = self.central.adapter().adapter_events();
        let shared = Arc::clone(&self.shared);
        let event_connection = Arc::clone(&connection);
        let adapter_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::PoweredOn) => {
                        if shared.keep_alive() {
                            debug!(
                                "adapter powered on, reconnecting to {}",
                                event_connection.address()
                            );
                            event_connection.connect();
                        }
                    }
                    Ok(AdapterEvent::PoweredOff) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *registration = Some(Registration {
            connection: Arc::clone(&connection),
            listener_id,
            handler_id,
            adapter_task,
        });
        drop(registration);

        if self.shared.keep_alive() {
            connection.connect();
        }
    }

    /// Detach from the connection and drop every scheduled attempt. The
    /// connection itself is left to the idle-disconnect policy.
    pub fn stop(&self) {
        let registration = self.registration.lock().unwrap().take();
        let Some(registration) = registration else {
            return;
        };
        registration.adapter_task.abort();
        if let Some(task) = self.shared.reconnect.lock().unwrap().take() {
            task.abort();
        }
        registration
            .connection
            .remove_connection_listener(registration.listener_id);
        registration
            .connection
            .remove_connection_handler(registration.handler_id);
    }

    pub fn is_started(&self) -> bool {
        self.registration.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockRequest};
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const CHAR: Uuid = Uuid::from_u128(0x2000);

    fn addr() -> Address {
        Address::new([7, 7, 7, 7, 7, 7])
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            initial_timeout: Duration::from_millis(20),
            max_timeout: Duration::from_millis(100),
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(DEFAULT_RECONNECT_TIMEOUT, MAX_RECONNECT_TIMEOUT);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![2500, 5000, 10000, 20000, 40000, 60000, 60000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_keep_alive_connects_on_start() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![1]);
        let central = Central::new(adapter);

        let monitor = central.monitor_with_config(addr(), fast_config());
        monitor.set_keep_alive(true);
        monitor.start();

        let connection = monitor.connection().expect("monitor not started");
        wait_for("connect", || connection.is_connected()).await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![1]);
        let central = Central::new(adapter);

        let monitor = central.monitor_with_config(addr(), fast_config());
        monitor.set_keep_alive(true);
        monitor.start();
        let connection = monitor.connection().expect("monitor not started");
        wait_for("first connect", || connection.is_connected()).await;

        peripheral.drop_link(crate::types::GattStatus::ERROR);
        wait_for("reconnect", || {
            let connects = peripheral
                .requests()
                .iter()
                .filter(|r| matches!(r, MockRequest::Connect))
                .count();
            connects >= 2 && connection.is_connected()
        })
        .await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_scheduled_reconnect() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![1]);
        let central = Central::new(adapter);

        let monitor = central.monitor_with_config(
            addr(),
            MonitorConfig {
                initial_timeout: Duration::from_millis(80),
                max_timeout: Duration::from_millis(200),
            },
        );
        monitor.set_keep_alive(true);
        monitor.start();
        let connection = monitor.connection().expect("monitor not started");
        wait_for("connect", || connection.is_connected()).await;

        peripheral.drop_link(crate::types::GattStatus::ERROR);
        sleep(Duration::from_millis(10)).await;
        monitor.stop();
        sleep(Duration::from_millis(200)).await;
        let connects = peripheral
            .requests()
            .iter()
            .filter(|r| matches!(r, MockRequest::Connect))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_radio_on_retries_immediately() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![1]);
        adapter.set_enabled(false);
        let central = Central::new(adapter.clone());

        let monitor = central.monitor_with_config(addr(), fast_config());
        monitor.set_keep_alive(true);
        monitor.start();
        let connection = monitor.connection().expect("monitor not started");
        sleep(Duration::from_millis(50)).await;
        assert!(!connection.is_connected());

        adapter.set_enabled(true);
        wait_for("connect after power on", || connection.is_connected()).await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_monitor_vote_keeps_idle_connection() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, b"x".to_vec());
        let central = Central::new(adapter);

        let monitor = central.monitor_with_config(addr(), fast_config());
        monitor.set_keep_alive(true);
        monitor.start();
        let connection = monitor.connection().expect("monitor not started");
        wait_for("connect", || connection.is_connected()).await;

        let results = central
            .operation(addr())
            .read(SERVICE, CHAR)
            .build()
            .execute()
            .await
            .unwrap();
        assert!(results.was_successful());
        sleep(Duration::from_millis(100)).await;
        assert!(connection.is_connected());
        monitor.stop();
    }
}
