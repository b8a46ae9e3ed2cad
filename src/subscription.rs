//! Persistent notification subscriptions.
//!
//! A [`Subscription`] pairs two one-shot operations (subscribe and
//! unsubscribe) with connection-state observation: whenever the device
//! (re)connects, the subscribe operation runs again, so the remote CCCD
//! survives reconnects. Stopping unsubscribes only if no other listener
//! still needs the characteristic.

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use uuid::Uuid;

use crate::command::CommandResult;
use crate::connection::{CharacteristicListener, Connection, ConnectionListener, ListenerId};
use crate::operation::{Operation, OperationBuilder};
use crate::registry::Central;
use crate::types::{Address, ConnectionState};

type ListenerSlot = Arc<Mutex<Option<Arc<dyn CharacteristicListener>>>>;

fn subscribe_on_device(subscribe: &Arc<Operation>, unsubscribe: &Arc<Operation>) {
    unsubscribe.cancel();
    let operation = Arc::clone(subscribe);
    tokio::spawn(async move {
        match operation.execute().await {
            Ok(results) if !results.was_successful() => {
                warn!("subscribing on {} failed", operation.address());
            }
            Err(e) => debug!("subscribe did not complete: {}", e),
            Ok(_) => {}
        }
    });
}

fn unsubscribe_on_device(subscribe: &Arc<Operation>, unsubscribe: &Arc<Operation>) {
    subscribe.cancel();
    let operation = Arc::clone(unsubscribe);
    tokio::spawn(async move {
        match operation.execute().await {
            Ok(results) if !results.was_successful() => {
                warn!("unsubscribing on {} failed", operation.address());
            }
            Err(e) => debug!("unsubscribe did not complete: {}", e),
            Ok(_) => {}
        }
    });
}

/// Re-subscribes every time the link comes back.
struct SubscribeOnConnect {
    subscribe: Arc<Operation>,
    unsubscribe: Arc<Operation>,
}

impl ConnectionListener for SubscribeOnConnect {
    fn on_connection_state_changed(&self, _connection: &Connection, state: ConnectionState) {
        if state == ConnectionState::Connected {
            subscribe_on_device(&self.subscribe, &self.unsubscribe);
        }
    }
}

/// Forwards characteristic changes to the user listener, if any.
struct ChangeForwarder {
    listener: ListenerSlot,
}

impl CharacteristicListener for ChangeForwarder {
    fn on_characteristic_changed(&self, change: &CommandResult) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_characteristic_changed(change);
        }
    }
}

struct Registration {
    connection: Arc<Connection>,
    listener_id: ListenerId,
    change_id: ListenerId,
}

/// A started/stopped notification subscription on one characteristic.
pub struct Subscription {
    central: Arc<Central>,
    address: Address,
    service: Uuid,
    characteristic: Uuid,
    subscribe_op: Arc<Operation>,
    unsubscribe_op: Arc<Operation>,
    listener: ListenerSlot,
    registration: Mutex<Option<Registration>>,
}

impl Subscription {
    pub(crate) fn new(
        central: Arc<Central>,
        address: Address,
        service: Uuid,
        characteristic: Uuid,
    ) -> Self {
        let subscribe_op = Arc::new(
            OperationBuilder::new(Arc::clone(&central), address)
                .subscribe(service, characteristic)
                .build(),
        );
        let unsubscribe_op = Arc::new(
            OperationBuilder::new(Arc::clone(&central), address)
                .unsubscribe(service, characteristic)
                .build(),
        );
        Self {
            central,
            address,
            service,
            characteristic,
            subscribe_op,
            unsubscribe_op,
            listener: Arc::new(Mutex::new(None)),
            registration: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Receives every successfully delivered notification while started.
    pub fn set_listener(&self, listener: Arc<dyn CharacteristicListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }

    /// Register with the connection and subscribe as soon as the device is
    /// connected. No-op if already started.
    pub fn start(&self) {
        let mut registration = self.registration.lock().unwrap();
        if registration.is_some() {
            return;
        }
        debug!(
            "starting subscription on {} for {}",
            self.address, self.characteristic
        );
        self.unsubscribe_op.cancel();
        let connection = self.central.connection(self.address);
        let listener_id = connection.add_connection_listener(Arc::new(SubscribeOnConnect {
            subscribe: Arc::clone(&self.subscribe_op),
            unsubscribe: Arc::clone(&self.unsubscribe_op),
        }));
        let change_id = connection.add_change_listener(
            self.characteristic,
            Arc::new(ChangeForwarder {
                listener: Arc::clone(&self.listener),
            }),
        );
        *registration = Some(Registration {
            connection: Arc::clone(&connection),
            listener_id,
            change_id,
        });
        drop(registration);

        if connection.is_connected() {
            subscribe_on_device(&self.subscribe_op, &self.unsubscribe_op);
        } else {
            connection.connect();
        }
    }

    /// Deregister and, while still connected, disable the remote
    /// notifications unless another listener needs them.
    pub fn stop(&self) {
        let registration = self.registration.lock().unwrap().take();
        let Some(registration) = registration else {
            return;
        };
        debug!(
            "stopping subscription on {} for {}",
            self.address, self.characteristic
        );
        self.subscribe_op.cancel();
        registration
            .connection
            .remove_connection_listener(registration.listener_id);
        registration
            .connection
            .remove_change_listener(self.characteristic, registration.change_id);
        if registration.connection.is_connected() {
            unsubscribe_on_device(&self.subscribe_op, &self.unsubscribe_op);
        }
    }

    pub fn is_started(&self) -> bool {
        self.registration.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockPeripheral};
    use crate::platform::CLIENT_CHARACTERISTIC_CONFIG;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    const SERVICE: Uuid = Uuid::from_u128(0x1800);
    const CHAR: Uuid = Uuid::from_u128(0x2A05);

    fn addr() -> Address {
        Address::new([9, 8, 7, 6, 5, 4])
    }

    fn setup() -> (Arc<MockPeripheral>, Arc<Central>) {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, Vec::new());
        let central = Central::new(adapter);
        (peripheral, central)
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

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let (peripheral, central) = setup();
        let subscription = central.subscription(addr(), SERVICE, CHAR);
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscription.set_listener(Arc::new(move |change: &CommandResult| {
            let _ = tx.send(change.value().map(<[u8]>::to_vec));
        }));

        subscription.start();
        assert!(subscription.is_started());
        wait_for("remote subscription", || {
            peripheral.descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG)
                == Some(vec![0x01, 0x00])
        })
        .await;

        peripheral.notify(CHAR, vec![0xAA]);
        let seen = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no notification delivered")
            .expect("listener channel closed");
        assert_eq!(seen, Some(vec![0xAA]));

        subscription.stop();
        assert!(!subscription.is_started());
        wait_for("remote unsubscription", || {
            peripheral.descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG)
                == Some(vec![0x00, 0x00])
        })
        .await;
    }

    #[tokio::test]
    async fn test_stop_leaves_other_listeners_subscribed() {
        let (peripheral, central) = setup();
        let connection = central.connection(addr());
        connection.add_change_listener(CHAR, Arc::new(|_: &CommandResult| {}));

        let subscription = central.subscription(addr(), SERVICE, CHAR);
        subscription.start();
        wait_for("remote subscription", || {
            peripheral.descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG)
                == Some(vec![0x01, 0x00])
        })
        .await;

        subscription.stop();
        sleep(Duration::from_millis(100)).await;
        // the unrelated listener keeps the remote subscription alive
        assert_eq!(
            peripheral.descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG),
            Some(vec![0x01, 0x00])
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (peripheral, central) = setup();
        let subscription = central.subscription(addr(), SERVICE, CHAR);
        subscription.start();
        subscription.start();
        wait_for("remote subscription", || {
            peripheral.descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG)
                == Some(vec![0x01, 0x00])
        })
        .await;
        subscription.stop();
    }
}
