//! The connection registry: one shared [`Connection`] per device address.
//!
//! [`Central`] is an explicit value owned by the application and passed to
//! whatever needs BLE access; there is deliberately no process-wide
//! singleton. It also carries the factory surface for operations,
//! subscriptions and monitors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::connection::Connection;
use crate::monitor::{ConnectionMonitor, MonitorConfig};
use crate::operation::OperationBuilder;
use crate::platform::BleAdapter;
use crate::subscription::Subscription;
use crate::types::Address;

/// The client-role entry point: owns the adapter handle and the per-address
/// connection map.
pub struct Central {
    adapter: Arc<dyn BleAdapter>,
    connections: Mutex<HashMap<Address, Arc<Connection>>>,
    this: Weak<Central>,
}

impl Central {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            adapter,
            connections: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn adapter(&self) -> Arc<dyn BleAdapter> {
        Arc::clone(&self.adapter)
    }

    /// The shared connection for `address`, created lazily on first use.
    /// Every operation, subscription and monitor targeting the address goes
    /// through this one instance.
    pub fn connection(&self, address: Address) -> Arc<Connection> {
        let mut connections = self.connections.lock().unwrap();
        connections
            .entry(address)
            .or_insert_with(|| Connection::new(address, Arc::clone(&self.adapter)))
            .clone()
    }

    /// Drop the registry entry for `address`, disconnecting it first.
    /// Returns whether an entry existed.
    pub fn evict(&self, address: Address) -> bool {
        let removed = self.connections.lock().unwrap().remove(&address);
        match removed {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Start building an operation against `address`.
    pub fn operation(&self, address: Address) -> OperationBuilder {
        OperationBuilder::new(self.handle(), address)
    }

    /// A persistent notification subscription on one characteristic.
    pub fn subscription(&self, address: Address, service: Uuid, characteristic: Uuid) -> Subscription {
        Subscription::new(self.handle(), address, service, characteristic)
    }

    /// A keep-alive/reconnect monitor for `address`.
    pub fn monitor(&self, address: Address) -> ConnectionMonitor {
        self.monitor_with_config(address, MonitorConfig::default())
    }

    pub fn monitor_with_config(&self, address: Address, config: MonitorConfig) -> ConnectionMonitor {
        ConnectionMonitor::new(self.handle(), address, config)
    }

    fn handle(&self) -> Arc<Central> {
        self.this.upgrade().expect("registry is always reference counted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    fn addr(last: u8) -> Address {
        Address::new([1, 2, 3, 4, 5, last])
    }

    #[tokio::test]
    async fn test_connection_is_shared_per_address() {
        let central = Central::new(MockAdapter::new());
        let a = central.connection(addr(1));
        let b = central.connection(addr(1));
        let c = central.connection(addr(2));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_evict_forgets_the_connection() {
        let central = Central::new(MockAdapter::new());
        let a = central.connection(addr(1));
        assert!(central.evict(addr(1)));
        assert!(!central.evict(addr(1)));
        let b = central.connection(addr(1));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
