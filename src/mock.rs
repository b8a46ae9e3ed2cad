//! A scriptable in-memory platform, for tests and examples.
//!
//! [`MockAdapter`] implements [`BleAdapter`] over a set of
//! [`MockPeripheral`]s. A peripheral carries a service database, records
//! every request it sees, and can be scripted to fail connects, discovery,
//! reads and writes, to delay its responses, to push notifications, and to
//! drop the link, which is enough to exercise every failure path of the
//! orchestration layer without a radio.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use uuid::Uuid;

use crate::platform::{
    AdapterEvent, BleAdapter, GattEvent, GattLink, WriteType, CLIENT_CHARACTERISTIC_CONFIG,
    DISABLE_NOTIFICATION_VALUE,
};
use crate::types::{Address, GattError, GattStatus, Result, Transport};

/// Every request a peripheral has seen, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    Connect,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    DescriptorRead(Uuid, Uuid),
    DescriptorWrite(Uuid, Uuid, Vec<u8>),
    SetNotification(Uuid, bool),
    ReadRssi,
}

#[derive(Default)]
struct MockCharacteristic {
    value: Vec<u8>,
    descriptors: HashMap<Uuid, Vec<u8>>,
    read_failures: VecDeque<GattStatus>,
    write_failures: VecDeque<GattStatus>,
    written: Vec<Vec<u8>>,
    notifying: bool,
}

struct PeripheralState {
    services: HashMap<Uuid, HashMap<Uuid, MockCharacteristic>>,
    connect_failures: VecDeque<GattStatus>,
    discovery_failures: VecDeque<GattStatus>,
    requests: Vec<MockRequest>,
    links: Vec<mpsc::UnboundedSender<GattEvent>>,
    response_delay: Duration,
}

impl PeripheralState {
    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&MockCharacteristic> {
        self.services.get(&service)?.get(&characteristic)
    }

    fn characteristic_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<&mut MockCharacteristic> {
        self.services.get_mut(&service)?.get_mut(&characteristic)
    }
}

/// One fake remote device.
pub struct MockPeripheral {
    address: Address,
    state: Mutex<PeripheralState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockPeripheral {
    fn new(address: Address) -> Arc<Self> {
        Arc::new(Self {
            address,
            state: Mutex::new(PeripheralState {
                services: HashMap::new(),
                connect_failures: VecDeque::new(),
                discovery_failures: VecDeque::new(),
                requests: Vec::new(),
                links: Vec::new(),
                response_delay: Duration::ZERO,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Add a characteristic with an initial value. A CCCD descriptor in the
    /// disabled state is created along with it.
    pub fn add_characteristic(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        let mut descriptors = HashMap::new();
        descriptors.insert(
            CLIENT_CHARACTERISTIC_CONFIG,
            DISABLE_NOTIFICATION_VALUE.to_vec(),
        );
        state.services.entry(service).or_default().insert(
            characteristic,
            MockCharacteristic {
                value,
                descriptors,
                ..Default::default()
            },
        );
    }

    pub fn set_value(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.characteristic_mut(service, characteristic) {
            c.value = value;
        }
    }

    pub fn set_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.characteristic_mut(service, characteristic) {
            c.descriptors.insert(descriptor, value);
        }
    }

    pub fn descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .characteristic(service, characteristic)?
            .descriptors
            .get(&descriptor)
            .cloned()
    }

    /// Script the next connection attempt to fail with `status`.
    pub fn fail_next_connect(&self, status: GattStatus) {
        self.state.lock().unwrap().connect_failures.push_back(status);
    }

    /// Script the next service discovery to fail with `status`.
    pub fn fail_next_discovery(&self, status: GattStatus) {
        self.state
            .lock()
            .unwrap()
            .discovery_failures
            .push_back(status);
    }

    /// Script the next read of `characteristic` to fail with `status`.
    pub fn fail_next_read(&self, characteristic: Uuid, status: GattStatus) {
        let mut state = self.state.lock().unwrap();
        for service in state.services.values_mut() {
            if let Some(c) = service.get_mut(&characteristic) {
                c.read_failures.push_back(status);
                return;
            }
        }
    }

    /// Script the next write to `characteristic` to fail with `status`.
    pub fn fail_next_write(&self, characteristic: Uuid, status: GattStatus) {
        let mut state = self.state.lock().unwrap();
        for service in state.services.values_mut() {
            if let Some(c) = service.get_mut(&characteristic) {
                c.write_failures.push_back(status);
                return;
            }
        }
    }

    /// Delay every read/write/descriptor response by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().unwrap().response_delay = delay;
    }

    /// Whether the local notification flag is set for `characteristic`.
    pub fn notifying(&self, service: Uuid, characteristic: Uuid) -> bool {
        let state = self.state.lock().unwrap();
        state
            .characteristic(service, characteristic)
            .map(|c| c.notifying)
            .unwrap_or(false)
    }

    /// Chunks successfully written to `characteristic`, in order.
    pub fn written(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        for service in state.services.values() {
            if let Some(c) = service.get(&characteristic) {
                return c.written.clone();
            }
        }
        Vec::new()
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// The largest number of requests that were ever awaiting a response at
    /// the same time. The orchestration layer keeps this at one.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Push a notification to every open link.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let links = self.state.lock().unwrap().links.clone();
        for link in links {
            let _ = link.send(GattEvent::CharacteristicChanged {
                characteristic,
                value: value.clone(),
            });
        }
    }

    /// Simulate the remote side dropping every open link.
    pub fn drop_link(&self, status: GattStatus) {
        let links = std::mem::take(&mut self.state.lock().unwrap().links);
        for link in links {
            let _ = link.send(GattEvent::ConnectionStateChanged {
                status,
                connected: false,
            });
        }
    }

    fn open_link(self: Arc<Self>, events: mpsc::UnboundedSender<GattEvent>) -> Arc<dyn GattLink> {
        let status = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(MockRequest::Connect);
            let status = state
                .connect_failures
                .pop_front()
                .unwrap_or(GattStatus::SUCCESS);
            if status.is_success() {
                state.links.push(events.clone());
            }
            status
        };
        let _ = events.send(GattEvent::ConnectionStateChanged {
            status,
            connected: status.is_success(),
        });
        Arc::new(MockLink {
            peripheral: self,
            events,
        })
    }
}

/// Send `event` after the scripted delay, tracking how many responses are
/// outstanding at once.
fn respond(
    peripheral: &Arc<MockPeripheral>,
    delay: Duration,
    events: &mpsc::UnboundedSender<GattEvent>,
    event: GattEvent,
) {
    let pending = peripheral.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    peripheral.max_in_flight.fetch_max(pending, Ordering::SeqCst);
    let peripheral = Arc::clone(peripheral);
    let events = events.clone();
    tokio::spawn(async move {
        if delay > Duration::ZERO {
            sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        peripheral.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = events.send(event);
    });
}

/// The fake link handed out by [`MockAdapter::open_link`].
pub struct MockLink {
    peripheral: Arc<MockPeripheral>,
    events: mpsc::UnboundedSender<GattEvent>,
}

impl GattLink for MockLink {
    fn discover_services(&self) -> Result<()> {
        let status = {
            let mut state = self.peripheral.state.lock().unwrap();
            state.requests.push(MockRequest::DiscoverServices);
            state
                .discovery_failures
                .pop_front()
                .unwrap_or(GattStatus::SUCCESS)
        };
        let _ = self.events.send(GattEvent::ServicesDiscovered { status });
        Ok(())
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.peripheral
            .state
            .lock()
            .unwrap()
            .services
            .contains_key(&service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.peripheral
            .state
            .lock()
            .unwrap()
            .characteristic(service, characteristic)
            .is_some()
    }

    fn has_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> bool {
        self.peripheral
            .state
            .lock()
            .unwrap()
            .characteristic(service, characteristic)
            .map(|c| c.descriptors.contains_key(&descriptor))
            .unwrap_or(false)
    }

    fn descriptor_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Option<Vec<u8>> {
        self.peripheral
            .state
            .lock()
            .unwrap()
            .characteristic(service, characteristic)?
            .descriptors
            .get(&descriptor)
            .cloned()
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let (delay, event) = {
            let mut state = self.peripheral.state.lock().unwrap();
            state.requests.push(MockRequest::Read(characteristic));
            let delay = state.response_delay;
            let c = state
                .characteristic_mut(service, characteristic)
                .ok_or(GattError::Status(GattStatus::FAILURE))?;
            let status = c.read_failures.pop_front().unwrap_or(GattStatus::SUCCESS);
            let value = status.is_success().then(|| c.value.clone());
            (
                delay,
                GattEvent::CharacteristicRead {
                    characteristic,
                    value,
                    status,
                },
            )
        };
        respond(&self.peripheral, delay, &self.events, event);
        Ok(())
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<()> {
        let (delay, event) = {
            let mut state = self.peripheral.state.lock().unwrap();
            state
                .requests
                .push(MockRequest::Write(characteristic, value.to_vec()));
            let delay = state.response_delay;
            let c = state
                .characteristic_mut(service, characteristic)
                .ok_or(GattError::Status(GattStatus::FAILURE))?;
            let status = c.write_failures.pop_front().unwrap_or(GattStatus::SUCCESS);
            if status.is_success() {
                c.written.push(value.to_vec());
                c.value = value.to_vec();
            }
            (
                delay,
                GattEvent::CharacteristicWrite {
                    characteristic,
                    status,
                },
            )
        };
        respond(&self.peripheral, delay, &self.events, event);
        Ok(())
    }

    fn read_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Result<()> {
        let (delay, event) = {
            let mut state = self.peripheral.state.lock().unwrap();
            state
                .requests
                .push(MockRequest::DescriptorRead(characteristic, descriptor));
            let delay = state.response_delay;
            let value = state
                .characteristic(service, characteristic)
                .and_then(|c| c.descriptors.get(&descriptor).cloned());
            let status = if value.is_some() {
                GattStatus::SUCCESS
            } else {
                GattStatus::FAILURE
            };
            (
                delay,
                GattEvent::DescriptorRead {
                    characteristic,
                    descriptor,
                    value,
                    status,
                },
            )
        };
        respond(&self.peripheral, delay, &self.events, event);
        Ok(())
    }

    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let (delay, event) = {
            let mut state = self.peripheral.state.lock().unwrap();
            state.requests.push(MockRequest::DescriptorWrite(
                characteristic,
                descriptor,
                value.to_vec(),
            ));
            let delay = state.response_delay;
            let c = state
                .characteristic_mut(service, characteristic)
                .ok_or(GattError::Status(GattStatus::FAILURE))?;
            c.descriptors.insert(descriptor, value.to_vec());
            (
                delay,
                GattEvent::DescriptorWrite {
                    characteristic,
                    descriptor,
                    status: GattStatus::SUCCESS,
                },
            )
        };
        respond(&self.peripheral, delay, &self.events, event);
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        let mut state = self.peripheral.state.lock().unwrap();
        state
            .requests
            .push(MockRequest::SetNotification(characteristic, enable));
        let c = state
            .characteristic_mut(service, characteristic)
            .ok_or(GattError::Status(GattStatus::FAILURE))?;
        c.notifying = enable;
        Ok(())
    }

    fn read_rssi(&self) -> Result<()> {
        let delay = {
            let mut state = self.peripheral.state.lock().unwrap();
            state.requests.push(MockRequest::ReadRssi);
            state.response_delay
        };
        respond(
            &self.peripheral,
            delay,
            &self.events,
            GattEvent::RssiRead {
                rssi: -60,
                status: GattStatus::SUCCESS,
            },
        );
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.peripheral.state.lock().unwrap();
        state.links.retain(|l| !l.same_channel(&self.events));
    }
}

/// A fake adapter over a set of peripherals.
pub struct MockAdapter {
    enabled: AtomicBool,
    peripherals: Mutex<HashMap<Address, Arc<MockPeripheral>>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            peripherals: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// The peripheral at `address`, created empty on first use.
    pub fn peripheral(&self, address: Address) -> Arc<MockPeripheral> {
        let mut peripherals = self.peripherals.lock().unwrap();
        peripherals
            .entry(address)
            .or_insert_with(|| MockPeripheral::new(address))
            .clone()
    }

    /// Flip the radio; broadcasts the matching [`AdapterEvent`].
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        let event = if enabled {
            AdapterEvent::PoweredOn
        } else {
            AdapterEvent::PoweredOff
        };
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn adapter_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    async fn open_link(
        &self,
        address: Address,
        _transport: Transport,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Arc<dyn GattLink>> {
        if !self.is_enabled() {
            return Err(GattError::AdapterDisabled);
        }
        let peripheral = self
            .peripherals
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or_else(|| GattError::Platform(format!("unknown device {}", address)))?;
        Ok(peripheral.open_link(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const CHAR: Uuid = Uuid::from_u128(0x2000);

    fn addr() -> Address {
        Address::new([1, 1, 1, 1, 1, 1])
    }

    #[tokio::test]
    async fn test_open_link_emits_connected() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![0x2A]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = adapter
            .open_link(addr(), Transport::Auto, tx)
            .await
            .unwrap();
        match rx.recv().await {
            Some(GattEvent::ConnectionStateChanged { status, connected }) => {
                assert!(status.is_success());
                assert!(connected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(link.has_service(SERVICE));
        assert!(link.has_characteristic(SERVICE, CHAR));
        assert!(link.has_descriptor(SERVICE, CHAR, CLIENT_CHARACTERISTIC_CONFIG));
    }

    #[tokio::test]
    async fn test_read_responds_with_value() {
        let adapter = MockAdapter::new();
        let peripheral = adapter.peripheral(addr());
        peripheral.add_characteristic(SERVICE, CHAR, vec![0x2A]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = adapter
            .open_link(addr(), Transport::Auto, tx)
            .await
            .unwrap();
        rx.recv().await; // connected
        link.read_characteristic(SERVICE, CHAR).unwrap();
        match rx.recv().await {
            Some(GattEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            }) => {
                assert_eq!(characteristic, CHAR);
                assert_eq!(value, Some(vec![0x2A]));
                assert!(status.is_success());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            peripheral.requests(),
            vec![MockRequest::Connect, MockRequest::Read(CHAR)]
        );
    }

    #[tokio::test]
    async fn test_disabled_adapter_refuses_links() {
        let adapter = MockAdapter::new();
        adapter.peripheral(addr());
        adapter.set_enabled(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        match adapter.open_link(addr(), Transport::Auto, tx).await {
            Err(GattError::AdapterDisabled) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
