//! The platform seam: traits the host BLE stack is consumed through.
//!
//! The crate never talks to an OS Bluetooth API directly. An application
//! provides a [`BleAdapter`] implementation (backed by BlueZ, WinRT, a test
//! double, ...) which hands out [`GattLink`] handles. All asynchronous
//! completions and unsolicited notifications flow back as [`GattEvent`]s
//! through the channel given to [`BleAdapter::open_link`].

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::types::{Address, GattStatus, Result, Transport};

/// The Client Characteristic Configuration descriptor, toggled to enable or
/// disable notifications and indications.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// How a characteristic write should be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    /// Write with response (acknowledged by the remote).
    #[default]
    WithResponse,
    /// Write without response.
    NoResponse,
}

/// Adapter radio state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    PoweredOn,
    PoweredOff,
}

/// An asynchronous completion or unsolicited event raised by a device link.
///
/// Status-carrying events answer exactly one earlier request on the same
/// link; `CharacteristicChanged` is unsolicited (a notification or
/// indication from the remote).
#[derive(Debug, Clone)]
pub enum GattEvent {
    ConnectionStateChanged {
        status: GattStatus,
        connected: bool,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        status: GattStatus,
    },
    CharacteristicWrite {
        characteristic: Uuid,
        status: GattStatus,
    },
    DescriptorRead {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Option<Vec<u8>>,
        status: GattStatus,
    },
    DescriptorWrite {
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
}

/// The platform Bluetooth adapter.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is currently powered and usable.
    fn is_enabled(&self) -> bool;

    /// Subscribe to radio power state changes.
    fn adapter_events(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Request a link to the device at `address`.
    ///
    /// Returns as soon as the request could be issued; the connection result
    /// arrives as a [`GattEvent::ConnectionStateChanged`] on `events`, and
    /// every later completion for this link follows on the same channel.
    /// Implementations are responsible for resolving a device whose
    /// transport type is not yet known (e.g. by scanning) before issuing the
    /// direct link request.
    async fn open_link(
        &self,
        address: Address,
        transport: Transport,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<std::sync::Arc<dyn GattLink>>;
}

/// A live (or in-progress) link to one remote device.
///
/// All methods are request starters: an `Ok` return means the request could
/// be issued, not that it succeeded. The outcome arrives as the matching
/// [`GattEvent`]. The structure queries (`has_service` and friends) reflect
/// the service database cached by the last discovery.
pub trait GattLink: Send + Sync {
    /// Start service discovery.
    fn discover_services(&self) -> Result<()>;

    fn has_service(&self, service: Uuid) -> bool;

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    fn has_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> bool;

    /// The locally cached value of a descriptor, if any.
    fn descriptor_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Option<Vec<u8>>;

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    fn read_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Result<()>;

    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Enable or disable local delivery of notifications for a
    /// characteristic. This does not touch the remote CCCD.
    fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()>;

    fn read_rssi(&self) -> Result<()>;

    /// Tear the link down. Safe to call more than once.
    fn disconnect(&self);
}
