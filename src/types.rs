//! Common types, enums, and error definitions shared across the crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gattlink operations
pub type Result<T> = std::result::Result<T, GattError>;

/// Error types surfaced across the library boundary
#[derive(Error, Debug)]
pub enum GattError {
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("no active connection to the device")]
    NotConnected,

    #[error("operation is already running")]
    OperationRunning,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("request failed with status {0}")]
    Status(GattStatus),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A 6-byte Bluetooth device address (MAC).
///
/// Parses from and displays as the usual colon-separated uppercase hex form,
/// e.g. `00:1A:7D:DA:71:13`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for Address {
    type Err = GattError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 || part.len() != 2 {
                return Err(GattError::InvalidAddress(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| GattError::InvalidAddress(s.to_string()))?;
            parts = i + 1;
        }
        if parts != 6 {
            return Err(GattError::InvalidAddress(s.to_string()));
        }
        Ok(Address(bytes))
    }
}

/// Transport used when establishing a link to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transport {
    /// Let the platform pick.
    #[default]
    Auto,
    /// Bluetooth Low Energy.
    LowEnergy,
    /// BR/EDR (classic).
    Classic,
}

/// Connection state of a device link.
///
/// Service discovery completion is tracked separately; see
/// [`crate::connection::Connection::services_discovered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A raw GATT status code as reported by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x0000);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x0002);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x0003);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x0005);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x0006);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x000F);
    /// The catch-all stack-internal error many platforms report on timeouts
    /// and lower-layer failures.
    pub const ERROR: GattStatus = GattStatus(0x0085);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x008F);
    /// Generic failure sentinel used when no more specific code exists.
    pub const FAILURE: GattStatus = GattStatus(0x0101);

    pub fn is_success(&self) -> bool {
        *self == GattStatus::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            GattStatus::SUCCESS => Some("SUCCESS"),
            GattStatus::READ_NOT_PERMITTED => Some("READ_NOT_PERMITTED"),
            GattStatus::WRITE_NOT_PERMITTED => Some("WRITE_NOT_PERMITTED"),
            GattStatus::INSUFFICIENT_AUTHENTICATION => Some("INSUFFICIENT_AUTHENTICATION"),
            GattStatus::REQUEST_NOT_SUPPORTED => Some("REQUEST_NOT_SUPPORTED"),
            GattStatus::INSUFFICIENT_ENCRYPTION => Some("INSUFFICIENT_ENCRYPTION"),
            GattStatus::ERROR => Some("ERROR"),
            GattStatus::CONNECTION_CONGESTED => Some("CONNECTION_CONGESTED"),
            GattStatus::FAILURE => Some("FAILURE"),
            _ => None,
        };
        match name {
            Some(name) => write!(f, "0x{:04X} ({})", self.0, name),
            None => write!(f, "0x{:04X}", self.0),
        }
    }
}
