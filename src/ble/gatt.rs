//! GATT handles, characteristic flags and the peripheral identity.

use std::fmt;
use std::ops::BitOr;

use uuid::Uuid;

use crate::ble::advertising::AdvertisingPayload;
use crate::ble::uuids::{STATUS_CHARACTERISTIC_UUID, STATUS_SERVICE_UUID};
use crate::error::Result;

/// Default device name.
pub const DEFAULT_DEVICE_NAME: &str = "PicoW_Bluetooth";

/// Opaque connection identifier assigned by the stack to a central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerHandle(pub u16);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Attribute handle of a registered characteristic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Characteristic capability flags, using the GATT property bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicFlags(u8);

impl CharacteristicFlags {
    /// The characteristic can be read.
    pub const READ: Self = Self(0x02);
    /// The characteristic can be written.
    pub const WRITE: Self = Self(0x08);
    /// The characteristic can notify.
    pub const NOTIFY: Self = Self(0x10);

    /// No capabilities.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw property bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether all bits in `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if readable.
    pub fn is_readable(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Check if writable.
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if notifiable.
    pub fn is_notifiable(&self) -> bool {
        self.contains(Self::NOTIFY)
    }
}

impl BitOr for CharacteristicFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single characteristic in the service table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDefinition {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Capability flags.
    pub flags: CharacteristicFlags,
}

/// The service table handed to the stack for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDefinition {
    /// Service UUID.
    pub uuid: Uuid,
    /// The characteristic exposed by the service.
    pub characteristic: CharacteristicDefinition,
}

/// Immutable identity of this peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralIdentity {
    name: String,
    service: ServiceDefinition,
}

impl PeripheralIdentity {
    /// Create an identity with the default status service and characteristic.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_service(
            name,
            STATUS_SERVICE_UUID,
            STATUS_CHARACTERISTIC_UUID,
            CharacteristicFlags::READ | CharacteristicFlags::WRITE | CharacteristicFlags::NOTIFY,
        )
    }

    /// Create an identity with a custom service layout.
    pub fn with_service(
        name: impl Into<String>,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        flags: CharacteristicFlags,
    ) -> Self {
        Self {
            name: name.into(),
            service: ServiceDefinition {
                uuid: service_uuid,
                characteristic: CharacteristicDefinition {
                    uuid: characteristic_uuid,
                    flags,
                },
            },
        }
    }

    /// The advertised device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service table to register.
    pub fn service(&self) -> &ServiceDefinition {
        &self.service
    }

    /// Check that the identity can be advertised.
    pub fn validate(&self) -> Result<()> {
        AdvertisingPayload::complete_local_name(&self.name).map(|_| ())
    }
}

impl Default for PeripheralIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_NAME)
    }
}
