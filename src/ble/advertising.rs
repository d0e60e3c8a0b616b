//! Advertising payload construction and advertising control.
//!
//! The payload is a standard AD structure: a sequence of
//! `[length][type][value...]` records where `length` counts the type byte
//! plus the value.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::ble::gatt::PeripheralIdentity;
use crate::ble::stack::BleStack;
use crate::error::{Error, Result};

/// Maximum size of legacy advertising data.
pub const MAX_LEGACY_ADV_DATA: usize = 31;

/// AD type identifiers used by this peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdType {
    /// Flags.
    Flags = 0x01,
    /// Shortened Local Name.
    ShortenedLocalName = 0x08,
    /// Complete Local Name.
    CompleteLocalName = 0x09,
}

impl AdType {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Flags),
            0x08 => Some(Self::ShortenedLocalName),
            0x09 => Some(Self::CompleteLocalName),
            _ => None,
        }
    }
}

/// One decoded AD record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdRecord<'a> {
    /// Raw AD type byte.
    pub ad_type: u8,
    /// Record value.
    pub value: &'a [u8],
}

/// Encoded advertising data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPayload {
    data: Bytes,
}

impl AdvertisingPayload {
    /// Build a payload carrying only the Complete Local Name record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLong`] if the encoded record exceeds
    /// [`MAX_LEGACY_ADV_DATA`].
    pub fn complete_local_name(name: &str) -> Result<Self> {
        let value = name.as_bytes();
        let len = value.len() + 2;
        if len > MAX_LEGACY_ADV_DATA {
            return Err(Error::PayloadTooLong {
                len,
                max: MAX_LEGACY_ADV_DATA,
            });
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8((value.len() + 1) as u8);
        buf.put_u8(AdType::CompleteLocalName as u8);
        buf.put_slice(value);

        Ok(Self { data: buf.freeze() })
    }

    /// The raw bytes handed to the stack.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over the AD records. Stops at the first malformed record.
    pub fn records(&self) -> AdRecords<'_> {
        AdRecords {
            data: &self.data,
            offset: 0,
        }
    }

    /// The advertised local name, if present and valid UTF-8.
    pub fn local_name(&self) -> Option<&str> {
        self.records()
            .find(|r| {
                r.ad_type == AdType::CompleteLocalName as u8
                    || r.ad_type == AdType::ShortenedLocalName as u8
            })
            .and_then(|r| std::str::from_utf8(r.value).ok())
    }
}

/// Iterator over AD records.
#[derive(Debug, Clone)]
pub struct AdRecords<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AdRecords<'a> {
    type Item = AdRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.data.get(self.offset)? as usize;
        if len == 0 {
            return None;
        }
        let start = self.offset + 1;
        let end = start + len;
        if end > self.data.len() {
            return None;
        }
        self.offset = end;

        Some(AdRecord {
            ad_type: self.data[start],
            value: &self.data[start + 1..end],
        })
    }
}

/// Starts and stops advertising through the stack.
pub struct AdvertisingController {
    stack: Arc<dyn BleStack>,
    advertising: bool,
}

impl AdvertisingController {
    /// Create a controller. Advertising is assumed off.
    pub fn new(stack: Arc<dyn BleStack>) -> Self {
        Self {
            stack,
            advertising: false,
        }
    }

    /// Whether the last successful call left the radio advertising.
    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Start advertising the identity's name. Re-issues if already advertising.
    pub async fn start_advertising(
        &mut self,
        identity: &PeripheralIdentity,
        interval_ms: u32,
    ) -> Result<()> {
        let payload = AdvertisingPayload::complete_local_name(identity.name())?;

        if self.advertising {
            debug!("Already advertising, re-issuing advertise");
        }
        info!(
            "Starting advertising as '{}' every {} ms",
            identity.name(),
            interval_ms
        );

        match self
            .stack
            .advertise(interval_ms, payload.as_bytes(), true)
            .await
        {
            Ok(()) => {
                self.advertising = true;
                Ok(())
            }
            Err(e) => {
                self.advertising = false;
                Err(e)
            }
        }
    }

    /// Stop advertising. No-op when not advertising.
    pub async fn stop_advertising(&mut self) -> Result<()> {
        if !self.advertising {
            debug!("Not advertising, ignoring stop request");
            return Ok(());
        }

        info!("Stopping advertising");
        self.stack.stop_advertising().await?;
        self.advertising = false;

        Ok(())
    }

    /// Forget the advertising flag after the stack stopped on its own.
    ///
    /// Link layers halt connectable advertising when a central connects.
    pub(crate) fn mark_stopped(&mut self) {
        self.advertising = false;
    }
}
