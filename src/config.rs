//! Peripheral configuration.

use std::time::Duration;

use crate::ble::gatt::PeripheralIdentity;
use crate::error::{Error, Result};
use crate::notification::NotificationPayload;

/// Settings for a [`Peripheral`](crate::Peripheral).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralConfig {
    /// Name, service and characteristic to expose.
    pub identity: PeripheralIdentity,
    /// Advertising interval in milliseconds.
    pub advertising_interval_ms: u32,
    /// Period of the indicator/notification loop.
    pub tick_period: Duration,
    /// Timeout on each write or notify call.
    pub send_timeout: Duration,
    /// How often a failed advertising restart is retried.
    pub advertising_retry_period: Duration,
    /// Advertising attempts made per transition before giving up until the next retry.
    pub advertising_attempts: u32,
    /// Bytes pushed to the central each tick.
    pub payload: NotificationPayload,
}

impl PeripheralConfig {
    /// Default advertising interval (100 ms).
    pub const DEFAULT_ADVERTISING_INTERVAL_MS: u32 = 100;
    /// Default loop period (1 second).
    pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);
    /// Default send timeout (500 ms).
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);
    /// Default advertising retry period (1 second).
    pub const DEFAULT_ADVERTISING_RETRY_PERIOD: Duration = Duration::from_secs(1);
    /// Default attempts per transition.
    pub const DEFAULT_ADVERTISING_ATTEMPTS: u32 = 3;

    /// Config with the default identity but a custom name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            identity: PeripheralIdentity::new(name),
            ..Self::default()
        }
    }

    /// Replace the identity.
    pub fn identity(mut self, identity: PeripheralIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set the advertising interval.
    pub fn advertising_interval_ms(mut self, interval_ms: u32) -> Self {
        self.advertising_interval_ms = interval_ms;
        self
    }

    /// Set the loop period.
    pub fn tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Set the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the advertising retry period.
    pub fn advertising_retry_period(mut self, period: Duration) -> Self {
        self.advertising_retry_period = period;
        self
    }

    /// Set the advertising attempts per transition.
    pub fn advertising_attempts(mut self, attempts: u32) -> Self {
        self.advertising_attempts = attempts;
        self
    }

    /// Set the notification payload.
    pub fn payload(mut self, payload: NotificationPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Check the settings before bring-up.
    pub fn validate(&self) -> Result<()> {
        if self.advertising_interval_ms == 0 {
            return Err(invalid("advertising_interval_ms", self.advertising_interval_ms));
        }
        if self.tick_period.is_zero() {
            return Err(invalid("tick_period", format!("{:?}", self.tick_period)));
        }
        if self.send_timeout.is_zero() {
            return Err(invalid("send_timeout", format!("{:?}", self.send_timeout)));
        }
        if self.advertising_retry_period.is_zero() {
            return Err(invalid(
                "advertising_retry_period",
                format!("{:?}", self.advertising_retry_period),
            ));
        }
        if self.advertising_attempts == 0 {
            return Err(invalid("advertising_attempts", self.advertising_attempts));
        }
        if self.identity.name().is_empty() {
            return Err(invalid("name", "\"\""));
        }

        self.identity.validate()
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            identity: PeripheralIdentity::default(),
            advertising_interval_ms: Self::DEFAULT_ADVERTISING_INTERVAL_MS,
            tick_period: Self::DEFAULT_TICK_PERIOD,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
            advertising_retry_period: Self::DEFAULT_ADVERTISING_RETRY_PERIOD,
            advertising_attempts: Self::DEFAULT_ADVERTISING_ATTEMPTS,
            payload: NotificationPayload::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PeripheralConfig::default();
        assert_eq!(config.identity.name(), "PicoW_Bluetooth");
        assert_eq!(config.advertising_interval_ms, 100);
        assert_eq!(config.tick_period, Duration::from_secs(1));
        assert_eq!(config.payload.as_bytes(), b"55");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PeripheralConfig::with_name("Sensor")
            .tick_period(Duration::from_millis(250))
            .advertising_interval_ms(200)
            .payload(NotificationPayload::new(&b"42"[..]));
        assert_eq!(config.identity.name(), "Sensor");
        assert_eq!(config.tick_period, Duration::from_millis(250));
        assert_eq!(config.advertising_interval_ms, 200);
        assert_eq!(config.payload.as_bytes(), b"42");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PeripheralConfig::default()
            .tick_period(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PeripheralConfig::default()
            .advertising_interval_ms(0)
            .validate()
            .is_err());
        assert!(PeripheralConfig::default()
            .advertising_attempts(0)
            .validate()
            .is_err());
        assert!(PeripheralConfig::default()
            .send_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(PeripheralConfig::with_name("").validate().is_err());
        assert!(matches!(
            PeripheralConfig::with_name("x".repeat(40)).validate(),
            Err(Error::PayloadTooLong { .. })
        ));
    }
}
