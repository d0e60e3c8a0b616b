//! Error types for the ble-status-peripheral crate.

use std::time::Duration;

use thiserror::Error;

use crate::ble::connection::ConnectionPhase;

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A call into the BLE stack failed (radio not active, controller busy).
    #[error("BLE stack unavailable during {operation}: {reason}")]
    StackUnavailable {
        /// The stack operation that failed.
        operation: &'static str,
        /// Description reported by the stack.
        reason: String,
    },

    /// A stack event arrived in a phase that does not accept it.
    #[error("Unexpected {event} event while {phase}")]
    UnexpectedEvent {
        /// Short name of the discarded event.
        event: &'static str,
        /// The phase the state machine was in.
        phase: ConnectionPhase,
    },

    /// Writing or notifying the characteristic failed.
    #[error("Notification send failed: {reason}")]
    SendFailure {
        /// Description of why the send failed.
        reason: String,
    },

    /// A stack operation did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// How long we waited.
        after: Duration,
    },

    /// The advertising data does not fit in a legacy advertising PDU.
    #[error("Advertising payload too long: {len} bytes (max {max})")]
    PayloadTooLong {
        /// Encoded length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The indicator line could not be driven.
    #[error("Indicator failure: {reason}")]
    IndicatorFailure {
        /// Description reported by the indicator driver.
        reason: String,
    },

    /// The peripheral has already been started.
    #[error("Peripheral already running")]
    AlreadyRunning,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::StackUnavailable`].
    pub fn stack(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::StackUnavailable {
            operation,
            reason: reason.into(),
        }
    }

    /// Whether the error is worth retrying on the next transition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StackUnavailable { .. } | Self::SendFailure { .. } | Self::Timeout { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
