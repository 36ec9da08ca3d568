//! Engine error types
//!
//! [`TransportError`] mirrors the failure kinds a libusb-style transport can
//! report. [`Error`] is what the consumer-facing surface returns.

use crate::transport::ControlSetup;
use thiserror::Error;

/// Failure reported by the USB transport collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Endpoint stalled")]
    Pipe,

    #[error("Operation timed out")]
    Timeout,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Overflow")]
    Overflow,

    #[error("Input/output error")]
    Io,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("System call interrupted")]
    Interrupted,

    #[error("Device handle is closed")]
    Closed,

    #[error("Transport error: {message}")]
    Other { message: String },
}

/// Engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure outside of a more specific context
    #[error("USB transport error: {0}")]
    Transport(#[from] TransportError),

    /// The interface could not be claimed
    #[error("Failed to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        source: TransportError,
    },

    /// Control transfer kept stalling after clear-halt and retry
    #[error("Control transfer stalled after retry ({setup}): {source}")]
    ControlStalled {
        setup: ControlSetup,
        source: TransportError,
    },

    /// Control transfer refused by the device or the host stack
    #[error("Control transfer refused ({setup}): {source}")]
    ControlRefused {
        setup: ControlSetup,
        source: TransportError,
    },

    /// Payload does not fit in a single control transfer
    #[error("Control payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// A bulk stream is already open on this device
    #[error("A bulk stream is already active")]
    StreamActive,

    /// The event pump thread failed
    #[error("Event pump failed: {0}")]
    Pump(TransportError),

    /// The event pump thread could not be started
    #[error("Failed to spawn event pump: {0}")]
    Spawn(String),

    /// The device has been shut down
    #[error("Device has been shut down")]
    Shutdown,

    /// Invalid stream configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map rusb::Error to TransportError
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::Interrupted => TransportError::Interrupted,
        _ => TransportError::Other {
            message: err.to_string(),
        },
    }
}
