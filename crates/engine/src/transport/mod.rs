//! USB transport abstraction
//!
//! The engine never talks to libusb directly. Everything it needs from the
//! host USB stack goes through the [`Transport`] trait: asynchronous bulk
//! submission, a blocking "handle pending events" call that delivers
//! completions, synchronous control transfers, and cancel/free of outstanding
//! transfers.
//!
//! Buffers move by value. Submitting a [`TransferBuffer`] hands it to the
//! transport, and the transport gives it back inside a [`Completion`]. A buffer
//! can therefore never be owned by the pool and the transport at the same time.

pub mod native;

use crate::error::TransportError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use native::RusbTransport;

/// Vendor request, host to device
pub const CONTROL_OUT: u8 = 0x40;

/// Vendor request, device to host
pub const CONTROL_IN: u8 = 0xC0;

/// Default control endpoint
pub const CONTROL_ENDPOINT: u8 = 0x00;

/// Identity of a transfer buffer within a pool
pub type TransferId = u32;

/// A reusable bulk transfer buffer
pub struct TransferBuffer {
    id: TransferId,
    data: Vec<u8>,
    actual_length: usize,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes
    pub fn new(id: TransferId, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0; capacity],
            actual_length: 0,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written by the last completed transfer
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Record how many bytes the transport wrote (clamped to capacity)
    pub fn set_actual_length(&mut self, len: usize) {
        self.actual_length = len.min(self.data.len());
    }

    /// Whole backing region, for the transport to fill
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes after completion
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.actual_length]
    }

    /// Forget the last transfer's length before reuse
    pub fn clear(&mut self) {
        self.actual_length = 0;
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("id", &self.id)
            .field("capacity", &self.data.len())
            .field("actual_length", &self.actual_length)
            .finish()
    }
}

/// Outcome of a finished bulk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Stall,
    Cancelled,
    TimedOut,
    NoDevice,
    Overflow,
    Error,
}

/// A finished transfer, handed back by the transport
#[derive(Debug)]
pub struct Completion {
    pub buffer: TransferBuffer,
    pub status: TransferStatus,
    /// Endpoint the transfer was submitted to
    pub endpoint: u8,
}

/// Buffer handed back when a submission is refused
#[derive(Debug)]
pub struct SubmitError {
    pub buffer: TransferBuffer,
    pub error: TransportError,
}

/// Control transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Vendor request type byte for this direction
    pub fn request_type(self) -> u8 {
        match self {
            Direction::Out => CONTROL_OUT,
            Direction::In => CONTROL_IN,
        }
    }
}

/// Setup stage of a control transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn new(direction: Direction, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type: direction.request_type(),
            request,
            value,
            index,
            length,
        }
    }

    /// Bit 7 of the request type selects the direction
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
            self.request_type, self.request, self.value, self.index, self.length
        )
    }
}

/// Vendor/product identity and string descriptor indices of the open device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_index: Option<u8>,
    pub product_index: Option<u8>,
    pub serial_number_index: Option<u8>,
}

/// Host USB stack operations the engine depends on
///
/// Implementations own the device handle. All methods take `&self` so the
/// transport can be shared between the event pump and the caller's thread;
/// the engine serializes submissions and control traffic itself.
pub trait Transport: Send + Sync {
    /// Whether a kernel driver is bound to `interface`
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError>;

    /// Detach kernel drivers automatically on claim (and reattach on release)
    fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), TransportError>;

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Submit an asynchronous bulk-IN transfer
    ///
    /// On success the buffer belongs to the transport until it comes back in
    /// a [`Completion`] from [`handle_events`](Transport::handle_events).
    fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
    ) -> Result<(), SubmitError>;

    /// Request cancellation; the buffer comes back as a `Cancelled` completion
    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError>;

    /// Release the transport-side descriptor for a transfer
    fn free_transfer(&self, id: TransferId) -> Result<(), TransportError>;

    /// Block for up to `timeout` and deliver finished transfers to `on_complete`
    ///
    /// Completions are only ever delivered from inside this call.
    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransportError>;

    /// Synchronous control transfer; returns the number of bytes transferred
    fn control_transfer(
        &self,
        setup: &ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;

    fn reset(&self) -> Result<(), TransportError>;

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError>;

    /// Close the device handle; later calls fail with `TransportError::Closed`
    fn close(&self);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        (**self).kernel_driver_active(interface)
    }

    fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), TransportError> {
        (**self).set_auto_detach_kernel_driver(enable)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        (**self).claim_interface(interface)
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        (**self).release_interface(interface)
    }

    fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
    ) -> Result<(), SubmitError> {
        (**self).submit_bulk(endpoint, buffer, timeout)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        (**self).cancel_transfer(id)
    }

    fn free_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        (**self).free_transfer(id)
    }

    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransportError> {
        (**self).handle_events(timeout, on_complete)
    }

    fn control_transfer(
        &self,
        setup: &ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        (**self).control_transfer(setup, data, timeout)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        (**self).clear_halt(endpoint)
    }

    fn reset(&self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        (**self).read_string_descriptor(index)
    }

    fn close(&self) {
        (**self).close()
    }
}
