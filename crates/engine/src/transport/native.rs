//! Native transport backed by rusb
//!
//! Bulk transfers use libusb's asynchronous API through `rusb::ffi`: every
//! pool buffer gets its own `libusb_transfer`, allocated on first submission
//! and reused until [`free_transfer`](Transport::free_transfer). Submitted
//! transfers are all outstanding on the host controller at once.
//!
//! libusb only runs transfer callbacks from inside `handle_events`, which the
//! engine calls from its event pump thread. The callback just records the
//! transfer id; [`handle_events`](Transport::handle_events) then hands the
//! buffer back as a [`Completion`] once libusb has returned.
//!
//! Control transfers, claim/release and descriptor reads use rusb's
//! synchronous API.

use super::{
    Completion, ControlSetup, DeviceIdentity, Direction, SubmitError, TransferBuffer, TransferId,
    TransferStatus, Transport,
};
use crate::error::{TransportError, map_rusb_error};
use rusb::{Context, DeviceHandle, UsbContext, ffi};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

// Values from libusb.h
const TRANSFER_TYPE_BULK: u8 = 2;

const TRANSFER_COMPLETED: c_int = 0;
const TRANSFER_TIMED_OUT: c_int = 2;
const TRANSFER_CANCELLED: c_int = 3;
const TRANSFER_STALL: c_int = 4;
const TRANSFER_NO_DEVICE: c_int = 5;
const TRANSFER_OVERFLOW: c_int = 6;

const ERROR_IO: c_int = -1;
const ERROR_INVALID_PARAM: c_int = -2;
const ERROR_ACCESS: c_int = -3;
const ERROR_NO_DEVICE: c_int = -4;
const ERROR_NOT_FOUND: c_int = -5;
const ERROR_BUSY: c_int = -6;
const ERROR_TIMEOUT: c_int = -7;
const ERROR_OVERFLOW: c_int = -8;
const ERROR_PIPE: c_int = -9;
const ERROR_INTERRUPTED: c_int = -10;

/// How long `close` waits for cancelled transfers to come back
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ids of transfers whose callback has run, in callback order
type Finished = Arc<Mutex<Vec<TransferId>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Target of a transfer's `user_data` pointer
struct CallbackData {
    id: TransferId,
    finished: Finished,
}

extern "system" fn on_transfer_done(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data always points at the owning slot's boxed CallbackData,
    // which is only dropped after the transfer is freed.
    let data = unsafe { &*((*transfer).user_data as *const CallbackData) };
    lock(&data.finished).push(data.id);
}

/// One libusb transfer and the pool buffer it is reading into
struct Slot {
    raw: NonNull<ffi::libusb_transfer>,
    /// Boxed so the address stored in `user_data` stays put
    _callback: Box<CallbackData>,
    /// Present while libusb owns the transfer
    buffer: Option<TransferBuffer>,
    endpoint: u8,
}

// SAFETY: the raw transfer is only touched under the slot map's mutex, or by
// libusb while it is submitted.
unsafe impl Send for Slot {}

impl Slot {
    fn alloc(id: TransferId, finished: &Finished) -> Option<Self> {
        // SAFETY: plain allocation, checked for null below
        let raw = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) })?;
        let callback = Box::new(CallbackData {
            id,
            finished: Arc::clone(finished),
        });
        // SAFETY: raw is a freshly allocated transfer that nothing else references
        unsafe {
            let transfer = raw.as_ptr();
            (*transfer).callback = on_transfer_done;
            (*transfer).user_data = &*callback as *const CallbackData as *mut c_void;
        }
        Some(Self {
            raw,
            _callback: callback,
            buffer: None,
            endpoint: 0,
        })
    }

    fn is_submitted(&self) -> bool {
        self.buffer.is_some()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: slots are only dropped once libusb has handed the transfer back
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) };
    }
}

/// rusb-backed [`Transport`]
pub struct RusbTransport {
    context: Context,
    handle: RwLock<Option<DeviceHandle<Context>>>,
    slots: Mutex<HashMap<TransferId, Slot>>,
    finished: Finished,
}

impl RusbTransport {
    /// Open the first device matching `vendor_id:product_id`
    pub fn open(vendor_id: u16, product_id: u16) -> Result<(Self, DeviceIdentity), TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        let handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or_else(|| {
                warn!(
                    "No device with vendor ID {:#06x} and product ID {:#06x} found",
                    vendor_id, product_id
                );
                TransportError::NotFound
            })?;
        Self::from_handle(handle)
    }

    /// Wrap an already opened device handle
    pub fn from_handle(
        handle: DeviceHandle<Context>,
    ) -> Result<(Self, DeviceIdentity), TransportError> {
        let descriptor = handle
            .device()
            .device_descriptor()
            .map_err(map_rusb_error)?;

        let identity = DeviceIdentity {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer_index: descriptor.manufacturer_string_index(),
            product_index: descriptor.product_string_index(),
            serial_number_index: descriptor.serial_number_string_index(),
        };

        debug!(
            "Opened device {:04x}:{:04x}",
            identity.vendor_id, identity.product_id
        );

        let transport = Self {
            context: handle.context().clone(),
            handle: RwLock::new(Some(handle)),
            slots: Mutex::new(HashMap::new()),
            finished: Arc::new(Mutex::new(Vec::new())),
        };
        Ok((transport, identity))
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<TransferId, Slot>> {
        lock(&self.slots)
    }

    /// Run `f` with shared access to the open handle
    fn with_handle<R>(
        &self,
        f: impl FnOnce(&DeviceHandle<Context>) -> rusb::Result<R>,
    ) -> Result<R, TransportError> {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;
        f(handle).map_err(map_rusb_error)
    }

    /// Run `f` with exclusive access to the open handle
    fn with_handle_mut<R>(
        &self,
        f: impl FnOnce(&mut DeviceHandle<Context>) -> rusb::Result<R>,
    ) -> Result<R, TransportError> {
        let mut guard = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_mut().ok_or(TransportError::Closed)?;
        f(handle).map_err(map_rusb_error)
    }

    /// Turn recorded callbacks into completions
    fn collect_finished(&self) -> Vec<Completion> {
        let finished = std::mem::take(&mut *lock(&self.finished));
        let mut slots = self.slots();
        let mut completions = Vec::with_capacity(finished.len());

        for id in finished {
            let Some(slot) = slots.get_mut(&id) else {
                continue;
            };
            let Some(mut buffer) = slot.buffer.take() else {
                continue;
            };
            // SAFETY: the callback has run, so libusb is done with the transfer
            let (status, actual_length) = unsafe {
                let transfer = slot.raw.as_ptr();
                ((*transfer).status, (*transfer).actual_length)
            };
            let status = transfer_status(status);
            if status == TransferStatus::Completed {
                buffer.set_actual_length(usize::try_from(actual_length).unwrap_or(0));
            }
            trace!("Transfer {} finished with {:?}", id, status);
            completions.push(Completion {
                buffer,
                status,
                endpoint: slot.endpoint,
            });
        }
        completions
    }

    fn submitted_count(&self) -> usize {
        self.slots().values().filter(|s| s.is_submitted()).count()
    }
}

impl Transport for RusbTransport {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        self.with_handle(|h| h.kernel_driver_active(interface))
    }

    fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), TransportError> {
        self.with_handle_mut(|h| h.set_auto_detach_kernel_driver(enable))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.with_handle_mut(|h| h.claim_interface(interface))
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.with_handle_mut(|h| h.release_interface(interface))
    }

    fn submit_bulk(
        &self,
        endpoint: u8,
        mut buffer: TransferBuffer,
        timeout: Duration,
    ) -> Result<(), SubmitError> {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = guard.as_ref() else {
            return Err(SubmitError {
                buffer,
                error: TransportError::Closed,
            });
        };
        let Ok(length) = c_int::try_from(buffer.capacity()) else {
            return Err(SubmitError {
                buffer,
                error: TransportError::InvalidParam,
            });
        };
        let timeout_ms = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);

        let id = buffer.id();
        let mut slots = self.slots();
        let slot = match slots.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match Slot::alloc(id, &self.finished) {
                Some(slot) => entry.insert(slot),
                None => {
                    return Err(SubmitError {
                        buffer,
                        error: TransportError::Other {
                            message: "libusb_alloc_transfer failed".into(),
                        },
                    });
                }
            },
        };
        if slot.is_submitted() {
            return Err(SubmitError {
                buffer,
                error: TransportError::Busy,
            });
        }

        buffer.clear();
        // SAFETY: the transfer is not submitted, and the buffer's heap storage
        // stays in the slot (and so stays alive) until libusb hands it back.
        let rc = unsafe {
            let transfer = slot.raw.as_ptr();
            (*transfer).dev_handle = handle.as_raw();
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = TRANSFER_TYPE_BULK;
            (*transfer).timeout = timeout_ms;
            (*transfer).buffer = buffer.as_mut_slice().as_mut_ptr();
            (*transfer).length = length;
            (*transfer).actual_length = 0;
            ffi::libusb_submit_transfer(transfer)
        };
        if rc != 0 {
            return Err(SubmitError {
                buffer,
                error: map_libusb_code(rc),
            });
        }

        slot.endpoint = endpoint;
        slot.buffer = Some(buffer);
        trace!("Submitted bulk transfer {} on ep {:#04x}", id, endpoint);
        Ok(())
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        let slots = self.slots();
        let slot = slots
            .get(&id)
            .filter(|s| s.is_submitted())
            .ok_or(TransportError::NotFound)?;
        // SAFETY: the transfer is submitted; libusb reports NOT_FOUND if it
        // already finished
        let rc = unsafe { ffi::libusb_cancel_transfer(slot.raw.as_ptr()) };
        match rc {
            0 => Ok(()),
            code => Err(map_libusb_code(code)),
        }
    }

    fn free_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        let mut slots = self.slots();
        match slots.get(&id) {
            Some(slot) if slot.is_submitted() => Err(TransportError::Busy),
            Some(_) => {
                slots.remove(&id);
                trace!("Freed transfer {}", id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransportError> {
        let result = self
            .context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error);

        // Callbacks that ran before an error are still delivered
        for completion in self.collect_finished() {
            on_complete(completion);
        }
        result
    }

    fn control_transfer(
        &self,
        setup: &ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match setup.direction() {
            Direction::In => self.with_handle(|h| {
                h.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                )
            }),
            Direction::Out => self.with_handle(|h| {
                h.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                )
            }),
        }
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        self.with_handle_mut(|h| h.clear_halt(endpoint))
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.with_handle_mut(|h| h.reset())
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        self.with_handle(|h| h.read_string_descriptor_ascii(index))
    }

    fn close(&self) {
        let Some(handle) = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        // The engine drains before closing, this only catches stragglers
        let ids: Vec<TransferId> = self
            .slots()
            .iter()
            .filter(|(_, s)| s.is_submitted())
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Err(e) = self.cancel_transfer(*id) {
                debug!("Could not cancel transfer {} on close: {}", id, e);
            }
        }

        let deadline = Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while self.submitted_count() > 0 && Instant::now() < deadline {
            if let Err(e) = self.context.handle_events(Some(Duration::from_millis(100))) {
                debug!("Error handling USB events while closing: {}", e);
            }
            drop(self.collect_finished());
        }

        let mut leaked = 0;
        for (_, slot) in self.slots().drain() {
            if slot.is_submitted() {
                // libusb still references this transfer and its buffer
                std::mem::forget(slot);
                leaked += 1;
            }
        }

        if leaked > 0 {
            error!(
                "{} transfers did not come back, leaking them with the device handle",
                leaked
            );
            std::mem::forget(handle);
        } else {
            drop(handle);
            debug!("Closed device handle");
        }
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a `libusb_transfer_status` value
fn transfer_status(status: c_int) -> TransferStatus {
    match status {
        TRANSFER_COMPLETED => TransferStatus::Completed,
        TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        TRANSFER_CANCELLED => TransferStatus::Cancelled,
        TRANSFER_STALL => TransferStatus::Stall,
        TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Map a negative `libusb_error` return code
fn map_libusb_code(code: c_int) -> TransportError {
    match code {
        ERROR_IO => TransportError::Io,
        ERROR_INVALID_PARAM => TransportError::InvalidParam,
        ERROR_ACCESS => TransportError::Access,
        ERROR_NO_DEVICE => TransportError::NoDevice,
        ERROR_NOT_FOUND => TransportError::NotFound,
        ERROR_BUSY => TransportError::Busy,
        ERROR_TIMEOUT => TransportError::Timeout,
        ERROR_OVERFLOW => TransportError::Overflow,
        ERROR_PIPE => TransportError::Pipe,
        ERROR_INTERRUPTED => TransportError::Interrupted,
        other => TransportError::Other {
            message: format!("libusb error {}", other),
        },
    }
}
