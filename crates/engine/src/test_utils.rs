//! Test utilities for the engine
//!
//! [`FakeTransport`] is an in-memory [`Transport`] that holds submitted
//! buffers until a test completes them. Completions are delivered only from
//! inside `handle_events`, exactly as a real host stack would, so the engine's
//! threading can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use engine::test_utils::FakeTransport;
//!
//! let fake = FakeTransport::new();
//! fake.set_string(1, "Generic");
//! assert_eq!(fake.submission_count(), 0);
//! ```

use crate::error::TransportError;
use crate::transport::{
    Completion, ControlSetup, Direction, SubmitError, TransferBuffer, TransferId, TransferStatus,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeState {
    in_flight: VecDeque<(u8, TransferBuffer)>,
    pending: VecDeque<Completion>,
    submissions: Vec<TransferId>,
    cancels: Vec<TransferId>,
    freed: Vec<TransferId>,
    clear_halts: Vec<u8>,
    clear_halt_error: Option<TransportError>,
    resets: usize,
    control_log: Vec<ControlSetup>,
    control_script: VecDeque<Result<usize, TransportError>>,
    event_error: Option<TransportError>,
    kernel_driver_active: bool,
    auto_detach: bool,
    claim_error: Option<TransportError>,
    claimed: Vec<u8>,
    released: Vec<u8>,
    strings: HashMap<u8, String>,
    closed: bool,
    close_calls: usize,
    delivered_after_close: usize,
}

/// Scriptable in-memory transport
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
    changed: Condvar,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the oldest in-flight transfer with `len` bytes of data
    pub fn complete_next(&self, len: usize) -> Option<TransferId> {
        let mut state = self.state();
        let (endpoint, mut buffer) = state.in_flight.pop_front()?;
        let len = len.min(buffer.capacity());
        let id = buffer.id();
        for (i, byte) in buffer.as_mut_slice()[..len].iter_mut().enumerate() {
            *byte = (i as u8).wrapping_add(id as u8);
        }
        buffer.set_actual_length(len);
        state.pending.push_back(Completion {
            buffer,
            status: TransferStatus::Completed,
            endpoint,
        });
        self.changed.notify_all();
        Some(id)
    }

    /// Finish the oldest in-flight transfer with `status` and no data
    pub fn complete_next_with_status(&self, status: TransferStatus) -> Option<TransferId> {
        let mut state = self.state();
        let (endpoint, buffer) = state.in_flight.pop_front()?;
        let id = buffer.id();
        state.pending.push_back(Completion {
            buffer,
            status,
            endpoint,
        });
        self.changed.notify_all();
        Some(id)
    }

    /// Complete every in-flight transfer with full buffers
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next(usize::MAX).is_some() {
            completed += 1;
        }
        completed
    }

    /// Make the next `handle_events` call fail with `err`
    pub fn fail_events(&self, err: TransportError) {
        self.state().event_error = Some(err);
        self.changed.notify_all();
    }

    /// Make every later `clear_halt` fail with `err`
    pub fn fail_clear_halt(&self, err: TransportError) {
        self.state().clear_halt_error = Some(err);
    }

    /// Results for the next control transfers, in order
    ///
    /// Unscripted calls succeed with the full payload length.
    pub fn script_control(&self, results: impl IntoIterator<Item = Result<usize, TransportError>>) {
        self.state().control_script.extend(results);
    }

    pub fn set_kernel_driver_active(&self, active: bool) {
        self.state().kernel_driver_active = active;
    }

    pub fn fail_claim(&self, err: TransportError) {
        self.state().claim_error = Some(err);
    }

    pub fn set_string(&self, index: u8, value: &str) {
        self.state().strings.insert(index, value.to_string());
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Transfer ids in submission order
    pub fn submissions(&self) -> Vec<TransferId> {
        self.state().submissions.clone()
    }

    pub fn cancels(&self) -> Vec<TransferId> {
        self.state().cancels.clone()
    }

    pub fn freed(&self) -> Vec<TransferId> {
        self.state().freed.clone()
    }

    pub fn clear_halts(&self) -> Vec<u8> {
        self.state().clear_halts.clone()
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn control_log(&self) -> Vec<ControlSetup> {
        self.state().control_log.clone()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn in_flight_ids(&self) -> Vec<TransferId> {
        self.state().in_flight.iter().map(|(_, b)| b.id()).collect()
    }

    pub fn auto_detach(&self) -> bool {
        self.state().auto_detach
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.state().released.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Completions delivered by `handle_events` after `close`
    pub fn delivered_after_close(&self) -> usize {
        self.state().delivered_after_close
    }
}

impl Transport for FakeTransport {
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool, TransportError> {
        Ok(self.state().kernel_driver_active)
    }

    fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), TransportError> {
        self.state().auto_detach = enable;
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(err) = state.claim_error.clone() {
            return Err(err);
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        self.state().released.push(interface);
        Ok(())
    }

    fn submit_bulk(
        &self,
        endpoint: u8,
        mut buffer: TransferBuffer,
        _timeout: Duration,
    ) -> Result<(), SubmitError> {
        let mut state = self.state();
        if state.closed {
            return Err(SubmitError {
                buffer,
                error: TransportError::Closed,
            });
        }
        buffer.clear();
        state.submissions.push(buffer.id());
        state.in_flight.push_back((endpoint, buffer));
        Ok(())
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.cancels.push(id);
        let position = state
            .in_flight
            .iter()
            .position(|(_, b)| b.id() == id)
            .ok_or(TransportError::NotFound)?;
        if let Some((endpoint, buffer)) = state.in_flight.remove(position) {
            state.pending.push_back(Completion {
                buffer,
                status: TransferStatus::Cancelled,
                endpoint,
            });
        }
        self.changed.notify_all();
        Ok(())
    }

    fn free_transfer(&self, id: TransferId) -> Result<(), TransportError> {
        self.state().freed.push(id);
        Ok(())
    }

    fn handle_events(
        &self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion),
    ) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let delivered = {
            let mut state = self.state();
            loop {
                if state.closed {
                    return Err(TransportError::Closed);
                }
                if let Some(err) = state.event_error.take() {
                    return Err(err);
                }
                if !state.pending.is_empty() {
                    break std::mem::take(&mut state.pending);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                state = self
                    .changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        // Callbacks may re-enter the transport, so deliver outside the lock
        for completion in delivered {
            if self.state().closed {
                self.state().delivered_after_close += 1;
            }
            on_complete(completion);
        }
        Ok(())
    }

    fn control_transfer(
        &self,
        setup: &ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.control_log.push(*setup);
        let len = match state.control_script.pop_front() {
            Some(result) => result?.min(data.len()),
            None => data.len(),
        };
        if setup.direction() == Direction::In {
            for (i, byte) in data[..len].iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        Ok(len)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        let mut state = self.state();
        state.clear_halts.push(endpoint);
        match state.clear_halt_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.state().resets += 1;
        Ok(())
    }

    fn read_string_descriptor(&self, index: u8) -> Result<String, TransportError> {
        self.state()
            .strings
            .get(&index)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.close_calls += 1;
        self.changed.notify_all();
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
