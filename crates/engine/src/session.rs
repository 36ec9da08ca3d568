//! Shared state of one device session
//!
//! A [`Session`] is shared (behind an `Arc`) by the consumer-facing
//! [`UsbInterface`](crate::UsbInterface), the active
//! [`BulkStream`](crate::BulkStream) and the event pump thread. The transfer
//! pool is the only state mutated from both sides; everything that touches
//! the device handle for submission or control traffic goes through the I/O
//! lock so calls are never issued concurrently on one handle.

use crate::classifier::CompletionClassifier;
use crate::config::StreamConfig;
use crate::error::{Error, Result, TransportError};
use crate::pool::TransferPool;
use crate::pump::{self, EventPump};
use crate::transport::{TransferBuffer, TransferId, Transport};
use common::ChunkSender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a bulk stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened but not yet pulled from
    Idle,
    /// Transfers in flight, pump running
    Streaming,
    /// Closing: cancelling transfers, waiting for the pump
    Draining,
    /// Finished; a fresh `read_bytes` is needed to stream again
    Closed,
}

/// Stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Chunks handed to the pull consumer
    pub chunks: u64,
    /// Bytes handed to the pull consumer
    pub bytes: u64,
    /// Chunks delivered through the push channel
    pub pushed: u64,
    /// Bulk submissions accepted by the transport
    pub submissions: u64,
    /// Transfers that failed with a non-recoverable status
    pub transfer_errors: u64,
    /// Faulted reads suppressed by the stream
    pub faulted_reads: u64,
    /// Endpoint stalls recovered with clear-halt
    pub stalls_recovered: u64,
    /// Completed transfers evicted before they were read
    pub dropped: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) chunks: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) pushed: AtomicU64,
    pub(crate) submissions: AtomicU64,
    pub(crate) transfer_errors: AtomicU64,
    pub(crate) faulted_reads: AtomicU64,
    pub(crate) stalls_recovered: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub(crate) struct Session<T> {
    pub(crate) transport: T,
    pub(crate) config: StreamConfig,
    pub(crate) pool: TransferPool,
    pub(crate) counters: Counters,
    io_lock: Mutex<()>,
    state: Mutex<StreamState>,
    fault: Mutex<Option<TransportError>>,
    chunk_tx: Mutex<Option<ChunkSender>>,
    /// Held for the whole start/stop sequence; owns the pump thread
    pump: Mutex<Option<EventPump>>,
    stream_open: AtomicBool,
    pub(crate) claimed: AtomicBool,
    pub(crate) shut_down: AtomicBool,
}

fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(transport: T, config: StreamConfig) -> Self {
        let pool = TransferPool::new(config.completed_capacity);
        Self {
            transport,
            config,
            pool,
            counters: Counters::default(),
            io_lock: Mutex::new(()),
            state: Mutex::new(StreamState::Closed),
            fault: Mutex::new(None),
            chunk_tx: Mutex::new(None),
            pump: Mutex::new(None),
            stream_open: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Serialize an operation on the device handle
    pub(crate) fn io(&self) -> MutexGuard<'_, ()> {
        lock(&self.io_lock)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Stream state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    /// Reserve the session for a new stream
    pub(crate) fn open_stream(&self) -> Result<()> {
        self.ensure_open()?;
        if self.stream_open.swap(true, Ordering::AcqRel) {
            return Err(Error::StreamActive);
        }
        lock(&self.fault).take();
        self.set_state(StreamState::Idle);
        Ok(())
    }

    pub(crate) fn release_stream(&self) {
        self.stream_open.store(false, Ordering::Release);
    }

    /// Record a fatal pump failure and wake the consumer
    pub(crate) fn record_fault(&self, err: TransportError) {
        *lock(&self.fault) = Some(err);
        self.pool.notify_all();
    }

    pub(crate) fn take_fault(&self) -> Option<TransportError> {
        lock(&self.fault).take()
    }

    pub(crate) fn set_chunk_sender(&self, sender: Option<ChunkSender>) {
        *lock(&self.chunk_tx) = sender;
    }

    /// Offer bytes to the push consumer, if one is attached
    ///
    /// Returns false when there is no consumer or its channel is full or
    /// closed; the caller then keeps the buffer on the pull path.
    pub(crate) fn offer_chunk(&self, data: &[u8]) -> bool {
        let mut chunk_tx = lock(&self.chunk_tx);
        let Some(tx) = chunk_tx.as_ref() else {
            return false;
        };
        match tx.offer(data.to_vec()) {
            Ok(()) => {
                bump(&self.counters.pushed, 1);
                true
            }
            Err(_) => {
                if tx.is_closed() {
                    debug!("Push consumer went away, detaching channel");
                    *chunk_tx = None;
                }
                false
            }
        }
    }

    /// Submit an acquired buffer to the bulk endpoint
    ///
    /// A refused submission puts the buffer back in available. Nothing is
    /// submitted once the stream has left `Streaming`.
    pub(crate) fn submit(&self, buffer: TransferBuffer) -> bool {
        let id = buffer.id();
        let result = {
            let _io = self.io();
            if !self.is_streaming() || self.shut_down.load(Ordering::Acquire) {
                trace!("Stream is stopping, not submitting transfer {}", id);
                self.pool.return_to_available(buffer);
                return false;
            }
            self.transport
                .submit_bulk(self.config.endpoint, buffer, self.config.bulk_timeout())
        };
        match result {
            Ok(()) => {
                bump(&self.counters.submissions, 1);
                trace!("Submitted transfer {} to ep {:#04x}", id, self.config.endpoint);
                true
            }
            Err(refused) => {
                warn!("Error submitting transfer {}: {}", id, refused.error);
                self.pool.return_to_available(refused.buffer);
                false
            }
        }
    }

    /// Submit the next available buffer without waiting
    pub(crate) fn try_submit_available(&self) -> bool {
        match self.pool.try_acquire_available() {
            Some(buffer) => self.submit(buffer),
            None => false,
        }
    }

    /// Submit the next available buffer, waiting up to `timeout` for one
    pub(crate) fn submit_available(&self, timeout: Duration) -> bool {
        match self.pool.acquire_available(timeout) {
            Some(buffer) => self.submit(buffer),
            None => false,
        }
    }

    /// Top up submissions until the configured number is in flight
    pub(crate) fn reprime(&self) -> usize {
        let mut submitted = 0;
        while self.pool.in_flight_len() < self.config.transfer_count {
            if !self.try_submit_available() {
                break;
            }
            submitted += 1;
        }
        submitted
    }

    /// Allocate the pool on first use, then submit up to the target count
    pub(crate) fn prime(&self) -> usize {
        if self.pool.total() == 0 {
            self.pool
                .allocate(self.config.transfer_count, self.config.frame_size);
            debug!(
                "Allocated {} transfers of {} bytes",
                self.config.transfer_count, self.config.frame_size
            );
        }
        self.reprime()
    }

    /// Cancel every in-flight transfer except `except`
    pub(crate) fn cancel_in_flight(&self, except: Option<TransferId>) -> usize {
        let mut cancelled = 0;
        for id in self.pool.in_flight_ids() {
            if Some(id) == except {
                continue;
            }
            let result = {
                let _io = self.io();
                self.transport.cancel_transfer(id)
            };
            match result {
                Ok(()) => cancelled += 1,
                Err(e) => debug!("Could not cancel transfer {}: {}", id, e),
            }
        }
        cancelled
    }

    pub(crate) fn clear_halt(&self, endpoint: u8) -> std::result::Result<(), TransportError> {
        let _io = self.io();
        self.transport.clear_halt(endpoint)
    }

    pub(crate) fn reset(&self) -> std::result::Result<(), TransportError> {
        let _io = self.io();
        self.transport.reset()
    }

    pub(crate) fn stats(&self) -> StreamStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StreamStats {
            chunks: load(&self.counters.chunks),
            bytes: load(&self.counters.bytes),
            pushed: load(&self.counters.pushed),
            submissions: load(&self.counters.submissions),
            transfer_errors: load(&self.counters.transfer_errors),
            faulted_reads: load(&self.counters.faulted_reads),
            stalls_recovered: load(&self.counters.stalls_recovered),
            dropped: self.pool.stats().dropped,
        }
    }
}

impl<T: Transport + 'static> Session<T> {
    /// Prime the pool and start the event pump
    pub(crate) fn start_streaming(self: &Arc<Self>) -> Result<()> {
        let mut pump = lock(&self.pump);
        self.ensure_open()?;
        if self.state() != StreamState::Idle {
            return Ok(());
        }

        self.set_state(StreamState::Streaming);
        let submitted = self.prime();
        info!(
            "Streaming from ep {:#04x} with {} transfers in flight",
            self.config.endpoint, submitted
        );

        match EventPump::spawn(Arc::clone(self)) {
            Ok(started) => {
                *pump = Some(started);
                Ok(())
            }
            Err(e) => {
                drop(pump);
                self.stop_streaming();
                Err(e)
            }
        }
    }

    /// Stop the pump and reclaim every transfer
    ///
    /// Blocks until the pump thread has exited and no transfer is in flight
    /// (or the drain timeout passed). Safe to call repeatedly.
    pub(crate) fn stop_streaming(&self) {
        let mut pump = lock(&self.pump);

        match self.state() {
            StreamState::Idle | StreamState::Streaming | StreamState::Draining => {
                self.set_state(StreamState::Draining)
            }
            StreamState::Closed => {}
        }
        self.pool.notify_all();

        if let Some(running) = pump.take() {
            running.join();
        }

        // Anything submitted after the pump stopped is drained from this thread
        if self.pool.in_flight_len() > 0 {
            pump::drain(self, &CompletionClassifier::new(self));
        }

        let recycled = self.pool.recycle_completed();
        if recycled > 0 {
            debug!("Discarded {} unread completed transfers", recycled);
        }
        self.set_state(StreamState::Closed);
    }
}
