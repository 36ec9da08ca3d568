//! Transfer buffer pool
//!
//! Every buffer belongs to exactly one of four sets:
//!
//! ```text
//!        acquire_available            handle_events
//!  ┌───────────┐ ─────────► ┌───────────┐ ─────────► ┌───────────┐
//!  │ available │            │ in flight │            │ completed │
//!  └───────────┘ ◄───────── └───────────┘            └───────────┘
//!        ▲      stall/cancel                               │ take_completed
//!        │                  ┌───────────┐                  │
//!        └──── release ──── │   held    │ ◄────────────────┘
//!                           └───────────┘
//! ```
//!
//! In-flight buffers are owned by the transport and held buffers by the
//! consumer, so the pool only tracks their ids. The completed set is bounded:
//! when it is full the oldest entry is evicted (its data is lost) and its
//! buffer goes back to available.
//!
//! After [`drain`](TransferPool::drain) the pool no longer knows any id, and a
//! buffer handed back for an id it does not know is dropped instead of being
//! re-entered.

use crate::transport::{TransferBuffer, TransferId, TransferStatus};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How a completed transfer should be read by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Valid sample data
    Data,
    /// The transfer failed; the buffer carries no usable data
    Fault(TransferStatus),
}

/// A buffer waiting in the completed set
#[derive(Debug)]
pub struct CompletedTransfer {
    pub buffer: TransferBuffer,
    pub outcome: Outcome,
}

/// Point-in-time copy of the pool's sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub available: Vec<TransferId>,
    pub in_flight: Vec<TransferId>,
    pub completed: Vec<TransferId>,
    pub held: Vec<TransferId>,
    pub total: usize,
}

impl PoolSnapshot {
    /// Check that the sets partition the pool
    pub fn check_invariant(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for id in self
            .available
            .iter()
            .chain(&self.in_flight)
            .chain(&self.completed)
            .chain(&self.held)
        {
            if !seen.insert(*id) {
                return Err(format!("Transfer {} is present in more than one set", id));
            }
        }
        if seen.len() != self.total {
            return Err(format!(
                "Pool accounts for {} transfers, expected {}",
                seen.len(),
                self.total
            ));
        }
        Ok(())
    }
}

/// Buffers reclaimed from the pool during shutdown
#[derive(Debug, Default)]
pub struct Drained {
    /// Buffers that were available or completed
    pub buffers: Vec<TransferBuffer>,
    /// In-flight ids whose buffers never came back from the transport
    pub orphaned: Vec<TransferId>,
    /// Ids whose buffers the consumer was still reading
    pub held: Vec<TransferId>,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Transfers that entered the completed set
    pub completed: u64,
    /// Completed transfers evicted before the consumer read them
    pub dropped: u64,
}

#[derive(Default)]
struct PoolSets {
    available: VecDeque<TransferBuffer>,
    in_flight: BTreeSet<TransferId>,
    completed: VecDeque<CompletedTransfer>,
    held: BTreeSet<TransferId>,
    /// Bumped by `notify_all` so waiters return early
    wakeups: u64,
    next_id: TransferId,
    total: usize,
    stats: PoolStats,
}

/// Fixed pool of transfer buffers shared by the event pump and the consumer
pub struct TransferPool {
    sets: Mutex<PoolSets>,
    available_ready: Condvar,
    completed_ready: Condvar,
    completed_capacity: usize,
}

impl TransferPool {
    pub fn new(completed_capacity: usize) -> Self {
        Self {
            sets: Mutex::new(PoolSets::default()),
            available_ready: Condvar::new(),
            completed_ready: Condvar::new(),
            completed_capacity: completed_capacity.max(1),
        }
    }

    fn sets(&self) -> MutexGuard<'_, PoolSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `count` fresh buffers of `frame_size` bytes into available
    pub fn allocate(&self, count: usize, frame_size: usize) -> Vec<TransferId> {
        let mut sets = self.sets();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = sets.next_id;
            sets.next_id = sets.next_id.wrapping_add(1);
            sets.available.push_back(TransferBuffer::new(id, frame_size));
            ids.push(id);
        }
        sets.total += count;
        self.available_ready.notify_all();
        ids
    }

    /// Take an available buffer for submission, waiting up to `timeout`
    ///
    /// The returned buffer is counted as in flight. `None` means nothing is
    /// available right now, which is normal backpressure.
    pub fn acquire_available(&self, timeout: Duration) -> Option<TransferBuffer> {
        let sets = self.sets();
        let wakeups = sets.wakeups;
        let mut sets = self
            .available_ready
            .wait_timeout_while(sets, timeout, |s| {
                s.available.is_empty() && s.wakeups == wakeups
            })
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0);
        Self::take_available(&mut sets)
    }

    /// Take an available buffer for submission without waiting
    pub fn try_acquire_available(&self) -> Option<TransferBuffer> {
        Self::take_available(&mut self.sets())
    }

    fn take_available(sets: &mut PoolSets) -> Option<TransferBuffer> {
        let buffer = sets.available.pop_front()?;
        sets.in_flight.insert(buffer.id());
        Some(buffer)
    }

    /// Return a buffer the consumer has finished reading to available
    ///
    /// Returns `false` when the pool was drained while the consumer held it;
    /// the buffer is dropped in that case.
    pub fn release(&self, mut buffer: TransferBuffer) -> bool {
        buffer.clear();
        let mut sets = self.sets();
        if !sets.held.remove(&buffer.id()) {
            debug!("Transfer {} released after drain, dropping it", buffer.id());
            return false;
        }
        sets.available.push_back(buffer);
        self.available_ready.notify_one();
        true
    }

    /// Move an in-flight buffer back to available (refused, stalled or cancelled)
    pub fn return_to_available(&self, mut buffer: TransferBuffer) -> bool {
        buffer.clear();
        let mut sets = self.sets();
        if !sets.in_flight.remove(&buffer.id()) {
            debug!("Transfer {} returned after drain, dropping it", buffer.id());
            return false;
        }
        sets.available.push_back(buffer);
        self.available_ready.notify_one();
        true
    }

    /// Move an in-flight buffer into the completed set
    ///
    /// Evicts the oldest completed entry first when the set is full. Returns
    /// the id of the evicted transfer, if any.
    pub fn mark_completed(&self, buffer: TransferBuffer, outcome: Outcome) -> Option<TransferId> {
        let mut sets = self.sets();
        if !sets.in_flight.remove(&buffer.id()) {
            debug!("Transfer {} completed after drain, dropping it", buffer.id());
            return None;
        }

        let mut evicted = None;
        if sets.completed.len() >= self.completed_capacity {
            if let Some(mut oldest) = sets.completed.pop_front() {
                sets.stats.dropped += 1;
                evicted = Some(oldest.buffer.id());
                warn!(
                    "Completed set full, dropped oldest transfer {} (total dropped: {})",
                    oldest.buffer.id(),
                    sets.stats.dropped
                );
                oldest.buffer.clear();
                sets.available.push_back(oldest.buffer);
                self.available_ready.notify_one();
            }
        }

        trace!(
            "Transfer {} completed ({:?}, {} bytes), {} waiting",
            buffer.id(),
            outcome,
            buffer.actual_length(),
            sets.completed.len() + 1
        );
        sets.completed.push_back(CompletedTransfer { buffer, outcome });
        sets.stats.completed += 1;
        self.completed_ready.notify_one();
        evicted
    }

    /// Take the oldest completed transfer, waiting up to `timeout`
    pub fn take_completed(&self, timeout: Duration) -> Option<CompletedTransfer> {
        let sets = self.sets();
        let wakeups = sets.wakeups;
        let mut sets = self
            .completed_ready
            .wait_timeout_while(sets, timeout, |s| {
                s.completed.is_empty() && s.wakeups == wakeups
            })
            .map(|(guard, _)| guard)
            .unwrap_or_else(|e| e.into_inner().0);
        Self::take_oldest(&mut sets)
    }

    pub fn try_take_completed(&self) -> Option<CompletedTransfer> {
        Self::take_oldest(&mut self.sets())
    }

    /// The taken buffer stays held until the consumer releases it
    fn take_oldest(sets: &mut PoolSets) -> Option<CompletedTransfer> {
        let entry = sets.completed.pop_front()?;
        sets.held.insert(entry.buffer.id());
        Some(entry)
    }

    /// Wake every waiter so it can re-check stream state
    ///
    /// A woken waiter returns `None` if its set is still empty.
    pub fn notify_all(&self) {
        let mut sets = self.sets();
        sets.wakeups = sets.wakeups.wrapping_add(1);
        self.available_ready.notify_all();
        self.completed_ready.notify_all();
    }

    /// Discard unread completed data and make those buffers available again
    pub fn recycle_completed(&self) -> usize {
        let mut sets = self.sets();
        let mut recycled = 0;
        while let Some(mut entry) = sets.completed.pop_front() {
            entry.buffer.clear();
            sets.available.push_back(entry.buffer);
            recycled += 1;
        }
        if recycled > 0 {
            self.available_ready.notify_all();
        }
        recycled
    }

    /// Empty every set, handing back the buffers that are still owned here
    pub fn drain(&self) -> Drained {
        let mut sets = self.sets();
        let mut buffers: Vec<TransferBuffer> = sets.available.drain(..).collect();
        buffers.extend(sets.completed.drain(..).map(|entry| entry.buffer));
        let orphaned: Vec<TransferId> = std::mem::take(&mut sets.in_flight).into_iter().collect();
        let held: Vec<TransferId> = std::mem::take(&mut sets.held).into_iter().collect();
        sets.total = 0;
        Drained {
            buffers,
            orphaned,
            held,
        }
    }

    pub fn in_flight_ids(&self) -> Vec<TransferId> {
        self.sets().in_flight.iter().copied().collect()
    }

    pub fn available_len(&self) -> usize {
        self.sets().available.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.sets().in_flight.len()
    }

    pub fn completed_len(&self) -> usize {
        self.sets().completed.len()
    }

    pub fn total(&self) -> usize {
        self.sets().total
    }

    pub fn completed_capacity(&self) -> usize {
        self.completed_capacity
    }

    pub fn stats(&self) -> PoolStats {
        self.sets().stats
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let sets = self.sets();
        PoolSnapshot {
            available: sets.available.iter().map(|b| b.id()).collect(),
            in_flight: sets.in_flight.iter().copied().collect(),
            completed: sets.completed.iter().map(|c| c.buffer.id()).collect(),
            held: sets.held.iter().copied().collect(),
            total: sets.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(mut buffer: TransferBuffer, len: usize) -> TransferBuffer {
        buffer.set_actual_length(len);
        buffer
    }

    #[test]
    fn test_acquire_moves_to_in_flight() {
        let pool = TransferPool::new(32);
        pool.allocate(3, 64);

        let buffer = pool.try_acquire_available().unwrap();
        assert_eq!(buffer.id(), 0);
        assert_eq!(pool.available_len(), 2);
        assert_eq!(pool.in_flight_ids(), vec![0]);

        pool.mark_completed(filled(buffer, 10), Outcome::Data);
        assert_eq!(pool.in_flight_len(), 0);
        assert_eq!(pool.completed_len(), 1);

        let completed = pool.try_take_completed().unwrap();
        assert_eq!(completed.buffer.filled().len(), 10);
        assert_eq!(pool.snapshot().held, vec![0]);
        assert!(pool.snapshot().check_invariant().is_ok());
        assert!(pool.release(completed.buffer));
        assert_eq!(pool.available_len(), 3);
        assert!(pool.snapshot().check_invariant().is_ok());
    }

    #[test]
    fn test_acquire_times_out_when_drained() {
        let pool = TransferPool::new(32);
        pool.allocate(1, 64);
        let _held = pool.try_acquire_available().unwrap();

        let started = std::time::Instant::now();
        assert!(pool.acquire_available(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_acquire_wakes_on_release() {
        let pool = std::sync::Arc::new(TransferPool::new(32));
        pool.allocate(1, 64);
        let held = pool.try_acquire_available().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_available(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.return_to_available(held);

        let acquired = waiter.join().unwrap();
        assert_eq!(acquired.map(|b| b.id()), Some(0));
    }

    #[test]
    fn test_notify_all_ends_wait_early() {
        let pool = std::sync::Arc::new(TransferPool::new(4));

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let started = std::time::Instant::now();
                let taken = pool.take_completed(Duration::from_secs(30));
                (taken.is_none(), started.elapsed())
            })
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !waiter.is_finished() && std::time::Instant::now() < deadline {
            pool.notify_all();
            std::thread::sleep(Duration::from_millis(5));
        }

        let (empty, waited) = waiter.join().unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(10));
    }

    #[test]
    fn test_completed_set_evicts_oldest() {
        const CAPACITY: usize = 32;
        let pool = TransferPool::new(CAPACITY);
        pool.allocate(CAPACITY + 1, 16);

        let mut evicted = Vec::new();
        for _ in 0..=CAPACITY {
            let buffer = pool.try_acquire_available().unwrap();
            if let Some(id) = pool.mark_completed(filled(buffer, 16), Outcome::Data) {
                evicted.push(id);
            }
        }

        // Only the very first completion is lost
        assert_eq!(evicted, vec![0]);
        assert_eq!(pool.completed_len(), CAPACITY);
        assert_eq!(pool.available_len(), 1);
        assert_eq!(pool.stats().dropped, 1);
        assert!(pool.snapshot().check_invariant().is_ok());

        let oldest = pool.try_take_completed().unwrap();
        assert_eq!(oldest.buffer.id(), 1);
        assert!(pool.release(oldest.buffer));
        assert!(pool.snapshot().check_invariant().is_ok());
    }

    #[test]
    fn test_recycle_and_drain() {
        let pool = TransferPool::new(8);
        pool.allocate(4, 16);

        let a = pool.try_acquire_available().unwrap();
        let _b = pool.try_acquire_available().unwrap();
        pool.mark_completed(a, Outcome::Fault(TransferStatus::Overflow));

        assert_eq!(pool.recycle_completed(), 1);
        assert_eq!(pool.available_len(), 3);

        let drained = pool.drain();
        assert_eq!(drained.buffers.len(), 3);
        assert_eq!(drained.orphaned, vec![1]);
        assert_eq!(pool.snapshot(), PoolSnapshot::default());
    }

    #[test]
    fn test_drain_reports_held_and_drops_late_returns() {
        let pool = TransferPool::new(8);
        pool.allocate(3, 16);

        let a = pool.try_acquire_available().unwrap();
        let b = pool.try_acquire_available().unwrap();
        let c = pool.try_acquire_available().unwrap();
        pool.mark_completed(filled(a, 8), Outcome::Data);
        let held = pool.try_take_completed().unwrap();

        let drained = pool.drain();
        assert!(drained.buffers.is_empty());
        assert_eq!(drained.held, vec![0]);
        assert_eq!(drained.orphaned, vec![1, 2]);

        // Buffers coming back after the drain are not re-entered
        assert!(!pool.release(held.buffer));
        assert!(!pool.return_to_available(b));
        assert_eq!(pool.mark_completed(filled(c, 8), Outcome::Data), None);
        assert_eq!(pool.snapshot(), PoolSnapshot::default());
        assert_eq!(pool.stats().completed, 1);
    }

    #[test]
    fn test_invariant_detects_duplicates() {
        let snapshot = PoolSnapshot {
            available: vec![0, 1],
            in_flight: vec![1],
            completed: vec![],
            held: vec![],
            total: 2,
        };
        assert!(snapshot.check_invariant().is_err());
    }
}
