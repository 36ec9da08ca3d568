//! Completion classifier
//!
//! Runs on the event pump thread for every finished bulk transfer and turns
//! the transfer status into pool moves and resubmissions. It never blocks on
//! the pool and never propagates an error back into the transport; a failure
//! it cannot recover from becomes a faulted entry in the completed set.

use crate::pool::Outcome;
use crate::session::{Session, bump};
use crate::transport::{Completion, TransferBuffer, TransferStatus, Transport};
use tracing::{error, trace, warn};

pub(crate) struct CompletionClassifier<'a, T> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> CompletionClassifier<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Handle one transfer-finished event
    pub(crate) fn on_complete(&self, completion: Completion) {
        let Completion {
            buffer,
            status,
            endpoint,
        } = completion;
        let streaming = self.session.is_streaming();

        match status {
            TransferStatus::Completed => self.on_success(buffer, streaming),
            TransferStatus::Stall => self.on_stall(buffer, endpoint, streaming),
            TransferStatus::Cancelled => {
                trace!("Transfer {} cancelled", buffer.id());
                self.session.pool.return_to_available(buffer);
                if streaming {
                    self.session.try_submit_available();
                }
            }
            other => self.on_error(buffer, endpoint, other),
        }
    }

    fn on_success(&self, buffer: TransferBuffer, streaming: bool) {
        trace!(
            "Transfer {} completed with {} bytes",
            buffer.id(),
            buffer.actual_length()
        );

        if self.session.offer_chunk(buffer.filled()) {
            self.session.pool.return_to_available(buffer);
        } else {
            self.session.pool.mark_completed(buffer, Outcome::Data);
        }

        if streaming {
            self.session.try_submit_available();
        }
    }

    fn on_stall(&self, buffer: TransferBuffer, endpoint: u8, streaming: bool) {
        if !streaming {
            self.session.pool.return_to_available(buffer);
            return;
        }

        warn!(
            "Transfer {} stalled on ep {:#04x}, clearing halt",
            buffer.id(),
            endpoint
        );

        // Pending transfers on a halted endpoint cannot complete; they come
        // back as Cancelled and are resubmitted once the halt is cleared.
        let cancelled = self.session.cancel_in_flight(Some(buffer.id()));

        match self.session.clear_halt(endpoint) {
            Ok(()) => {
                bump(&self.session.counters.stalls_recovered, 1);
                warn!(
                    "Cleared halt on ep {:#04x}, resubmitting ({} transfers cancelled)",
                    endpoint, cancelled
                );
                self.session.pool.return_to_available(buffer);
                self.session.try_submit_available();
            }
            Err(e) => {
                error!("Failed to clear halt on ep {:#04x}: {}", endpoint, e);
                bump(&self.session.counters.transfer_errors, 1);
                self.session
                    .pool
                    .mark_completed(buffer, Outcome::Fault(TransferStatus::Stall));
            }
        }
    }

    fn on_error(&self, buffer: TransferBuffer, endpoint: u8, status: TransferStatus) {
        error!(
            "Bulk transfer failed: status={:?}, transfer_type=bulk, endpoint={:#04x}, transfer={}, length={}, actual_length={}",
            status,
            endpoint,
            buffer.id(),
            buffer.capacity(),
            buffer.actual_length()
        );
        bump(&self.session.counters.transfer_errors, 1);
        self.session
            .pool
            .mark_completed(buffer, Outcome::Fault(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::session::StreamState;
    use crate::test_utils::FakeTransport;
    use common::create_chunk_channel;
    use std::sync::Arc;
    use std::time::Duration;

    const EVENT_TIMEOUT: Duration = Duration::from_millis(50);

    fn streaming_session(transfers: usize) -> (Arc<FakeTransport>, Session<Arc<FakeTransport>>) {
        let fake = Arc::new(FakeTransport::new());
        let config = StreamConfig {
            transfer_count: transfers,
            frame_size: 512,
            ..Default::default()
        };
        let session = Session::new(fake.clone(), config);
        session.set_state(StreamState::Streaming);
        assert_eq!(session.prime(), transfers);
        (fake, session)
    }

    /// Deliver whatever the fake transport has pending, on this thread
    fn pump_once(session: &Session<Arc<FakeTransport>>) {
        let classifier = CompletionClassifier::new(session);
        session
            .transport
            .handle_events(EVENT_TIMEOUT, &mut |c| classifier.on_complete(c))
            .unwrap();
    }

    #[test]
    fn test_success_moves_to_completed() {
        let (fake, session) = streaming_session(3);

        fake.complete_next(100).unwrap();
        pump_once(&session);

        assert_eq!(session.pool.completed_len(), 1);
        assert_eq!(session.pool.in_flight_len(), 2);
        // Nothing was available, so no extra submission happened
        assert_eq!(fake.submission_count(), 3);

        let entry = session.pool.try_take_completed().unwrap();
        assert_eq!(entry.outcome, Outcome::Data);
        assert_eq!(entry.buffer.filled().len(), 100);
    }

    #[test]
    fn test_success_resubmits_when_buffer_available() {
        let (fake, session) = streaming_session(2);
        session.pool.allocate(1, 512);

        fake.complete_next(64).unwrap();
        pump_once(&session);

        assert_eq!(fake.submission_count(), 3);
        assert_eq!(session.pool.in_flight_len(), 2);
        assert!(session.pool.snapshot().check_invariant().is_ok());
    }

    #[test]
    fn test_stall_recovery_resubmits_stalled_buffer_once() {
        let (fake, session) = streaming_session(4);
        let before = session.pool.total();

        let stalled = fake.complete_next_with_status(TransferStatus::Stall).unwrap();
        pump_once(&session);

        assert_eq!(fake.clear_halts(), vec![0x81]);
        assert_eq!(fake.cancels().len(), 3);
        assert_eq!(
            fake.submissions().iter().filter(|id| **id == stalled).count(),
            2
        );

        // Cancelled siblings come back and are resubmitted
        pump_once(&session);
        assert_eq!(fake.in_flight_len(), 4);
        assert_eq!(session.pool.in_flight_len(), 4);
        assert_eq!(session.pool.total(), before);
        assert!(session.pool.snapshot().check_invariant().is_ok());
        assert_eq!(session.stats().stalls_recovered, 1);
    }

    #[test]
    fn test_stall_with_failed_clear_halt_is_faulted_read() {
        let (fake, session) = streaming_session(2);
        fake.fail_clear_halt(crate::error::TransportError::Io);

        fake.complete_next_with_status(TransferStatus::Stall).unwrap();
        pump_once(&session);

        let entry = session.pool.try_take_completed().unwrap();
        assert_eq!(entry.outcome, Outcome::Fault(TransferStatus::Stall));
    }

    #[test]
    fn test_cancelled_is_resubmitted_while_streaming() {
        let (fake, session) = streaming_session(2);
        let id = fake.in_flight_ids()[0];

        session.cancel_in_flight(None);
        pump_once(&session);

        assert_eq!(session.pool.in_flight_len(), 2);
        assert_eq!(fake.submission_count(), 4);
        assert!(fake.submissions().contains(&id));
    }

    #[test]
    fn test_cancelled_returns_to_available_while_draining() {
        let (fake, session) = streaming_session(2);
        session.set_state(StreamState::Draining);

        session.cancel_in_flight(None);
        pump_once(&session);

        assert_eq!(session.pool.available_len(), 2);
        assert_eq!(session.pool.in_flight_len(), 0);
        assert_eq!(fake.submission_count(), 2);
    }

    #[test]
    fn test_other_status_is_tagged_fault() {
        let (fake, session) = streaming_session(2);

        fake.complete_next_with_status(TransferStatus::Overflow).unwrap();
        pump_once(&session);

        let entry = session.pool.try_take_completed().unwrap();
        assert_eq!(entry.outcome, Outcome::Fault(TransferStatus::Overflow));
        assert_eq!(session.stats().transfer_errors, 1);
    }

    #[test]
    fn test_push_consumer_receives_chunk() {
        let (fake, session) = streaming_session(2);
        let (tx, rx) = create_chunk_channel(1);
        session.set_chunk_sender(Some(tx));

        fake.complete_next(10).unwrap();
        fake.complete_next(20).unwrap();
        pump_once(&session);

        // First chunk went to the channel, the second fell back to the pool
        assert_eq!(rx.try_recv().map(|c| c.len()), Some(10));
        assert_eq!(session.pool.completed_len(), 1);
        assert_eq!(session.stats().pushed, 1);
        assert!(session.pool.snapshot().check_invariant().is_ok());
    }
}
