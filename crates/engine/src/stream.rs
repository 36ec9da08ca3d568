//! Lazy bulk stream
//!
//! [`BulkStream`] is an infinite iterator of byte chunks read from the
//! bulk-IN endpoint. Nothing is submitted until the first pull (or an explicit
//! [`start`](BulkStream::start)); closing the stream, explicitly or by
//! dropping it, cancels and reclaims every transfer before returning.
//!
//! ```text
//!  Idle ──first pull──► Streaming ──close / pump fault──► Draining ──► Closed
//! ```
//!
//! A stream is not restartable. Once it has returned `None` a fresh
//! [`UsbInterface::read_bytes`](crate::UsbInterface::read_bytes) is needed.

use crate::error::{Error, Result};
use crate::pool::Outcome;
use crate::session::{Session, StreamState, bump};
use crate::transport::Transport;
use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct BulkStream<T: Transport + 'static> {
    session: Arc<Session<T>>,
    finished: bool,
}

impl<T: Transport + 'static> BulkStream<T> {
    pub(crate) fn new(session: Arc<Session<T>>) -> Self {
        Self {
            session,
            finished: false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        if self.finished {
            StreamState::Closed
        } else {
            self.session.state()
        }
    }

    /// Prime transfers and start the event pump without pulling a chunk
    pub fn start(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::Shutdown);
        }
        if let Err(e) = self.session.start_streaming() {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    /// Cancel every transfer and stop the event pump
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.session.stop_streaming();
        self.session.release_stream();
        debug!("Bulk stream closed");
    }
}

impl<T: Transport + 'static> Iterator for BulkStream<T> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.session.state() == StreamState::Idle {
            if let Err(e) = self.start() {
                return Some(Err(e));
            }
        }

        let poll_timeout = self.session.config.poll_timeout();
        loop {
            if let Some(fault) = self.session.take_fault() {
                error!("Bulk stream terminated by event pump failure: {}", fault);
                self.finish();
                return Some(Err(Error::Pump(fault)));
            }
            if self.session.state() != StreamState::Streaming {
                self.finish();
                return None;
            }

            let Some(entry) = self.session.pool.take_completed(poll_timeout) else {
                continue;
            };

            match entry.outcome {
                Outcome::Data => {
                    let chunk = entry.buffer.filled().to_vec();
                    if self.session.pool.release(entry.buffer) {
                        self.session
                            .submit_available(self.session.config.acquire_timeout());
                    }

                    bump(&self.session.counters.chunks, 1);
                    bump(&self.session.counters.bytes, chunk.len() as u64);
                    return Some(Ok(chunk));
                }
                Outcome::Fault(status) => {
                    bump(&self.session.counters.faulted_reads, 1);
                    if !self.session.pool.release(entry.buffer) {
                        continue;
                    }
                    let submitted = self.session.reprime();
                    warn!(
                        "Suppressed faulted read ({:?}), re-primed {} transfers",
                        status, submitted
                    );
                }
            }
        }
    }
}

impl<T: Transport + 'static> FusedIterator for BulkStream<T> {}

impl<T: Transport + 'static> Drop for BulkStream<T> {
    fn drop(&mut self) {
        self.finish();
    }
}
