//! Event pump thread
//!
//! Dedicated thread that repeatedly calls the transport's blocking
//! `handle_events` while the stream is active. It is the only thread that
//! delivers completions, so the classifier always runs here.
//!
//! When the stream leaves the `Streaming` state the pump cancels whatever is
//! still in flight and keeps handling events until every cancelled transfer
//! has come back (or the drain timeout passes), then exits. An error from
//! `handle_events` other than `Interrupted` is fatal: it is recorded on the
//! session and surfaces as the stream's terminal fault.

use crate::classifier::CompletionClassifier;
use crate::error::{Error, Result, TransportError};
use crate::session::{Session, StreamState};
use crate::transport::Transport;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Handle to the running pump thread
pub(crate) struct EventPump {
    thread: JoinHandle<()>,
}

impl EventPump {
    pub(crate) fn spawn<T: Transport + 'static>(session: Arc<Session<T>>) -> Result<Self> {
        let thread = std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || run(&session))
            .map_err(|e| Error::Spawn(e.to_string()))?;
        Ok(Self { thread })
    }

    /// Wait for the pump thread to exit
    pub(crate) fn join(self) {
        if let Err(e) = self.thread.join() {
            error!("Event pump thread panicked: {:?}", e);
        }
    }
}

fn run<T: Transport>(session: &Session<T>) {
    info!("Event pump started");
    let classifier = CompletionClassifier::new(session);
    let timeout = session.config.event_timeout();

    while session.is_streaming() {
        match session
            .transport
            .handle_events(timeout, &mut |c| classifier.on_complete(c))
        {
            Ok(()) => {}
            Err(TransportError::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                error!("Error handling USB events, stopping stream: {}", e);
                session.record_fault(e);
                session.set_state(StreamState::Draining);
                break;
            }
        }
    }

    drain(session, &classifier);
    info!("Event pump stopped");
}

/// Cancel every in-flight transfer and handle events until they are back
pub(crate) fn drain<T: Transport>(session: &Session<T>, classifier: &CompletionClassifier<'_, T>) {
    let cancelled = session.cancel_in_flight(None);
    debug!("Draining {} cancelled transfers", cancelled);

    let deadline = Instant::now() + session.config.drain_timeout();
    let slice = session.config.event_timeout();

    while session.pool.in_flight_len() > 0 {
        if Instant::now() >= deadline {
            warn!(
                "{} transfers still in flight after drain timeout",
                session.pool.in_flight_len()
            );
            break;
        }
        match session
            .transport
            .handle_events(slice, &mut |c| classifier.on_complete(c))
        {
            Ok(()) | Err(TransportError::Interrupted) => {}
            Err(e) => {
                warn!("Error handling USB events while draining: {}", e);
                break;
            }
        }
    }
}
