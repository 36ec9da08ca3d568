//! Control transfer execution
//!
//! Control transfers are synchronous and go to endpoint 0. They share the
//! device handle with bulk streaming, so each attempt runs under the session
//! I/O lock.
//!
//! Retry policy: a stall or timeout clears the halt on endpoint 0 and retries
//! once. If the retry stalls or times out too, the device is reset and the
//! caller gets [`Error::ControlStalled`]. Any other failure is reported as
//! [`Error::ControlRefused`] without a retry.

use crate::error::{Error, Result, TransportError};
use crate::session::Session;
use crate::transport::{CONTROL_ENDPOINT, ControlSetup, Direction, Transport};
use tracing::{debug, error, warn};

/// A single control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransaction {
    pub direction: Direction,
    pub request: u8,
    /// wValue (register address for the tuner's vendor requests)
    pub value: u16,
    pub index: u16,
    /// Bytes to send (OUT) or a buffer sized for the expected reply (IN)
    pub payload: Vec<u8>,
}

impl ControlTransaction {
    /// Device-to-host request reading up to `length` bytes
    pub fn read(request: u8, value: u16, index: u16, length: usize) -> Self {
        Self {
            direction: Direction::In,
            request,
            value,
            index,
            payload: vec![0; length],
        }
    }

    /// Host-to-device request sending `data`
    pub fn write(request: u8, value: u16, index: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            direction: Direction::Out,
            request,
            value,
            index,
            payload: data.into(),
        }
    }

    pub fn setup(&self) -> Result<ControlSetup> {
        let length = u16::try_from(self.payload.len()).map_err(|_| Error::PayloadTooLarge {
            len: self.payload.len(),
            max: u16::MAX as usize,
        })?;
        Ok(ControlSetup::new(
            self.direction,
            self.request,
            self.value,
            self.index,
            length,
        ))
    }
}

fn is_retryable(err: &TransportError) -> bool {
    matches!(err, TransportError::Pipe | TransportError::Timeout)
}

pub(crate) struct ControlTransferManager<'a, T> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> ControlTransferManager<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Execute a control transaction, returning the bytes transferred
    pub(crate) fn execute(&self, transaction: ControlTransaction) -> Result<Vec<u8>> {
        let setup = transaction.setup()?;
        let mut payload = transaction.payload;

        debug!("Control transfer: {}", setup);

        match self.attempt(&setup, &mut payload) {
            Ok(len) => return Ok(trimmed(payload, len)),
            Err(e) if is_retryable(&e) => {
                warn!("Control transfer failed ({}): {}, clearing halt and retrying", setup, e);
                if let Err(clear) = self.session.clear_halt(CONTROL_ENDPOINT) {
                    warn!("Failed to clear halt on control endpoint: {}", clear);
                }
            }
            Err(e) => {
                error!("Control transfer refused ({}): {}", setup, e);
                return Err(Error::ControlRefused { setup, source: e });
            }
        }

        match self.attempt(&setup, &mut payload) {
            Ok(len) => {
                debug!("Control transfer succeeded on retry: {} bytes", len);
                Ok(trimmed(payload, len))
            }
            Err(e) if is_retryable(&e) => {
                error!(
                    "Control transfer failed again ({}): {}, resetting device",
                    setup, e
                );
                if let Err(reset) = self.session.reset() {
                    warn!("Device reset failed: {}", reset);
                }
                Err(Error::ControlStalled { setup, source: e })
            }
            Err(e) => {
                error!("Control transfer refused on retry ({}): {}", setup, e);
                Err(Error::ControlRefused { setup, source: e })
            }
        }
    }

    fn attempt(
        &self,
        setup: &ControlSetup,
        payload: &mut [u8],
    ) -> std::result::Result<usize, TransportError> {
        let _io = self.session.io();
        self.session
            .transport
            .control_transfer(setup, payload, self.session.config.control_timeout())
    }
}

fn trimmed(mut payload: Vec<u8>, len: usize) -> Vec<u8> {
    payload.truncate(len);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::test_utils::FakeTransport;
    use std::sync::Arc;

    fn session() -> (Arc<FakeTransport>, Session<Arc<FakeTransport>>) {
        let fake = Arc::new(FakeTransport::new());
        let session = Session::new(fake.clone(), StreamConfig::default());
        (fake, session)
    }

    #[test]
    fn test_write_returns_bytes_written() {
        let (fake, session) = session();
        let manager = ControlTransferManager::new(&session);

        let written = manager
            .execute(ControlTransaction::write(0x01, 0x2000, 0x0610, vec![0x14]))
            .unwrap();

        assert_eq!(written, vec![0x14]);
        let log = fake.control_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].request_type, 0x40);
        assert_eq!(log[0].value, 0x2000);
    }

    #[test]
    fn test_read_is_trimmed_to_bytes_read() {
        let (fake, session) = session();
        fake.script_control([Ok(2)]);
        let manager = ControlTransferManager::new(&session);

        let read = manager
            .execute(ControlTransaction::read(0x00, 0x0034, 0x0600, 4))
            .unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(fake.control_log()[0].request_type, 0xC0);
    }

    #[test]
    fn test_stall_then_success_returns_retry_result() {
        let (fake, session) = session();
        fake.script_control([Err(TransportError::Pipe), Ok(1)]);
        let manager = ControlTransferManager::new(&session);

        let read = manager
            .execute(ControlTransaction::read(0x00, 0x0034, 0x0600, 1))
            .unwrap();

        assert_eq!(read.len(), 1);
        assert_eq!(fake.clear_halts(), vec![CONTROL_ENDPOINT]);
        assert_eq!(fake.resets(), 0);
        assert_eq!(fake.control_log().len(), 2);
    }

    #[test]
    fn test_second_stall_resets_and_fails() {
        let (fake, session) = session();
        fake.script_control([Err(TransportError::Pipe), Err(TransportError::Pipe)]);
        let manager = ControlTransferManager::new(&session);

        let result = manager.execute(ControlTransaction::write(0x01, 0x0001, 0x0610, vec![0x00]));

        match result {
            Err(Error::ControlStalled { setup, source }) => {
                assert_eq!(setup.request, 0x01);
                assert_eq!(source, TransportError::Pipe);
            }
            other => panic!("expected ControlStalled, got {:?}", other),
        }
        assert_eq!(fake.resets(), 1);
        assert_eq!(fake.control_log().len(), 2);
    }

    #[test]
    fn test_timeout_counts_as_stall() {
        let (fake, session) = session();
        fake.script_control([Err(TransportError::Timeout), Err(TransportError::Timeout)]);
        let manager = ControlTransferManager::new(&session);

        let result = manager.execute(ControlTransaction::read(0x00, 0, 0, 1));
        assert!(matches!(result, Err(Error::ControlStalled { .. })));
        assert_eq!(fake.resets(), 1);
    }

    #[test]
    fn test_other_failure_is_refused_without_retry() {
        let (fake, session) = session();
        fake.script_control([Err(TransportError::Io)]);
        let manager = ControlTransferManager::new(&session);

        let result = manager.execute(ControlTransaction::read(0x00, 0, 0, 1));
        assert!(matches!(result, Err(Error::ControlRefused { .. })));
        assert_eq!(fake.control_log().len(), 1);
        assert!(fake.clear_halts().is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let transaction = ControlTransaction::write(0x01, 0, 0, vec![0; 70_000]);
        assert!(matches!(
            transaction.setup(),
            Err(Error::PayloadTooLarge { len: 70_000, .. })
        ));
    }
}
