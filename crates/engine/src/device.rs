//! Consumer-facing USB interface
//!
//! [`UsbInterface`] bundles an open transport with the device's identity and
//! exposes what application code needs: descriptor strings, interface claim,
//! the lazy bulk stream, synchronous control transfers, reset and teardown.
//!
//! Device discovery is not done here. The caller opens the transport (for
//! example with [`RusbTransport::open`](crate::RusbTransport::open)) and hands
//! it over together with the [`DeviceIdentity`] it reported.

use crate::config::StreamConfig;
use crate::control::{ControlTransaction, ControlTransferManager};
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::pool::PoolSnapshot;
use crate::session::{Session, StreamStats};
use crate::stream::BulkStream;
use crate::transport::{DeviceIdentity, Direction, Transport};
use common::{ChunkReceiver, create_chunk_channel};
use std::sync::Arc;
use tracing::{debug, info};

pub struct UsbInterface<T: Transport + 'static> {
    session: Arc<Session<T>>,
    identity: DeviceIdentity,
}

impl<T: Transport + 'static> UsbInterface<T> {
    pub fn new(transport: T, identity: DeviceIdentity, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Using device {:04x}:{:04x} (ep {:#04x}, {} x {} byte transfers)",
            identity.vendor_id,
            identity.product_id,
            config.endpoint,
            config.transfer_count,
            config.frame_size
        );
        Ok(Self {
            session: Arc::new(Session::new(transport, config)),
            identity,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &StreamConfig {
        &self.session.config
    }

    pub fn manufacturer_name(&self) -> Option<String> {
        self.read_string(self.identity.manufacturer_index)
    }

    pub fn product_name(&self) -> Option<String> {
        self.read_string(self.identity.product_index)
    }

    pub fn serial_number(&self) -> Option<String> {
        self.read_string(self.identity.serial_number_index)
    }

    fn read_string(&self, index: Option<u8>) -> Option<String> {
        let index = index?;
        if self.session.ensure_open().is_err() {
            return None;
        }
        let _io = self.session.io();
        match self.session.transport.read_string_descriptor(index) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("Could not read string descriptor {}: {}", index, e);
                None
            }
        }
    }

    /// Claim the streaming interface (detaching a kernel driver if bound)
    pub fn claim_interface(&self) -> Result<()> {
        lifecycle::claim_interface(&self.session)
    }

    /// Open a lazy bulk stream
    ///
    /// Only one stream can be open at a time; transfers are primed and the
    /// event pump started on the first pull.
    pub fn read_bytes(&self) -> Result<BulkStream<T>> {
        self.session.open_stream()?;
        Ok(BulkStream::new(Arc::clone(&self.session)))
    }

    /// Attach a push consumer
    ///
    /// Completed chunks are offered to the returned receiver first; when it
    /// is full or dropped they stay available to the pull stream instead.
    pub fn subscribe(&self, capacity: usize) -> ChunkReceiver {
        let (tx, rx) = create_chunk_channel(capacity);
        self.session.set_chunk_sender(Some(tx));
        rx
    }

    /// Detach the push consumer
    pub fn unsubscribe(&self) {
        self.session.set_chunk_sender(None);
    }

    /// Synchronous vendor control transfer
    ///
    /// For OUT requests `payload` is sent and the bytes written are returned;
    /// for IN requests `payload` sizes the read and the bytes read are
    /// returned.
    pub fn control_transfer(
        &self,
        direction: Direction,
        request: u8,
        value: u16,
        index: u16,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.execute(ControlTransaction {
            direction,
            request,
            value,
            index,
            payload,
        })
    }

    /// Execute a prepared control transaction
    pub fn execute(&self, transaction: ControlTransaction) -> Result<Vec<u8>> {
        self.session.ensure_open()?;
        ControlTransferManager::new(&self.session).execute(transaction)
    }

    pub fn reset_device(&self) -> Result<()> {
        self.session.ensure_open()?;
        info!("Resetting device");
        self.session.reset().map_err(Error::from)
    }

    /// Stop streaming, free every transfer and release the interface
    pub fn release_usb_device(&self) {
        lifecycle::release_usb_device(&self.session);
    }

    /// Stop streaming, free every transfer and close the device handle
    pub fn shutdown(&self) {
        lifecycle::shutdown(&self.session);
    }

    pub fn stats(&self) -> StreamStats {
        self.session.stats()
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.session.pool.snapshot()
    }
}

impl<T: Transport + 'static> Drop for UsbInterface<T> {
    fn drop(&mut self) {
        lifecycle::shutdown(&self.session);
    }
}
