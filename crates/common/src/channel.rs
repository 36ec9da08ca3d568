//! Bounded chunk channel between the USB event thread and consumers
//!
//! The sending half lives on the event pump thread and must never block, so
//! it only offers chunks: a full or closed channel hands the chunk back to the
//! caller, which keeps it on the pull path instead. The receiving half can be
//! drained from a Tokio task or from a plain thread.

use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Sending half, owned by the USB event thread (non-blocking)
#[derive(Clone)]
pub struct ChunkSender {
    tx: Sender<Vec<u8>>,
}

impl ChunkSender {
    /// Offer a chunk without blocking
    ///
    /// Returns the chunk back if the channel is full or the receiver is gone.
    pub fn offer(&self, chunk: Vec<u8>) -> std::result::Result<(), Vec<u8>> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) | Err(TrySendError::Closed(chunk)) => Err(chunk),
        }
    }

    /// Whether the receiving half has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, for async or blocking consumers
#[derive(Clone)]
pub struct ChunkReceiver {
    rx: Receiver<Vec<u8>>,
}

impl ChunkReceiver {
    /// Receive the next chunk (async)
    pub async fn recv(&self) -> crate::Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next chunk, blocking the current thread
    pub fn recv_blocking(&self) -> crate::Result<Vec<u8>> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a chunk without blocking
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Number of chunks currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a bounded chunk channel
///
/// Returns (ChunkSender for the event thread, ChunkReceiver for the consumer)
pub fn create_chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (ChunkSender { tx }, ChunkReceiver { rx })
}
