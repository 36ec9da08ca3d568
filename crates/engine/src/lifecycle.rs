//! Interface claim, release and shutdown
//!
//! Teardown is best effort and total: a transfer or interface that refuses
//! to be released is logged and the remaining steps still run.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Claim the streaming interface, detaching a bound kernel driver first
pub(crate) fn claim_interface<T: Transport>(session: &Session<T>) -> Result<()> {
    session.ensure_open()?;
    let interface = session.config.interface;
    let _io = session.io();

    match session.transport.kernel_driver_active(interface) {
        Ok(true) => {
            info!(
                "Kernel driver is active on interface {}, enabling auto-detach",
                interface
            );
            if let Err(e) = session.transport.set_auto_detach_kernel_driver(true) {
                warn!("Failed to enable kernel driver auto-detach: {}", e);
            }
        }
        Ok(false) => {
            debug!("No kernel driver active on interface {}", interface);
        }
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }

    session
        .transport
        .claim_interface(interface)
        .map_err(|source| {
            warn!("Failed to claim interface {}: {}", interface, source);
            Error::Claim { interface, source }
        })?;

    session.claimed.store(true, Ordering::Release);
    debug!("Claimed interface {}", interface);
    Ok(())
}

/// Cancel and free every transfer in every set; returns how many were freed
pub(crate) fn free_transfers<T: Transport>(session: &Session<T>) -> usize {
    let drained = session.pool.drain();
    let _io = session.io();
    let mut freed = 0;

    for id in &drained.orphaned {
        warn!("Transfer {} never came back from the transport, freeing anyway", id);
        if let Err(e) = session.transport.cancel_transfer(*id) {
            debug!("Cancel of orphaned transfer {} failed: {}", id, e);
        }
        match session.transport.free_transfer(*id) {
            Ok(()) => freed += 1,
            Err(e) => warn!("Failed to free transfer {}: {}", id, e),
        }
    }

    // The consumer still owns these buffers but is done with the transport
    for id in &drained.held {
        match session.transport.free_transfer(*id) {
            Ok(()) => freed += 1,
            Err(e) => warn!("Failed to free transfer {}: {}", id, e),
        }
    }

    for buffer in drained.buffers {
        match session.transport.free_transfer(buffer.id()) {
            Ok(()) => freed += 1,
            Err(e) => warn!("Failed to free transfer {}: {}", buffer.id(), e),
        }
    }

    if freed > 0 {
        debug!("Freed {} transfers", freed);
    }
    freed
}

/// Stop streaming, free every transfer and release the claimed interface
pub(crate) fn release_usb_device<T: Transport + 'static>(session: &Session<T>) {
    session.stop_streaming();
    free_transfers(session);

    if session.claimed.swap(false, Ordering::AcqRel) {
        let interface = session.config.interface;
        let _io = session.io();
        match session.transport.release_interface(interface) {
            Ok(()) => debug!("Released interface {}", interface),
            Err(e) => warn!("Failed to release interface {}: {}", interface, e),
        }
    }
}

/// Stop streaming, free every transfer and close the device handle
///
/// Only the first call does anything.
pub(crate) fn shutdown<T: Transport + 'static>(session: &Session<T>) {
    if session.shut_down.swap(true, Ordering::AcqRel) {
        return;
    }

    info!("Shutting down USB device");
    session.stop_streaming();
    free_transfers(session);
    session.claimed.store(false, Ordering::Release);

    let _io = session.io();
    session.transport.close();
}
