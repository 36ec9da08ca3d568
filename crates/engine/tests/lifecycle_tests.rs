//! Integration tests for device lifecycle and control traffic
//!
//! Covers:
//! - Interface claim with and without a bound kernel driver
//! - Descriptor strings
//! - Control transfers through the device facade
//! - Release and shutdown completeness

use engine::test_utils::{DEFAULT_TEST_TIMEOUT, FakeTransport, wait_for};
use engine::{
    ControlTransaction, DeviceIdentity, Direction, Error, PoolSnapshot, StreamConfig,
    TransportError, UsbInterface,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn open(fake: &Arc<FakeTransport>, config: StreamConfig) -> UsbInterface<Arc<FakeTransport>> {
    let identity = DeviceIdentity {
        vendor_id: 0x0bda,
        product_id: 0x2838,
        manufacturer_index: Some(1),
        product_index: Some(2),
        serial_number_index: Some(3),
    };
    UsbInterface::new(fake.clone(), identity, config).unwrap()
}

// ============================================================================
// Claim
// ============================================================================

#[test]
fn test_claim_detaches_active_kernel_driver() {
    let fake = Arc::new(FakeTransport::new());
    fake.set_kernel_driver_active(true);
    let device = open(&fake, StreamConfig::default());

    device.claim_interface().unwrap();

    assert!(fake.auto_detach());
    assert_eq!(fake.claimed(), vec![0]);
}

#[test]
fn test_claim_without_kernel_driver() {
    let fake = Arc::new(FakeTransport::new());
    let device = open(&fake, StreamConfig::default());

    device.claim_interface().unwrap();

    assert!(!fake.auto_detach());
    assert_eq!(fake.claimed(), vec![0]);
}

#[test]
fn test_claim_failure_is_reported() {
    let fake = Arc::new(FakeTransport::new());
    fake.fail_claim(TransportError::Busy);
    let device = open(&fake, StreamConfig::default());

    match device.claim_interface() {
        Err(Error::Claim { interface, source }) => {
            assert_eq!(interface, 0);
            assert_eq!(source, TransportError::Busy);
        }
        other => panic!("expected claim failure, got {:?}", other),
    }
}

#[test]
fn test_invalid_config_rejected() {
    let fake = Arc::new(FakeTransport::new());
    let config = StreamConfig {
        transfer_count: 0,
        ..Default::default()
    };
    let result = UsbInterface::new(fake, DeviceIdentity::default(), config);
    assert!(matches!(result, Err(Error::Config(_))));
}

// ============================================================================
// Descriptors and control
// ============================================================================

#[test]
fn test_descriptor_strings() {
    let fake = Arc::new(FakeTransport::new());
    fake.set_string(1, "Realtek");
    fake.set_string(2, "RTL2838UHIDIR");
    let device = open(&fake, StreamConfig::default());

    assert_eq!(device.identity().vendor_id, 0x0bda);
    assert_eq!(device.manufacturer_name().as_deref(), Some("Realtek"));
    assert_eq!(device.product_name().as_deref(), Some("RTL2838UHIDIR"));
    // Index 3 has no string on this device
    assert_eq!(device.serial_number(), None);
}

#[test]
fn test_control_write_through_device() {
    let fake = Arc::new(FakeTransport::new());
    let device = open(&fake, StreamConfig::default());

    let written = device
        .control_transfer(Direction::Out, 0x01, 0x2000, 0x0610, vec![0x14])
        .unwrap();

    assert_eq!(written, vec![0x14]);
    let log = fake.control_log();
    assert_eq!(log[0].request_type, 0x40);
    assert_eq!(log[0].index, 0x0610);
}

#[test]
fn test_control_read_while_streaming() {
    let fake = Arc::new(FakeTransport::new());
    let device = open(&fake, StreamConfig::default());
    let mut stream = device.read_bytes().unwrap();
    stream.start().unwrap();

    let read = device
        .execute(ControlTransaction::read(0x00, 0x0034, 0x0600, 2))
        .unwrap();
    assert_eq!(read, vec![0, 1]);

    fake.complete_next(128).unwrap();
    assert_eq!(stream.next().unwrap().unwrap().len(), 128);
}

#[test]
fn test_control_stall_resets_device() {
    let fake = Arc::new(FakeTransport::new());
    fake.script_control([Err(TransportError::Pipe), Err(TransportError::Pipe)]);
    let device = open(&fake, StreamConfig::default());

    let result = device.control_transfer(Direction::In, 0x00, 0, 0, vec![0; 1]);

    assert!(matches!(result, Err(Error::ControlStalled { .. })));
    assert_eq!(fake.resets(), 1);
    assert_eq!(fake.clear_halts(), vec![0x00]);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_release_frees_transfers_and_interface() {
    let fake = Arc::new(FakeTransport::new());
    let device = open(&fake, StreamConfig {
        transfer_count: 4,
        ..Default::default()
    });
    device.claim_interface().unwrap();

    let mut stream = device.read_bytes().unwrap();
    stream.start().unwrap();
    stream.close();

    device.release_usb_device();

    assert_eq!(fake.freed().len(), 4);
    assert_eq!(fake.released(), vec![0]);
    assert!(!fake.is_closed());
    assert_eq!(device.pool_snapshot().total, 0);

    // The handle stays open, so streaming can start over
    let mut stream = device.read_bytes().unwrap();
    stream.start().unwrap();
    assert_eq!(fake.in_flight_len(), 4);
}

#[test]
fn test_shutdown_reclaims_everything() {
    let fake = Arc::new(FakeTransport::new());
    let device = open(&fake, StreamConfig::default());
    device.claim_interface().unwrap();

    let mut stream = device.read_bytes().unwrap();
    stream.start().unwrap();
    fake.complete_next(512).unwrap();
    fake.complete_next(512).unwrap();
    assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
        device.pool_snapshot().completed.len() == 2
    }));

    device.shutdown();

    assert!(fake.is_closed());
    assert_eq!(fake.in_flight_len(), 0);
    assert_eq!(fake.delivered_after_close(), 0);

    // Each transfer is freed exactly once
    let freed = fake.freed();
    assert_eq!(freed.len(), 15);
    assert_eq!(freed.iter().collect::<HashSet<_>>().len(), 15);

    let snapshot = device.pool_snapshot();
    assert!(snapshot.available.is_empty());
    assert!(snapshot.in_flight.is_empty());
    assert!(snapshot.completed.is_empty());
    assert!(snapshot.held.is_empty());

    // The open stream sees the shutdown and ends
    assert!(stream.next().is_none());

    device.shutdown();
    assert_eq!(fake.close_calls(), 1);
    assert!(matches!(device.read_bytes(), Err(Error::Shutdown)));
    assert!(matches!(
        device.control_transfer(Direction::Out, 0x01, 0, 0, vec![0]),
        Err(Error::Shutdown)
    ));
}

#[test]
fn test_shutdown_racing_consumer_frees_every_transfer() {
    for iteration in 0..200u64 {
        let fake = Arc::new(FakeTransport::new());
        let device = Arc::new(open(&fake, StreamConfig {
            transfer_count: 2,
            frame_size: 512,
            poll_timeout_ms: 50,
            ..Default::default()
        }));
        let stop_driver = Arc::new(AtomicBool::new(false));

        let driver = {
            let fake = fake.clone();
            let stop_driver = stop_driver.clone();
            thread::spawn(move || {
                while !stop_driver.load(Ordering::Acquire) {
                    if fake.complete_next(64).is_none() {
                        thread::yield_now();
                    }
                }
            })
        };
        let consumer = {
            let device = device.clone();
            thread::spawn(move || match device.read_bytes() {
                Ok(stream) => stream.take_while(|chunk| chunk.is_ok()).count(),
                Err(_) => 0,
            })
        };

        // Land the shutdown at varying points of the pull loop
        thread::sleep(Duration::from_micros(500 + (iteration % 13) * 500));
        device.shutdown();
        consumer.join().unwrap();
        stop_driver.store(true, Ordering::Release);
        driver.join().unwrap();

        let snapshot = device.pool_snapshot();
        assert_eq!(snapshot, PoolSnapshot::default(), "iteration {}", iteration);

        let freed = fake.freed();
        let distinct: HashSet<_> = freed.iter().copied().collect();
        assert_eq!(freed.len(), distinct.len(), "double free in iteration {}", iteration);
        if fake.submission_count() > 0 {
            assert_eq!(distinct, HashSet::from([0, 1]), "iteration {}", iteration);
        }
        assert_eq!(fake.delivered_after_close(), 0, "iteration {}", iteration);
    }
}

#[test]
fn test_drop_shuts_down() {
    let fake = Arc::new(FakeTransport::new());
    {
        let device = open(&fake, StreamConfig::default());
        let mut stream = device.read_bytes().unwrap();
        stream.start().unwrap();
        stream.close();
    }
    assert!(fake.is_closed());
    assert_eq!(fake.freed().len(), 15);
}
