//! Bulk transfer engine for an SDR tuner dongle
//!
//! Keeps a fixed pool of bulk-IN transfers circulating between the host USB
//! stack and a consumer, so the tuner's sample stream is read without gaps:
//!
//! ```text
//!   available ──submit──► in_flight ──complete──► completed ──consume──► available
//!       ▲                     │
//!       └──────cancel─────────┘
//! ```
//!
//! A dedicated event pump thread drives completions; the consumer pulls byte
//! chunks from a [`BulkStream`] (or receives them on a push channel, see
//! [`UsbInterface::subscribe`]). Synchronous vendor control transfers share
//! the same device handle.
//!
//! # Example
//!
//! ```no_run
//! use engine::{RusbTransport, StreamConfig, UsbInterface};
//!
//! # fn main() -> engine::Result<()> {
//! let (transport, identity) = RusbTransport::open(0x0bda, 0x2838)?;
//! let device = UsbInterface::new(transport, identity, StreamConfig::default())?;
//! device.claim_interface()?;
//!
//! for chunk in device.read_bytes()?.take(10) {
//!     println!("{} bytes", chunk?.len());
//! }
//! device.shutdown();
//! # Ok(())
//! # }
//! ```

mod classifier;
pub mod config;
mod control;
mod device;
pub mod error;
mod lifecycle;
pub mod pool;
mod pump;
mod session;
mod stream;
pub mod test_utils;
pub mod transport;

pub use config::StreamConfig;
pub use control::ControlTransaction;
pub use device::UsbInterface;
pub use error::{Error, Result, TransportError};
pub use pool::PoolSnapshot;
pub use session::{StreamState, StreamStats};
pub use stream::BulkStream;
pub use transport::{
    CONTROL_IN, CONTROL_OUT, ControlSetup, DeviceIdentity, Direction, RusbTransport,
    TransferStatus, Transport,
};
