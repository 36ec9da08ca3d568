//! Stream configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bulk-IN streaming endpoint used by the tuner
pub const BULK_IN_ENDPOINT: u8 = 0x81;

/// Number of transfers primed when a stream starts
pub const DEFAULT_TRANSFER_COUNT: usize = 15;

/// Size of each transfer buffer in bytes
pub const DEFAULT_FRAME_SIZE: usize = 16384;

/// Completed transfers held for the consumer before the oldest is dropped
pub const DEFAULT_COMPLETED_CAPACITY: usize = 32;

/// Tunables for the bulk stream and control transfers
///
/// Every field has a default, so a partial TOML table is enough:
///
/// ```toml
/// [stream]
/// transfer_count = 15
/// frame_size = 16384
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interface number claimed for streaming
    pub interface: u8,
    /// Bulk-IN endpoint address
    pub endpoint: u8,
    /// Number of transfers kept in flight
    pub transfer_count: usize,
    /// Bytes per transfer buffer
    pub frame_size: usize,
    /// Capacity of the completed set
    pub completed_capacity: usize,
    /// Bounded wait when acquiring an available buffer
    pub acquire_timeout_ms: u64,
    /// Bounded wait per poll of the completed set
    pub poll_timeout_ms: u64,
    /// Timeout passed to each blocking event-handling call
    pub event_timeout_ms: u64,
    /// Timeout for individual bulk transfers (effectively never expires)
    pub bulk_timeout_ms: u64,
    /// Timeout for control transfers
    pub control_timeout_ms: u64,
    /// How long close waits for cancelled transfers to come back
    pub drain_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interface: 0,
            endpoint: BULK_IN_ENDPOINT,
            transfer_count: DEFAULT_TRANSFER_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
            acquire_timeout_ms: 200,
            poll_timeout_ms: 1000,
            event_timeout_ms: 100,
            bulk_timeout_ms: 1_000_000,
            control_timeout_ms: 300,
            drain_timeout_ms: 2000,
        }
    }
}

impl StreamConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.endpoint & 0x80 == 0 {
            return Err(Error::Config(format!(
                "Endpoint {:#04x} is not an IN endpoint",
                self.endpoint
            )));
        }
        if self.transfer_count == 0 {
            return Err(Error::Config("transfer_count must be at least 1".into()));
        }
        if self.frame_size == 0 {
            return Err(Error::Config("frame_size must be at least 1".into()));
        }
        if self.completed_capacity == 0 {
            return Err(Error::Config("completed_capacity must be at least 1".into()));
        }
        if self.poll_timeout_ms == 0 || self.event_timeout_ms == 0 {
            return Err(Error::Config(
                "poll_timeout_ms and event_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuner_stream() {
        let config = StreamConfig::default();
        assert_eq!(config.endpoint, 0x81);
        assert_eq!(config.transfer_count, 15);
        assert_eq!(config.frame_size, 16384);
        assert_eq!(config.completed_capacity, 32);
        assert_eq!(config.acquire_timeout(), Duration::from_millis(200));
        assert_eq!(config.control_timeout(), Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: StreamConfig = toml::from_str("transfer_count = 4\nframe_size = 512\n").unwrap();
        assert_eq!(config.transfer_count, 4);
        assert_eq!(config.frame_size, 512);
        assert_eq!(config.completed_capacity, DEFAULT_COMPLETED_CAPACITY);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = StreamConfig {
            endpoint: 0x01,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = StreamConfig {
            transfer_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamConfig {
            completed_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
