//! Common utilities for the tuner USB workspace
//!
//! This crate provides functionality shared by the transfer engine and the
//! streamer binary: error handling, logging setup, and the bounded chunk
//! channel used to push sample data from the USB event thread to consumers.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{ChunkReceiver, ChunkSender, create_chunk_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
