//! tuner-streamer
//!
//! Reads the raw sample stream of a USB SDR tuner and writes it to a file or
//! stdout. Device access, transfer management and teardown are done by the
//! `engine` crate; this binary only wires configuration, logging and signal
//! handling around it.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::StreamerConfig;
use engine::{RusbTransport, UsbInterface};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

type Device = UsbInterface<RusbTransport>;

#[derive(Parser, Debug)]
#[command(name = "tuner-streamer")]
#[command(author, version, about = "Stream raw samples from a USB SDR tuner")]
#[command(long_about = "
Reads the bulk sample stream of a USB SDR tuner and writes the raw bytes to a
file or to stdout.

EXAMPLES:
    # Stream to stdout with default config
    tuner-streamer > samples.bin

    # Write 1000 chunks to a file
    tuner-streamer --output samples.bin --max-chunks 1000

    # Show device information and exit
    tuner-streamer --info

CONFIGURATION:
    The streamer looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/tuner-streamer/streamer.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write samples to this file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Stop after this many chunks
    #[arg(short = 'n', long, value_name = "COUNT")]
    max_chunks: Option<u64>,

    /// Print device information and exit
    #[arg(long)]
    info: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = StreamerConfig::default();
        let path = StreamerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        StreamerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        StreamerConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tuner-streamer v{}", env!("CARGO_PKG_VERSION"));

    let (vendor_id, product_id) = config.device.ids()?;
    let (transport, identity) = RusbTransport::open(vendor_id, product_id)
        .with_context(|| format!("Failed to open device {:04x}:{:04x}", vendor_id, product_id))?;
    let device = Arc::new(
        UsbInterface::new(transport, identity, config.stream.clone())
            .context("Invalid stream configuration")?,
    );

    log_device_info(&device);
    if args.info {
        shutdown(&device).await;
        return Ok(());
    }

    device
        .claim_interface()
        .context("Failed to claim interface")?;

    let output = args.output.or_else(|| config.output.path.clone());
    let max_chunks = args.max_chunks.or(config.output.max_chunks);

    let mut streamer = {
        let device = Arc::clone(&device);
        tokio::task::spawn_blocking(move || stream_samples(&device, output, max_chunks))
    };

    let result = tokio::select! {
        joined = &mut streamer => joined.context("Streaming task panicked")?,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping stream...");
            // Shutdown ends the open stream, so the task finishes on its own
            shutdown(&device).await;
            streamer.await.context("Streaming task panicked")?
        }
    };

    shutdown(&device).await;

    let stats = device.stats();
    info!(
        "Read {} chunks ({} bytes), {} submissions, {} transfer errors, {} stalls recovered, {} dropped",
        stats.chunks,
        stats.bytes,
        stats.submissions,
        stats.transfer_errors,
        stats.stalls_recovered,
        stats.dropped
    );

    result
}

fn log_device_info(device: &Device) {
    let identity = device.identity();
    info!(
        "Device {:04x}:{:04x} - {} {}",
        identity.vendor_id,
        identity.product_id,
        device
            .manufacturer_name()
            .as_deref()
            .unwrap_or("Unknown Manufacturer"),
        device.product_name().as_deref().unwrap_or("Unknown Product")
    );
    if let Some(serial) = device.serial_number() {
        info!("Serial: {}", serial);
    }
}

/// Pull chunks until the stream ends, the chunk limit is hit or the reader
/// on stdout goes away
fn stream_samples(device: &Device, output: Option<PathBuf>, max_chunks: Option<u64>) -> Result<()> {
    let mut sink: Box<dyn Write + Send> = match &output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            info!("Writing samples to {}", path.display());
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let stream = device.read_bytes().context("Failed to open bulk stream")?;
    let mut chunks = 0u64;

    for chunk in stream {
        let chunk = chunk.context("Bulk stream failed")?;
        match sink.write_all(&chunk) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!("Output closed, stopping stream");
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to write samples"),
        }

        chunks += 1;
        if max_chunks.is_some_and(|max| chunks >= max) {
            info!("Reached {} chunks", chunks);
            break;
        }
    }

    if let Err(e) = sink.flush() {
        warn!("Failed to flush output: {}", e);
    }
    Ok(())
}

async fn shutdown(device: &Arc<Device>) {
    let device = Arc::clone(device);
    if let Err(e) = tokio::task::spawn_blocking(move || device.shutdown()).await {
        error!("Shutdown task panicked: {:?}", e);
    }
}
