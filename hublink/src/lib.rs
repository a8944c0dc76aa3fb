//! # hublink
//!
//! A library for uploading and running programs on Pybricks-compatible BLE
//! hubs.
//!
//! This crate provides the core functionality for talking to a hub over its
//! single command/event channel, including:
//!
//! - Wire codec for command packets and inbound events
//! - One-time capability negotiation with conservative fallbacks
//! - The chunked program transfer engine with cooperative cancellation
//! - Session/link lifecycle management and ordered event routing
//! - Demultiplexing of program output and hub status reports
//!
//! ## Supported Transports
//!
//! - **BLE** (default): native Bluetooth LE via the `btleplug` crate
//! - Any custom transport implementing the [`Channel`] trait
//!
//! ## Features
//!
//! - `ble` (default): btleplug-backed BLE transport
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use hublink::{BleOptions, HubSession, ProgramImage, SessionConfig};
//! use hublink::output::NullConsole;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover a hub and establish a session
//!     let session = HubSession::connect(
//!         &BleOptions::default(),
//!         Arc::new(NullConsole),
//!         SessionConfig::default(),
//!     )
//!     .await?;
//!
//!     // Upload and start a program
//!     let image = ProgramImage::from_source("print(\"hello\")\n");
//!     session
//!         .run_program(&image, |sent, total| {
//!             println!("uploaded {sent}/{total}");
//!         })
//!         .await?;
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capabilities;
pub mod channel;
pub mod error;
pub mod image;
pub mod output;
pub mod protocol;
pub mod session;
pub mod uploader;

// Re-exports for convenience
// BLE-specific re-exports
#[cfg(feature = "ble")]
pub use channel::ble::{BleChannel, BleOptions, DiscoveredHub, scan};
pub use {
    capabilities::{Capabilities, DEFAULT_MAX_WRITE_SIZE},
    channel::{Channel, ChannelEvent, EventReceiver},
    error::{Error, Result},
    image::ProgramImage,
    output::{ConsoleSink, LogRecord, NullConsole, Severity},
    protocol::{CommandPacket, Event, ProtocolRevision, StatusReport},
    session::{HubSession, LinkState, SessionConfig},
    uploader::{CancelHandle, UploadConfig, UploadPhase, chunk_spans},
};
