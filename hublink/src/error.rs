//! Error types for hublink.

use crate::uploader::UploadPhase;
use thiserror::Error;

/// Result type for hublink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hublink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bluetooth transport error.
    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The user dismissed the hub chooser. Informational, not a failure.
    #[error("hub selection cancelled")]
    DiscoveryCancelled,

    /// No hub matching the discovery criteria was found in time.
    #[error("no matching hub found")]
    HubNotFound,

    /// An operation required a live link but none exists.
    #[error("no live link to a hub")]
    LinkUnavailable,

    /// The hub dropped the link while an operation was in flight.
    #[error("link to the hub was dropped")]
    LinkDropped,

    /// A second transfer was requested while one is active on the same link.
    #[error("a transfer is already in progress on this link")]
    TransferInProgress,

    /// The program image exceeds the hub's declared limit.
    #[error("program is {size} bytes but the hub accepts at most {max}")]
    ProgramTooLarge {
        /// Size of the program image in bytes.
        size: usize,
        /// Maximum program size the hub accepts.
        max: u32,
    },

    /// The caller cancelled the transfer.
    #[error("upload cancelled")]
    Cancelled,

    /// A transfer failed, annotated with the phase it failed in.
    #[error("upload failed while {phase}: {source}")]
    Upload {
        /// Phase the transfer was in when the failure occurred.
        phase: UploadPhase,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A single packet write did not complete.
    #[error("transport write failed: {0}")]
    TransportWrite(String),

    /// The peripheral violated the protocol (missing characteristic, ...).
    #[error("protocol error: {0}")]
    Protocol(String),
}
