//! Capability negotiation.
//!
//! Hubs expose a read-only capability record describing their transfer
//! limits:
//!
//! ```text
//! +---------------------+----------------+--------------------------+
//! | u16 max write size  | u32 feature    | u32 max program size     |
//! | (bytes per write,   | flags          | (bytes)                  |
//! |  header included)   |                |                          |
//! +---------------------+----------------+--------------------------+
//! |       2 bytes       |    4 bytes     |         4 bytes          |
//! +---------------------+----------------+--------------------------+
//! ```
//!
//! All fields little-endian. Older firmware does not expose the record at
//! all; negotiation then falls back to limits conservative enough for any
//! revision. Negotiation happens exactly once per link, immediately after
//! the notification subscription is in place.

use crate::protocol::CHUNK_HEADER_LEN;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

/// Write size assumed when the hub does not declare one.
///
/// The minimum BLE attribute payload every peripheral supports.
pub const DEFAULT_MAX_WRITE_SIZE: usize = 20;

/// Size of a complete capability record.
pub const CAPABILITY_RECORD_LEN: usize = 10;

/// Feature flag: hub firmware includes an interactive REPL.
pub const FEATURE_REPL: u32 = 1 << 0;

/// Feature flag: hub accepts the multi-file program format.
pub const FEATURE_MULTI_FILE_PROGRAM: u32 = 1 << 1;

/// Immutable per-link snapshot of the hub's declared transfer limits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Capabilities {
    /// Maximum bytes in a single characteristic write, protocol header
    /// included.
    pub max_write_size: usize,
    /// Raw feature flag word.
    pub flags: u32,
    /// Maximum accepted program size in bytes. `None` when unbounded or
    /// undeclared.
    pub max_program_size: Option<u32>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::conservative()
    }
}

impl Capabilities {
    /// The fallback limits used when no capability record is available.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            flags: 0,
            max_program_size: None,
        }
    }

    /// Parse a capability record. Returns `None` if the record is shorter
    /// than the fixed layout requires.
    pub fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < CAPABILITY_RECORD_LEN {
            return None;
        }

        let max_write_size = usize::from(LittleEndian::read_u16(&record[0..2]));
        let flags = LittleEndian::read_u32(&record[2..6]);
        let max_program = LittleEndian::read_u32(&record[6..10]);

        Some(Self {
            max_write_size,
            flags,
            // A zero limit means the hub did not fill the field in
            max_program_size: (max_program > 0).then_some(max_program),
        })
    }

    /// Negotiate capabilities from an optional raw record read.
    ///
    /// Absent or malformed records degrade to [`Capabilities::conservative`]
    /// rather than failing the connection.
    pub fn negotiate(record: Option<&[u8]>) -> Self {
        match record {
            Some(raw) => match Self::parse(raw) {
                Some(caps) => {
                    debug!(
                        "Hub capabilities: max write {} bytes, max program {:?}, flags {:#010x}",
                        caps.max_write_size, caps.max_program_size, caps.flags
                    );
                    caps
                },
                None => {
                    warn!(
                        "Capability record is {} bytes, expected {CAPABILITY_RECORD_LEN}; \
                         using conservative defaults",
                        raw.len()
                    );
                    Self::conservative()
                },
            },
            None => {
                debug!("Hub exposes no capability record; using conservative defaults");
                Self::conservative()
            },
        }
    }

    /// Maximum chunk payload bytes that fit one write next to the header.
    pub fn max_chunk_payload(&self) -> usize {
        self.max_write_size.saturating_sub(CHUNK_HEADER_LEN).max(1)
    }

    /// Whether the hub firmware includes an interactive REPL.
    pub fn has_repl(&self) -> bool {
        self.flags & FEATURE_REPL != 0
    }

    /// Whether the hub accepts the multi-file program format.
    pub fn has_multi_file_program(&self) -> bool {
        self.flags & FEATURE_MULTI_FILE_PROGRAM != 0
    }
}
