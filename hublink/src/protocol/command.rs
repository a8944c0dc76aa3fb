//! Outbound command packet encoding.
//!
//! All commands written to the hub's command characteristic share one of
//! three fixed layouts:
//!
//! ```text
//! Bare command:    +--------+
//!                  | opcode |
//!                  +--------+
//!                  | 1 byte |
//!                  +--------+
//!
//! Sized command:   +--------+----------------+
//!                  | opcode | u32 (LE) value |
//!                  +--------+----------------+
//!                  | 1 byte |    4 bytes     |
//!                  +--------+----------------+
//!
//! Chunk write:     +--------+-----------------+-----------+
//!                  | opcode | u32 (LE) offset |  payload  |
//!                  +--------+-----------------+-----------+
//!                  | 1 byte |     4 bytes     | variable  |
//!                  +--------+-----------------+-----------+
//! ```

use crate::protocol::revision::ProtocolRevision;
use byteorder::{LittleEndian, WriteBytesExt};

/// Bytes of header in a chunk packet: opcode plus little-endian offset.
pub const CHUNK_HEADER_LEN: usize = 5;

/// Command packet builder.
///
/// Opcode numbers are taken from the [`ProtocolRevision`] the link was
/// established with, never hard-coded at call sites.
#[derive(Debug)]
pub struct CommandPacket {
    opcode: u8,
    data: Vec<u8>,
}

impl CommandPacket {
    fn new(opcode: u8) -> Self {
        Self {
            opcode,
            data: Vec::new(),
        }
    }

    /// Build a stop-program command.
    pub fn stop_program(revision: ProtocolRevision) -> Self {
        Self::new(revision.commands().stop_program)
    }

    /// Build a start-program command.
    pub fn start_program(revision: ProtocolRevision) -> Self {
        Self::new(revision.commands().start_program)
    }

    /// Build a start-REPL command.
    pub fn start_repl(revision: ProtocolRevision) -> Self {
        Self::new(revision.commands().start_repl)
    }

    /// Build a size-announcement command.
    ///
    /// `size` must equal the exact byte count of the transfer that follows.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn declare_size(revision: ProtocolRevision, size: u32) -> Self {
        let mut packet = Self::new(revision.commands().write_program_meta);
        packet.data.write_u32::<LittleEndian>(size).unwrap();
        packet
    }

    /// Build a chunk-write command.
    ///
    /// Caller guarantees `CHUNK_HEADER_LEN + data.len()` does not exceed the
    /// negotiated maximum write size.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn chunk(revision: ProtocolRevision, offset: u32, data: &[u8]) -> Self {
        let mut packet = Self::new(revision.commands().write_program_ram);
        packet.data.reserve(4 + data.len());
        packet.data.write_u32::<LittleEndian>(offset).unwrap();
        packet.data.extend_from_slice(data);
        packet
    }

    /// Build a stdin-write command.
    pub fn write_stdin(revision: ProtocolRevision, bytes: &[u8]) -> Self {
        let mut packet = Self::new(revision.commands().write_stdin);
        packet.data.extend_from_slice(bytes);
        packet
    }

    /// Build the complete packet bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Get the packet opcode.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }
}
