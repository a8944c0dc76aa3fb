//! Wire protocol: command encoding, event decoding, revision profiles.

pub mod command;
pub mod event;
pub mod revision;

// Re-export common types
pub use command::{CHUNK_HEADER_LEN, CommandPacket};
pub use event::{Event, StatusReport};
pub use revision::{CommandSet, ProtocolRevision};
