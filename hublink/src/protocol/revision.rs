//! Protocol revision profiles.
//!
//! Hub firmware revisions differ in small but load-bearing ways: which
//! command opcodes they understand and whether an upload must be committed
//! (size re-announced) before it survives in storage. Instead of hard-coding
//! one revision, the rest of the crate reaches opcode numbers and phase
//! behavior only through a [`ProtocolRevision`], so a new firmware variant is
//! a new profile entry rather than a code fork.

use std::fmt;

/// Command opcode assignments for one protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    /// Stop the running user program.
    pub stop_program: u8,
    /// Start the stored user program.
    pub start_program: u8,
    /// Start the interactive REPL (firmware with the REPL feature flag).
    pub start_repl: u8,
    /// Announce the size of an upcoming program transfer.
    pub write_program_meta: u8,
    /// Write one offset-addressed chunk of program data.
    pub write_program_ram: u8,
    /// Feed bytes to the running program's standard input.
    pub write_stdin: u8,
}

/// Opcode table shared by all currently known hub firmware.
const STANDARD_COMMANDS: CommandSet = CommandSet {
    stop_program: 0x00,
    start_program: 0x01,
    start_repl: 0x02,
    write_program_meta: 0x03,
    write_program_ram: 0x04,
    write_stdin: 0x06,
};

/// Known protocol revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolRevision {
    /// Base revision: uploaded bytes are runnable as soon as received.
    #[default]
    V1,
    /// Revision that separates "received into RAM" from "persisted": the
    /// size announcement must be repeated after the last chunk to commit.
    V2,
}

impl ProtocolRevision {
    /// Get the command opcode table for this revision.
    #[must_use]
    pub fn commands(self) -> &'static CommandSet {
        // Both revisions currently share the standard table; they differ in
        // the commit phase.
        &STANDARD_COMMANDS
    }

    /// Whether the size announcement must be repeated after the last chunk.
    #[must_use]
    pub fn commit_after_upload(self) -> bool {
        matches!(self, Self::V2)
    }

    /// Get the revision from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "v1" | "1" => Some(Self::V1),
            "v2" | "2" => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_opcodes() {
        let cmds = ProtocolRevision::V1.commands();
        assert_eq!(cmds.stop_program, 0x00);
        assert_eq!(cmds.start_program, 0x01);
        assert_eq!(cmds.write_program_meta, 0x03);
        assert_eq!(cmds.write_program_ram, 0x04);
    }

    #[test]
    fn test_commit_is_revision_gated() {
        assert!(!ProtocolRevision::V1.commit_after_upload());
        assert!(ProtocolRevision::V2.commit_after_upload());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ProtocolRevision::from_name("v1"), Some(ProtocolRevision::V1));
        assert_eq!(ProtocolRevision::from_name("V2"), Some(ProtocolRevision::V2));
        assert_eq!(ProtocolRevision::from_name("v9"), None);
    }
}
