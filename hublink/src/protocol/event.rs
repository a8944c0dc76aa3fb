//! Inbound event decoding.
//!
//! The hub multiplexes everything it has to say over a single notification
//! stream. Each notification is one event: a tag byte followed by the event
//! payload. Unknown tags decode to [`Event::Unrecognized`] instead of
//! failing, so newer hub firmware does not break older clients.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

/// Event tag: hub status report.
pub const EVENT_STATUS_REPORT: u8 = 0x00;

/// Event tag: user program standard output.
pub const EVENT_WRITE_STDOUT: u8 = 0x01;

/// One decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Hub status flags changed.
    Status(StatusReport),
    /// A fragment of the running program's standard output.
    Stdout(Vec<u8>),
    /// An event tag this client does not know. Tolerated, never an error.
    Unrecognized {
        /// The unknown tag byte.
        tag: u8,
        /// The raw event payload.
        payload: Vec<u8>,
    },
}

impl Event {
    /// Decode one notification payload.
    ///
    /// Returns `None` only for an empty notification, which carries no event.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let (&tag, payload) = raw.split_first()?;
        let event = match tag {
            EVENT_STATUS_REPORT => Self::Status(StatusReport::from_payload(payload)),
            EVENT_WRITE_STDOUT => Self::Stdout(payload.to_vec()),
            _ => {
                trace!("Unrecognized event tag 0x{tag:02X} ({} bytes)", payload.len());
                Self::Unrecognized {
                    tag,
                    payload: payload.to_vec(),
                }
            },
        };
        Some(event)
    }
}

/// Hub status flag word, reported whenever a flag changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    /// Raw flag word.
    pub flags: u32,
}

impl StatusReport {
    /// Battery voltage is low.
    pub const BATTERY_LOW_WARNING: u32 = 1 << 0;
    /// Battery voltage is critically low, shutdown imminent.
    pub const BATTERY_LOW_SHUTDOWN: u32 = 1 << 1;
    /// Battery current is too high.
    pub const BATTERY_HIGH_CURRENT: u32 = 1 << 2;
    /// Hub is advertising over BLE.
    pub const BLE_ADVERTISING: u32 = 1 << 3;
    /// BLE signal to the connected host is weak.
    pub const BLE_LOW_SIGNAL: u32 = 1 << 4;
    /// The power button is currently pressed.
    pub const POWER_BUTTON_PRESSED: u32 = 1 << 5;
    /// A user program is running.
    pub const PROGRAM_RUNNING: u32 = 1 << 6;
    /// The hub is about to shut down.
    pub const SHUTDOWN_REQUESTED: u32 = 1 << 7;

    /// Decode the status payload.
    ///
    /// The flag word is little-endian; short payloads are zero-extended
    /// rather than rejected.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut word = [0u8; 4];
        let n = payload.len().min(4);
        word[..n].copy_from_slice(&payload[..n]);
        Self {
            flags: LittleEndian::read_u32(&word),
        }
    }

    /// Check whether a flag mask is set.
    pub fn contains(&self, mask: u32) -> bool {
        self.flags & mask != 0
    }

    /// Whether a user program is currently running.
    pub fn program_running(&self) -> bool {
        self.contains(Self::PROGRAM_RUNNING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stdout_event() {
        // [0x01, 'H', 'I'] is a stdout event carrying the text "HI"
        let event = Event::decode(&[0x01, 0x48, 0x49]).unwrap();
        assert_eq!(event, Event::Stdout(b"HI".to_vec()));
    }

    #[test]
    fn test_decode_status_event() {
        let event = Event::decode(&[0x00, 0x40, 0x00, 0x00, 0x00]).unwrap();
        match event {
            Event::Status(report) => assert!(report.program_running()),
            other => panic!("Expected status event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_tag_is_tolerated() {
        let event = Event::decode(&[0x7E, 0x01, 0x02]).unwrap();
        assert_eq!(
            event,
            Event::Unrecognized {
                tag: 0x7E,
                payload: vec![0x01, 0x02],
            }
        );
    }

    #[test]
    fn test_decode_empty_notification() {
        assert_eq!(Event::decode(&[]), None);
    }

    #[test]
    fn test_status_short_payload_zero_extended() {
        let report = StatusReport::from_payload(&[0x41]);
        assert!(report.contains(StatusReport::BATTERY_LOW_WARNING));
        assert!(report.program_running());
    }

    #[test]
    fn test_status_little_endian_word() {
        let report = StatusReport::from_payload(&[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(report.flags, 0x100);
    }
}
