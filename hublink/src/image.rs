//! Program image handling.

use crate::capabilities::Capabilities;
use crate::error::{Error, Result};

/// An immutable program image, frozen at the moment an upload begins.
///
/// Line endings are normalized (CRLF to LF) at construction, before the byte
/// length is ever observed: the size announced to the hub must equal the
/// transmitted byte count exactly, so normalization cannot happen later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    bytes: Vec<u8>,
}

impl ProgramImage {
    /// Create an image from program source text, normalizing line endings.
    pub fn from_source(source: &str) -> Self {
        Self {
            bytes: source.replace("\r\n", "\n").into_bytes(),
        }
    }

    /// Create an image from raw bytes, taken verbatim.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Byte length of the image. This is the size declared to the hub.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Check that the image fits the hub's declared program size limit.
    pub fn check_fits(&self, caps: &Capabilities) -> Result<()> {
        let max = caps.max_program_size.unwrap_or(u32::MAX);
        if self.bytes.len() > max as usize {
            return Err(Error::ProgramTooLarge {
                size: self.bytes.len(),
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_normalized_before_length() {
        let image = ProgramImage::from_source("print(1)\r\nprint(2)\r\n");
        assert_eq!(image.as_bytes(), b"print(1)\nprint(2)\n");
        assert_eq!(image.len(), 18);
    }

    #[test]
    fn test_lf_source_unchanged() {
        let image = ProgramImage::from_source("print(1)\n");
        assert_eq!(image.as_bytes(), b"print(1)\n");
    }

    #[test]
    fn test_raw_bytes_taken_verbatim() {
        let image = ProgramImage::from_bytes(b"a\r\nb".to_vec());
        assert_eq!(image.as_bytes(), b"a\r\nb");
    }

    #[test]
    fn test_fits_unbounded_limit() {
        let caps = Capabilities::conservative();
        let image = ProgramImage::from_source("print(1)");
        assert!(image.check_fits(&caps).is_ok());
    }

    #[test]
    fn test_too_large_rejected() {
        let caps = Capabilities {
            max_write_size: 20,
            flags: 0,
            max_program_size: Some(4),
        };
        let image = ProgramImage::from_source("print(1)");
        match image.check_fits(&caps) {
            Err(Error::ProgramTooLarge { size: 8, max: 4 }) => {},
            other => panic!("Expected ProgramTooLarge, got {other:?}"),
        }
    }
}
