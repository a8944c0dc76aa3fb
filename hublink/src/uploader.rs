//! Program transfer engine.
//!
//! The engine sequences one upload over an established link:
//!
//! ```text
//! Stopping -> DeclaringSize -> Uploading -> [Committing] -> Starting
//! ```
//!
//! Each phase is a small number of awaited writes separated by settling
//! delays; the hub gives no explicit ready signal between phases, so the
//! delays are part of the protocol. All delay constants live in
//! [`UploadConfig`]. The engine never retries: any failure aborts the
//! transfer and reports the phase it happened in, and retry policy stays
//! with the caller (a fresh stop + size announcement is the recovery path).

use crate::capabilities::Capabilities;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::image::ProgramImage;
use crate::protocol::{CommandPacket, ProtocolRevision};
use log::{debug, info, trace};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// Phase of an active transfer, reported with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// Stopping any running program.
    Stopping,
    /// Announcing the transfer size.
    DeclaringSize,
    /// Writing program chunks.
    Uploading,
    /// Re-announcing the size to commit (revision-gated).
    Committing,
    /// Issuing the start command.
    Starting,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopping => write!(f, "stopping the running program"),
            Self::DeclaringSize => write!(f, "declaring the program size"),
            Self::Uploading => write!(f, "writing program data"),
            Self::Committing => write!(f, "committing the program"),
            Self::Starting => write!(f, "starting the program"),
        }
    }
}

/// Transfer timing configuration.
///
/// The defaults are minimums validated against real hubs; writes issued
/// before a settling delay elapses are silently dropped by the transport,
/// so lower them only with hardware in hand.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Pause after the stop command, letting the hub release the stopped
    /// program's resources.
    pub stop_settle: Duration,
    /// Pause after the size announcement, letting the hub prepare its
    /// receive buffer. Applied unconditionally; some revisions need it and
    /// none signal readiness.
    pub meta_settle: Duration,
    /// Pause between chunk writes, keeping the transport's outstanding
    /// write queue from saturating.
    pub chunk_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            stop_settle: Duration::from_millis(200),
            meta_settle: Duration::from_millis(100),
            chunk_delay: Duration::from_millis(5),
        }
    }
}

/// Handle for cancelling an in-progress upload.
///
/// Cancellation is cooperative: the engine checks between chunk writes and
/// after delays, never mid-write. On cancellation the engine sends a stop
/// command, discards the transfer, and returns [`Error::Cancelled`]; no
/// start command is ever issued afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create a fresh, un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the transfer watching this handle.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Plan the chunk layout for a transfer.
///
/// Returns `(offset, length)` pairs that are strictly increasing,
/// contiguous, and cover `[0, total)` exactly. `max_payload` is the data
/// budget per chunk after the packet header.
#[allow(clippy::cast_possible_truncation)] // offsets are size-checked against u32 upstream
pub fn chunk_spans(total: usize, max_payload: usize) -> Vec<(u32, usize)> {
    debug_assert!(max_payload > 0);
    let mut spans = Vec::with_capacity(total.div_ceil(max_payload.max(1)));
    let mut offset = 0;
    while offset < total {
        let len = max_payload.min(total - offset);
        // Offsets fit u32: images are size-checked before planning
        spans.push((offset as u32, len));
        offset += len;
    }
    spans
}

/// One upload attempt over a borrowed channel.
///
/// Transient by design: constructed per transfer, dropped on completion or
/// failure.
pub(crate) struct Uploader<'a, C: Channel> {
    channel: &'a C,
    caps: &'a Capabilities,
    revision: ProtocolRevision,
    config: &'a UploadConfig,
    cancel: &'a CancelHandle,
    link_alive: &'a AtomicBool,
}

impl<'a, C: Channel> Uploader<'a, C> {
    pub(crate) fn new(
        channel: &'a C,
        caps: &'a Capabilities,
        revision: ProtocolRevision,
        config: &'a UploadConfig,
        cancel: &'a CancelHandle,
        link_alive: &'a AtomicBool,
    ) -> Self {
        Self {
            channel,
            caps,
            revision,
            config,
            cancel,
            link_alive,
        }
    }

    /// Run the full transfer state machine.
    pub(crate) async fn run<F>(&self, image: &ProgramImage, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let total = image.len();
        let spans = chunk_spans(total, self.caps.max_chunk_payload());
        debug!(
            "Uploading {} bytes in {} chunks of at most {} bytes payload",
            total,
            spans.len(),
            self.caps.max_chunk_payload()
        );

        // Stopping: whatever runs now must release its resources first
        self.send(UploadPhase::Stopping, &CommandPacket::stop_program(self.revision), true)
            .await?;
        sleep(self.config.stop_settle).await;
        self.checkpoint().await?;

        // DeclaringSize: the announced size is the exact transfer length
        #[allow(clippy::cast_possible_truncation)] // size-checked against u32 limits upstream
        let declared = total as u32;
        self.send(
            UploadPhase::DeclaringSize,
            &CommandPacket::declare_size(self.revision, declared),
            true,
        )
        .await?;
        sleep(self.config.meta_settle).await;
        self.checkpoint().await?;

        // Uploading: sequential, one awaited write per chunk, paced
        let mut sent = 0usize;
        for (i, &(offset, len)) in spans.iter().enumerate() {
            self.ensure_link(UploadPhase::Uploading)?;
            self.checkpoint().await?;

            let start = offset as usize;
            let packet = CommandPacket::chunk(self.revision, offset, &image.as_bytes()[start..start + len]);
            let bytes = packet.build();
            debug_assert!(bytes.len() <= self.caps.max_write_size);
            trace!("Chunk {}/{}: offset {offset}, {len} bytes", i + 1, spans.len());

            self.send(UploadPhase::Uploading, &packet, false).await?;
            sleep(self.config.chunk_delay).await;

            sent += len;
            progress(sent, total);
        }
        self.checkpoint().await?;

        // Committing: only revisions that separate receive from persist
        if self.revision.commit_after_upload() {
            self.send(
                UploadPhase::Committing,
                &CommandPacket::declare_size(self.revision, declared),
                true,
            )
            .await?;
            sleep(self.config.meta_settle).await;
            self.checkpoint().await?;
        }

        // Starting
        self.send(UploadPhase::Starting, &CommandPacket::start_program(self.revision), true)
            .await?;
        info!("Program started ({total} bytes uploaded)");

        Ok(())
    }

    /// Write one packet, mapping failure to the phase it occurred in.
    async fn send(&self, phase: UploadPhase, packet: &CommandPacket, acked: bool) -> Result<()> {
        self.ensure_link(phase)?;
        let bytes = packet.build();
        let result = if acked {
            self.channel.write_acked(&bytes).await
        } else {
            self.channel.write_unacked(&bytes).await
        };
        result.map_err(|source| Error::Upload {
            phase,
            source: Box::new(source),
        })
    }

    fn ensure_link(&self, phase: UploadPhase) -> Result<()> {
        if self.link_alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Upload {
                phase,
                source: Box::new(Error::LinkDropped),
            })
        }
    }

    /// Honor a pending cancellation: stop the hub immediately and abort.
    async fn checkpoint(&self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        debug!("Upload cancelled; sending stop");
        // Best effort: the link may already be gone
        let _ = self
            .channel
            .write_acked(&CommandPacket::stop_program(self.revision).build())
            .await;
        Err(Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHUNK_HEADER_LEN;

    #[test]
    fn test_chunks_cover_total_contiguously() {
        let spans = chunk_spans(1234, 95);
        assert_eq!(spans[0].0, 0);
        for pair in spans.windows(2) {
            // Each chunk starts where the previous one ended
            assert_eq!(pair[0].0 as usize + pair[0].1, pair[1].0 as usize);
        }
        let last = spans.last().unwrap();
        assert_eq!(last.0 as usize + last.1, 1234);
        assert_eq!(spans.iter().map(|s| s.1).sum::<usize>(), 1234);
    }

    #[test]
    fn test_no_chunk_exceeds_payload_budget() {
        for total in [0usize, 1, 5, 14, 15, 16, 1000] {
            for span in chunk_spans(total, 15) {
                assert!(span.1 <= 15);
                assert!(span.1 > 0);
            }
        }
    }

    #[test]
    fn test_seven_bytes_at_write_size_ten() {
        // max write 10 leaves 5 payload bytes per chunk after the header:
        // a 7-byte program is exactly (0, 5) then (5, 2)
        let caps = Capabilities {
            max_write_size: 10,
            flags: 0,
            max_program_size: None,
        };
        let spans = chunk_spans(7, caps.max_chunk_payload());
        assert_eq!(spans, vec![(0, 5), (5, 2)]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let spans = chunk_spans(30, 15);
        assert_eq!(spans, vec![(0, 15), (15, 15)]);
    }

    #[test]
    fn test_empty_program_plans_no_chunks() {
        assert!(chunk_spans(0, 15).is_empty());
    }

    #[test]
    fn test_reassembly_round_trip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let mut rebuilt = vec![0u8; data.len()];
        for (offset, len) in chunk_spans(data.len(), CHUNK_HEADER_LEN + 1) {
            let start = offset as usize;
            rebuilt[start..start + len].copy_from_slice(&data[start..start + len]);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_cancel_handle_round_trip() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.clone().cancel();
        assert!(handle.is_cancelled());
        handle.reset();
        assert!(!handle.is_cancelled());
    }
}
