//! Channel abstraction for hub transports.
//!
//! This module provides a unified [`Channel`] trait that separates the
//! protocol layer from the transport carrying it:
//!
//! ```text
//! +----------------------+     +----------------------+
//! |    Protocol Layer    |     |    Protocol Layer    |
//! |  (uploader, session) |     |  (uploader, session) |
//! +----------+-----------+     +----------+-----------+
//!            |                            |
//!            v                            v
//! +----------+-----------+     +----------+-----------+
//! |    Channel Trait     |     |    Channel Trait     |
//! +----------+-----------+     +----------+-----------+
//!            |                            |
//!            v                            v
//! +----------+-----------+     +----------+-----------+
//! |     BLE Channel      |     |     Mock Channel     |
//! |      (btleplug)      |     |       (tests)        |
//! +----------------------+     +----------------------+
//! ```
//!
//! Inbound traffic does not go through the trait: a backend delivers
//! [`ChannelEvent`]s on an ordered queue handed out at connection time, and
//! exactly one consumer (the session's pump loop) drains it. That keeps
//! notification ordering explicit and leaves no shared mutable callback
//! state.

#[cfg(feature = "ble")]
pub mod ble;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One item on a channel's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A notification payload, in transport delivery order.
    Notification(Vec<u8>),
    /// The link is gone: peripheral-initiated drop or local teardown.
    Closed,
}

/// Ordered inbound event queue handed out by a backend at connection time.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Sender half used by backends to feed the inbound queue.
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Unified transport trait for hub communication.
///
/// Both write flavors suspend until the local write completes; acknowledged
/// writes additionally wait for the peripheral's confirmation. The protocol
/// layer never pipelines writes on top of either.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable name of the connected peripheral.
    fn name(&self) -> &str;

    /// Write one packet, waiting for the peripheral to acknowledge it.
    async fn write_acked(&self, packet: &[u8]) -> Result<()>;

    /// Write one packet without acknowledgment.
    async fn write_unacked(&self, packet: &[u8]) -> Result<()>;

    /// Read the raw capability record, or `None` if the peripheral does not
    /// expose one (older protocol revision).
    async fn read_capability_record(&self) -> Result<Option<Vec<u8>>>;

    /// Tear the link down and release resources. Idempotent.
    async fn close(&self) -> Result<()>;
}
