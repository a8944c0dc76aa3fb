//! Hub session: link lifecycle, negotiation, and event routing.
//!
//! A [`HubSession`] owns one link to one hub. It is created over an already
//! opened [`Channel`], negotiates capabilities exactly once, then runs a
//! single pump task that drains the channel's ordered event queue for the
//! rest of the link's life. All link state lives in the session object;
//! there is no module-level current-link or handler registration.

use crate::capabilities::Capabilities;
use crate::channel::{Channel, ChannelEvent, EventReceiver};
use crate::error::{Error, Result};
use crate::image::ProgramImage;
use crate::output::{ConsoleSink, OutputDemux};
use crate::protocol::{CommandPacket, ProtocolRevision, StatusReport};
use crate::uploader::{CancelHandle, UploadConfig, Uploader};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connection state of a link, published for UI binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// Discovery/connection in progress.
    Connecting,
    /// Link established and negotiated.
    Connected,
    /// Teardown in progress.
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Protocol revision to speak. Never inferred from the hub.
    pub revision: ProtocolRevision,
    /// Transfer timing.
    pub upload: UploadConfig,
}

/// Resets the single-transfer guard when an upload ends, however it ends.
struct TransferGuard<'a>(&'a AtomicBool);

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One established link to one hub.
pub struct HubSession<C: Channel> {
    channel: Arc<C>,
    caps: Capabilities,
    config: SessionConfig,
    state_tx: watch::Sender<LinkState>,
    status_rx: watch::Receiver<Option<StatusReport>>,
    link_alive: Arc<AtomicBool>,
    transfer_active: Arc<AtomicBool>,
    cancel: CancelHandle,
    pump: JoinHandle<()>,
}

impl<C: Channel> HubSession<C> {
    /// Build a session over an opened channel and its event queue.
    ///
    /// Negotiates capabilities, then spawns the notification pump. On any
    /// failure the channel is closed before returning: a session either
    /// exists fully connected or not at all.
    pub async fn establish(
        channel: C,
        events: EventReceiver,
        console: Arc<dyn ConsoleSink>,
        config: SessionConfig,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let (status_tx, status_rx) = watch::channel(None);

        // Negotiation happens exactly once, before any upload may proceed
        let record = match channel.read_capability_record().await {
            Ok(record) => record,
            Err(e) => {
                let _ = channel.close().await;
                let _ = state_tx.send(LinkState::Disconnected);
                return Err(e);
            },
        };
        let caps = Capabilities::negotiate(record.as_deref());

        let link_alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_events(
            events,
            OutputDemux::new(console, status_tx),
            Arc::clone(&link_alive),
            state_tx.clone(),
        ));

        let _ = state_tx.send(LinkState::Connected);
        info!("Connected to {} (protocol {})", channel.name(), config.revision);

        Ok(Self {
            channel: Arc::new(channel),
            caps,
            config,
            state_tx,
            status_rx,
            link_alive,
            transfer_active: Arc::new(AtomicBool::new(false)),
            cancel: CancelHandle::new(),
            pump,
        })
    }

    /// Name of the connected hub.
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// The capabilities negotiated for this link.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// The protocol revision this session speaks.
    pub fn revision(&self) -> ProtocolRevision {
        self.config.revision
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        self.link_alive.load(Ordering::SeqCst)
    }

    /// Subscribe to link state changes.
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to hub status reports. Ignoring this is fine.
    pub fn status(&self) -> watch::Receiver<Option<StatusReport>> {
        self.status_rx.clone()
    }

    /// Handle for cancelling an in-progress upload, e.g. from a signal
    /// handler.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Upload a program and start it.
    ///
    /// `progress` is called with `(bytes_sent, total)` after each chunk.
    /// At most one transfer may be active per link; a second call while one
    /// runs is a caller error.
    pub async fn run_program<F>(&self, image: &ProgramImage, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        if !self.is_connected() {
            return Err(Error::LinkUnavailable);
        }
        image.check_fits(&self.caps)?;

        if self.transfer_active.swap(true, Ordering::SeqCst) {
            return Err(Error::TransferInProgress);
        }
        let _guard = TransferGuard(&self.transfer_active);

        self.cancel.reset();
        let uploader = Uploader::new(
            &*self.channel,
            &self.caps,
            self.config.revision,
            &self.config.upload,
            &self.cancel,
            &self.link_alive,
        );
        uploader.run(image, &mut progress).await
    }

    /// Stop the running program.
    ///
    /// While a transfer is active this requests cancellation instead of
    /// writing concurrently with the chunk loop; the engine sends the stop
    /// itself at its next checkpoint.
    pub async fn stop_program(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::LinkUnavailable);
        }
        if self.transfer_active.load(Ordering::SeqCst) {
            debug!("Transfer active; routing stop through cancellation");
            self.cancel.cancel();
            return Ok(());
        }
        self.channel
            .write_acked(&CommandPacket::stop_program(self.config.revision).build())
            .await
    }

    /// Start the hub's interactive REPL, if the firmware has one.
    pub async fn start_repl(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::LinkUnavailable);
        }
        if !self.caps.has_repl() {
            return Err(Error::Protocol("hub firmware has no REPL".into()));
        }
        self.channel
            .write_acked(&CommandPacket::start_repl(self.config.revision).build())
            .await
    }

    /// Feed bytes to the running program's standard input.
    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::LinkUnavailable);
        }
        self.channel
            .write_acked(&CommandPacket::write_stdin(self.config.revision, bytes).build())
            .await
    }

    /// Tear the link down. Idempotent; safe to call when already gone.
    pub async fn disconnect(&self) -> Result<()> {
        if *self.state_tx.borrow() == LinkState::Disconnected {
            return Ok(());
        }
        let _ = self.state_tx.send(LinkState::Disconnecting);
        // Mark the link dead first so the pump treats the close as ours,
        // not as a hub-initiated drop
        self.link_alive.store(false, Ordering::SeqCst);
        let result = self.channel.close().await;
        let _ = self.state_tx.send(LinkState::Disconnected);
        info!("Disconnected from {}", self.channel.name());
        result
    }
}

impl<C: Channel> Drop for HubSession<C> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// The single consumer of a link's inbound event queue.
async fn pump_events(
    mut events: EventReceiver,
    mut demux: OutputDemux,
    link_alive: Arc<AtomicBool>,
    state_tx: watch::Sender<LinkState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Notification(raw) => demux.handle_notification(&raw),
            ChannelEvent::Closed => break,
        }
    }
    demux.flush();

    // swap() distinguishes a hub-initiated drop from our own teardown
    if link_alive.swap(false, Ordering::SeqCst) {
        warn!("Link dropped by the hub");
    }
    let _ = state_tx.send(LinkState::Disconnected);
}

#[cfg(feature = "ble")]
mod ble_impl {
    use super::{Arc, ConsoleSink, HubSession, Result, SessionConfig};
    use crate::channel::ble::{BleChannel, BleOptions};

    impl HubSession<BleChannel> {
        /// Discover a hub over BLE and establish a session with it.
        ///
        /// This is the convenience entry point for native applications;
        /// [`HubSession::establish`] accepts any channel.
        pub async fn connect(
            options: &BleOptions,
            console: Arc<dyn ConsoleSink>,
            config: SessionConfig,
        ) -> Result<Self> {
            let (channel, events) = BleChannel::connect(options).await?;
            Self::establish(channel, events, console, config).await
        }
    }
}
