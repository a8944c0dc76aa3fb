//! Upload state-machine tests over a scripted mock channel.
//!
//! These tests drive the full session + transfer engine against a channel
//! that records every packet and can inject write failures, link drops, and
//! inbound notifications. Clocks are paused, so settle delays cost no wall
//! time.

use async_trait::async_trait;
use hublink::output::OutputDemux;
use hublink::{
    Capabilities, CancelHandle, Channel, ChannelEvent, ConsoleSink, Error, EventReceiver,
    HubSession, LinkState, LogRecord, ProgramImage, ProtocolRevision, Result, SessionConfig,
    UploadPhase,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const OP_STOP: u8 = 0x00;
const OP_START: u8 = 0x01;
const OP_DECLARE: u8 = 0x03;
const OP_CHUNK: u8 = 0x04;

/// A capability record declaring a 10-byte write size (5 payload bytes per
/// chunk) and no program size limit.
const SMALL_WRITE_RECORD: [u8; 10] = [0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Scripted behavior for one mock connection.
#[derive(Default)]
struct Behavior {
    capability_record: Option<Vec<u8>>,
    /// Fail every write once this many packets have been accepted.
    fail_writes_after: Option<usize>,
    /// Queue a link drop once this many packets have been accepted.
    drop_link_after: Option<usize>,
}

/// Mock channel recording every packet written to it.
struct MockChannel {
    behavior: Behavior,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
}

impl MockChannel {
    fn record(&self, packet: &[u8]) -> Result<()> {
        let mut writes = self.writes.lock().unwrap();
        if let Some(limit) = self.behavior.fail_writes_after {
            if writes.len() >= limit {
                return Err(Error::TransportWrite("injected write failure".into()));
            }
        }
        writes.push(packet.to_vec());
        if self.behavior.drop_link_after == Some(writes.len()) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        "mock-hub"
    }

    async fn write_acked(&self, packet: &[u8]) -> Result<()> {
        self.record(packet)
    }

    async fn write_unacked(&self, packet: &[u8]) -> Result<()> {
        self.record(packet)
    }

    async fn read_capability_record(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.behavior.capability_record.clone())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Closed);
        }
        Ok(())
    }
}

/// Console sink capturing records for assertions.
#[derive(Default)]
struct CaptureConsole {
    lines: Mutex<Vec<String>>,
}

impl ConsoleSink for CaptureConsole {
    fn log(&self, record: LogRecord) {
        self.lines.lock().unwrap().push(record.text);
    }
}

struct Harness {
    session: Arc<HubSession<MockChannel>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    console: Arc<CaptureConsole>,
}

impl Harness {
    fn packets(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    fn opcodes(&self) -> Vec<u8> {
        self.packets().iter().map(|p| p[0]).collect()
    }
}

async fn connect(behavior: Behavior, config: SessionConfig) -> Harness {
    let (tx, rx): (_, EventReceiver) = mpsc::unbounded_channel();
    let writes = Arc::new(Mutex::new(Vec::new()));
    let channel = MockChannel {
        behavior,
        writes: Arc::clone(&writes),
        events: tx.clone(),
        closed: AtomicBool::new(false),
    };
    let console = Arc::new(CaptureConsole::default());
    let session = HubSession::establish(channel, rx, console.clone(), config)
        .await
        .expect("establish");
    Harness {
        session: Arc::new(session),
        writes,
        events: tx,
        console,
    }
}

async fn connect_default(behavior: Behavior) -> Harness {
    connect(behavior, SessionConfig::default()).await
}

fn small_write_behavior() -> Behavior {
    Behavior {
        capability_record: Some(SMALL_WRITE_RECORD.to_vec()),
        ..Behavior::default()
    }
}

#[tokio::test(start_paused = true)]
async fn upload_packet_sequence() {
    // 7 bytes at a 10-byte write size: 5-byte header leaves 5 bytes per
    // chunk, so exactly (0, 5) then (5, 2).
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_source("abcdefg");

    h.session.run_program(&image, |_, _| {}).await.unwrap();

    let packets = h.packets();
    assert_eq!(h.opcodes(), vec![OP_STOP, OP_DECLARE, OP_CHUNK, OP_CHUNK, OP_START]);

    // Declared size carries the exact byte length
    assert_eq!(&packets[1][1..5], &[7, 0, 0, 0]);

    // Chunk offsets little-endian, contiguous, covering [0, 7)
    assert_eq!(&packets[2][1..5], &[0, 0, 0, 0]);
    assert_eq!(&packets[2][5..], b"abcde");
    assert_eq!(&packets[3][1..5], &[5, 0, 0, 0]);
    assert_eq!(&packets[3][5..], b"fg");

    // No packet exceeds the negotiated write size
    for packet in &packets {
        assert!(packet.len() <= 10, "packet of {} bytes", packet.len());
    }
}

#[tokio::test(start_paused = true)]
async fn declared_size_reflects_normalized_source() {
    let h = connect_default(small_write_behavior()).await;
    // CRLF collapses to LF before the length is computed
    let image = ProgramImage::from_source("a\r\nb");
    assert_eq!(image.len(), 3);

    h.session.run_program(&image, |_, _| {}).await.unwrap();
    assert_eq!(&h.packets()[1][1..5], &[3, 0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn progress_is_contiguous_and_complete() {
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_bytes(vec![0x42; 12]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    h.session
        .run_program(&image, move |sent, total| {
            seen2.lock().unwrap().push((sent, total));
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(5, 12), (10, 12), (12, 12)]);
}

#[tokio::test(start_paused = true)]
async fn empty_program_declares_zero_and_starts() {
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_source("");

    h.session.run_program(&image, |_, _| {}).await.unwrap();
    assert_eq!(h.opcodes(), vec![OP_STOP, OP_DECLARE, OP_START]);
    assert_eq!(&h.packets()[1][1..5], &[0, 0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn commit_revision_reannounces_size_before_start() {
    let config = SessionConfig {
        revision: ProtocolRevision::V2,
        ..SessionConfig::default()
    };
    let h = connect(small_write_behavior(), config).await;
    let image = ProgramImage::from_source("abcdefg");

    h.session.run_program(&image, |_, _| {}).await.unwrap();

    assert_eq!(
        h.opcodes(),
        vec![OP_STOP, OP_DECLARE, OP_CHUNK, OP_CHUNK, OP_DECLARE, OP_START]
    );
    // The commit re-announces the same size
    assert_eq!(h.packets()[4], h.packets()[1]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_upload_never_starts() {
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_source("abcdefg");

    let cancel: CancelHandle = h.session.cancel_handle();
    let result = h
        .session
        .run_program(&image, move |sent, _| {
            if sent >= 5 {
                cancel.cancel();
            }
        })
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    let opcodes = h.opcodes();
    assert!(!opcodes.contains(&OP_START), "start issued after cancel: {opcodes:?}");
    // The engine honors the cancel with an immediate stop
    assert_eq!(opcodes.last(), Some(&OP_STOP));
}

#[tokio::test(start_paused = true)]
async fn stop_during_upload_routes_through_cancellation() {
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_bytes(vec![0x11; 200]);

    let session = Arc::clone(&h.session);
    let upload = tokio::spawn(async move { session.run_program(&image, |_, _| {}).await });

    // Let the upload reach the chunk loop, then ask for a stop
    tokio::time::sleep(Duration::from_millis(350)).await;
    h.session.stop_program().await.unwrap();

    let result = upload.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!h.opcodes().contains(&OP_START));
}

#[tokio::test(start_paused = true)]
async fn link_drop_stops_chunk_writes() {
    // Drop the link right after the first chunk write is accepted
    let behavior = Behavior {
        capability_record: Some(SMALL_WRITE_RECORD.to_vec()),
        drop_link_after: Some(3),
        ..Behavior::default()
    };
    let h = connect_default(behavior).await;
    let image = ProgramImage::from_bytes(vec![0x33; 25]);

    let mut state = h.session.link_state();
    let result = h.session.run_program(&image, |_, _| {}).await;

    match result {
        Err(Error::Upload { phase, source }) => {
            assert_eq!(phase, UploadPhase::Uploading);
            assert!(matches!(*source, Error::LinkDropped));
        },
        other => panic!("expected upload failure, got {other:?}"),
    }

    // stop + declare + one chunk, nothing after the drop
    assert_eq!(h.packets().len(), 3);

    state.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
    assert!(!h.session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn write_failure_reports_declaring_phase() {
    let behavior = Behavior {
        capability_record: Some(SMALL_WRITE_RECORD.to_vec()),
        fail_writes_after: Some(1),
        ..Behavior::default()
    };
    let h = connect_default(behavior).await;
    let image = ProgramImage::from_source("abcdefg");

    let result = h.session.run_program(&image, |_, _| {}).await;
    match result {
        Err(Error::Upload { phase, source }) => {
            assert_eq!(phase, UploadPhase::DeclaringSize);
            assert!(matches!(*source, Error::TransportWrite(_)));
        },
        other => panic!("expected upload failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn second_transfer_is_rejected_while_one_runs() {
    let h = connect_default(small_write_behavior()).await;
    let image = ProgramImage::from_bytes(vec![0x22; 40]);

    let session = Arc::clone(&h.session);
    let first = tokio::spawn(async move { session.run_program(&image, |_, _| {}).await });
    tokio::task::yield_now().await;

    let second = h
        .session
        .run_program(&ProgramImage::from_source("x"), |_, _| {})
        .await;
    assert!(matches!(second, Err(Error::TransferInProgress)));

    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_capability_record_falls_back() {
    let behavior = Behavior {
        capability_record: Some(vec![0x01, 0x02, 0x03, 0x04]),
        ..Behavior::default()
    };
    let h = connect_default(behavior).await;
    assert_eq!(h.session.capabilities().max_write_size, 20);
    assert_eq!(h.session.capabilities().max_program_size, None);
}

#[tokio::test(start_paused = true)]
async fn absent_capability_record_falls_back() {
    let h = connect_default(Behavior::default()).await;
    assert_eq!(h.session.capabilities(), &Capabilities::conservative());
}

#[tokio::test(start_paused = true)]
async fn full_capability_record_is_honored() {
    let behavior = Behavior {
        capability_record: Some(vec![
            0x9D, 0x00, // max write 157
            0x01, 0x00, 0x00, 0x00, // flags: REPL
            0x00, 0x7E, 0x00, 0x00, // max program 0x7E00
        ]),
        ..Behavior::default()
    };
    let h = connect_default(behavior).await;
    let caps = h.session.capabilities();
    assert_eq!(caps.max_write_size, 157);
    assert_eq!(caps.max_program_size, Some(0x7E00));
    assert!(caps.has_repl());
}

#[tokio::test(start_paused = true)]
async fn oversized_program_is_rejected_before_any_write() {
    let behavior = Behavior {
        capability_record: Some(vec![
            0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
        ]),
        ..Behavior::default()
    };
    let h = connect_default(behavior).await;
    let result = h
        .session
        .run_program(&ProgramImage::from_source("abcdefg"), |_, _| {})
        .await;

    assert!(matches!(result, Err(Error::ProgramTooLarge { size: 7, max: 4 })));
    assert!(h.packets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stdout_notifications_reach_the_console() {
    let h = connect_default(Behavior::default()).await;

    h.events
        .send(ChannelEvent::Notification(vec![0x01, b'H', b'I', b'\n']))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(*h.console.lines.lock().unwrap(), vec!["HI"]);
}

#[tokio::test(start_paused = true)]
async fn status_notifications_reach_the_watcher() {
    let h = connect_default(Behavior::default()).await;
    let mut status = h.session.status();

    h.events
        .send(ChannelEvent::Notification(vec![0x00, 0x40, 0x00, 0x00, 0x00]))
        .unwrap();

    status.changed().await.unwrap();
    assert!(status.borrow().unwrap().program_running());
}

#[tokio::test(start_paused = true)]
async fn upload_after_disconnect_is_link_unavailable() {
    let h = connect_default(small_write_behavior()).await;
    h.session.disconnect().await.unwrap();
    // Idempotent
    h.session.disconnect().await.unwrap();

    let result = h
        .session
        .run_program(&ProgramImage::from_source("x"), |_, _| {})
        .await;
    assert!(matches!(result, Err(Error::LinkUnavailable)));
    assert!(h.packets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn demux_is_reusable_standalone() {
    // The demultiplexer itself carries no session state
    let console = Arc::new(CaptureConsole::default());
    let (tx, _rx) = tokio::sync::watch::channel(None);
    let mut demux = OutputDemux::new(console.clone(), tx);
    demux.handle_notification(&[0x01, b'o', b'k', b'\n']);
    assert_eq!(*console.lines.lock().unwrap(), vec!["ok"]);
}
