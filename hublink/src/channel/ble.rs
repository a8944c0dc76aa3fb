//! BLE channel backed by btleplug.
//!
//! Hubs advertise one primary service with two characteristics: a combined
//! command/event characteristic (commands are written to it, events arrive
//! as notifications on it) and an optional read-only capability record.
//!
//! | Characteristic | UUID                                   | Use           |
//! |----------------|----------------------------------------|---------------|
//! | Command/Event  | `c5f50002-8280-46da-89f4-6d8051e4aeef` | Write, Notify |
//! | Capabilities   | `c5f50003-8280-46da-89f4-6d8051e4aeef` | Read          |

use crate::channel::{Channel, ChannelEvent, EventReceiver, EventSender};
use crate::error::{Error, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, trace};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// Primary service advertised by compatible hubs.
pub const HUB_SERVICE_UUID: Uuid = Uuid::from_u128(0xc5f50001_8280_46da_89f4_6d8051e4aeef);

/// Command/event characteristic: commands written, events notified.
pub const COMMAND_EVENT_UUID: Uuid = Uuid::from_u128(0xc5f50002_8280_46da_89f4_6d8051e4aeef);

/// Read-only capability record characteristic.
pub const CAPABILITIES_UUID: Uuid = Uuid::from_u128(0xc5f50003_8280_46da_89f4_6d8051e4aeef);

/// Advertised name prefix used when no explicit name/address is given.
const HUB_NAME_PREFIX: &str = "Pybricks";

/// How often discovery re-checks the adapter's peripheral list.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Discovery options.
#[derive(Debug, Clone)]
pub struct BleOptions {
    /// Match this exact advertised name.
    pub name: Option<String>,
    /// Match this peripheral address, case-insensitive.
    pub address: Option<String>,
    /// Give up discovery after this long.
    pub scan_timeout: Duration,
}

impl Default for BleOptions {
    fn default() -> Self {
        Self {
            name: None,
            address: None,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

impl BleOptions {
    /// Set the name to match.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the address to match.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the discovery timeout.
    #[must_use]
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }
}

/// One hub seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredHub {
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Peripheral address.
    pub address: String,
    /// Signal strength at scan time.
    pub rssi: Option<i16>,
}

impl DiscoveredHub {
    /// Name to show a human.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed hub)")
    }
}

/// Get the first available Bluetooth adapter.
async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("no Bluetooth adapter available".into()))
}

fn advertises_hub(props: &PeripheralProperties) -> bool {
    props.services.contains(&HUB_SERVICE_UUID)
        || props
            .local_name
            .as_deref()
            .is_some_and(|n| n.starts_with(HUB_NAME_PREFIX))
}

fn matches_options(props: &PeripheralProperties, options: &BleOptions) -> bool {
    if let Some(addr) = &options.address {
        return props.address.to_string().eq_ignore_ascii_case(addr);
    }
    if let Some(name) = &options.name {
        return props.local_name.as_deref() == Some(name.as_str());
    }
    advertises_hub(props)
}

/// Scan for advertising hubs for the given duration.
pub async fn scan(timeout: Duration) -> Result<Vec<DiscoveredHub>> {
    let adapter = default_adapter().await?;
    adapter
        .start_scan(ScanFilter {
            services: vec![HUB_SERVICE_UUID],
        })
        .await?;
    sleep(timeout).await;

    let mut hubs = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Ok(Some(props)) = peripheral.properties().await {
            if advertises_hub(&props) {
                hubs.push(DiscoveredHub {
                    name: props.local_name.clone(),
                    address: props.address.to_string(),
                    rssi: props.rssi,
                });
            }
        }
    }
    adapter.stop_scan().await.ok();

    debug!("Scan found {} hub(s)", hubs.len());
    Ok(hubs)
}

/// Poll the adapter until a matching hub shows up or the timeout passes.
async fn discover_peripheral(adapter: &Adapter, options: &BleOptions) -> Result<Peripheral> {
    adapter
        .start_scan(ScanFilter {
            services: vec![HUB_SERVICE_UUID],
        })
        .await?;

    let deadline = Instant::now() + options.scan_timeout;
    let found = 'scan: loop {
        for peripheral in adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                if matches_options(&props, options) {
                    debug!(
                        "Found hub {} ({})",
                        props.local_name.as_deref().unwrap_or("?"),
                        props.address
                    );
                    break 'scan Ok(peripheral);
                }
                trace!("Ignoring peripheral {}", props.address);
            }
        }
        if Instant::now() >= deadline {
            break Err(Error::HubNotFound);
        }
        sleep(SCAN_POLL_INTERVAL).await;
    };

    adapter.stop_scan().await.ok();
    found
}

/// BLE-backed hub channel.
pub struct BleChannel {
    peripheral: Peripheral,
    command: Characteristic,
    capabilities: Option<Characteristic>,
    label: String,
}

impl BleChannel {
    /// Discover, connect, and subscribe to a hub.
    ///
    /// Returns the channel and the ordered inbound event queue. Any step
    /// failing tears the connection down before the error is returned; the
    /// link is never left half-open.
    pub async fn connect(options: &BleOptions) -> Result<(Self, EventReceiver)> {
        let adapter = default_adapter().await?;
        let peripheral = discover_peripheral(&adapter, options).await?;

        match Self::open(&adapter, peripheral.clone()).await {
            Ok(pair) => Ok(pair),
            Err(e) => {
                peripheral.disconnect().await.ok();
                Err(e)
            },
        }
    }

    async fn open(adapter: &Adapter, peripheral: Peripheral) -> Result<(Self, EventReceiver)> {
        let label = peripheral
            .properties()
            .await?
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| peripheral.address().to_string());

        info!("Connecting to {label}...");
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let chars = peripheral.characteristics();
        let command = chars
            .iter()
            .find(|c| c.uuid == COMMAND_EVENT_UUID)
            .cloned()
            .ok_or_else(|| {
                Error::Protocol("hub does not expose the command characteristic".into())
            })?;
        let capabilities = chars.iter().find(|c| c.uuid == CAPABILITIES_UUID).cloned();

        peripheral.subscribe(&command).await?;

        let notifications = peripheral.notifications().await?;
        let central_events = adapter.events().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_transport(
            notifications,
            central_events,
            peripheral.id(),
            tx,
        ));

        debug!("Subscribed to notifications on {label}");
        Ok((
            Self {
                peripheral,
                command,
                capabilities,
                label,
            },
            rx,
        ))
    }
}

/// Translate btleplug streams into the ordered channel event queue.
async fn pump_transport(
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    our_id: btleplug::platform::PeripheralId,
    tx: EventSender,
) {
    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(n) if n.uuid == COMMAND_EVENT_UUID => {
                    if tx.send(ChannelEvent::Notification(n.value)).is_err() {
                        break;
                    }
                },
                Some(_) => {},
                None => {
                    let _ = tx.send(ChannelEvent::Closed);
                    break;
                },
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(id)) if id == our_id => {
                    let _ = tx.send(ChannelEvent::Closed);
                    break;
                },
                Some(_) => {},
                None => {
                    let _ = tx.send(ChannelEvent::Closed);
                    break;
                },
            },
        }
    }
}

#[async_trait]
impl Channel for BleChannel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn write_acked(&self, packet: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.command, packet, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn write_unacked(&self, packet: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.command, packet, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn read_capability_record(&self) -> Result<Option<Vec<u8>>> {
        match &self.capabilities {
            Some(characteristic) => Ok(Some(self.peripheral.read(characteristic).await?)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        // Unsubscribe is best effort; the disconnect tears it down anyway
        let _ = self.peripheral.unsubscribe(&self.command).await;
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
