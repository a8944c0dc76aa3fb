//! Interactive hub selection.
//!
//! Resolution order mirrors the config precedence: explicit CLI identity,
//! then the remembered hub from configuration, then a scan — interactive
//! chooser when several hubs are advertising, first match otherwise.

use crate::config::Config;
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use hublink::{BleOptions, DiscoveredHub, Error, Result};
use log::{debug, info};
use std::io::IsTerminal;
use std::time::Duration;

/// Options for hub selection.
#[derive(Debug, Clone, Default)]
pub struct PickerOptions {
    /// Explicit hub name from the CLI.
    pub name: Option<String>,
    /// Explicit hub address from the CLI.
    pub address: Option<String>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
    /// Scan duration when discovery is needed.
    pub scan_timeout: Duration,
}

impl PickerOptions {
    fn base(&self) -> BleOptions {
        BleOptions::default().with_scan_timeout(self.scan_timeout)
    }
}

/// Resolve which hub to connect to.
///
/// A dismissed chooser returns [`Error::DiscoveryCancelled`], which callers
/// treat as information, not failure.
pub async fn choose_hub(options: &PickerOptions, config: &Config) -> Result<BleOptions> {
    if let Some(address) = &options.address {
        return Ok(options.base().with_address(address));
    }
    if let Some(name) = &options.name {
        return Ok(options.base().with_name(name));
    }

    if let Some(address) = &config.hub.address {
        debug!("Using remembered hub address {address}");
        return Ok(options.base().with_address(address));
    }
    if let Some(name) = &config.hub.name {
        debug!("Using remembered hub name {name}");
        return Ok(options.base().with_name(name));
    }

    eprintln!(
        "{} Scanning for hubs ({}s)...",
        style("🔍").cyan(),
        options.scan_timeout.as_secs()
    );
    let hubs = hublink::scan(options.scan_timeout).await?;

    match hubs.len() {
        0 => Err(Error::HubNotFound),
        1 => {
            info!(
                "Found one hub: {} ({})",
                hubs[0].display_name(),
                hubs[0].address
            );
            Ok(options.base().with_address(&hubs[0].address))
        },
        _ if options.non_interactive || !std::io::stdin().is_terminal() => Err(Error::Protocol(
            "multiple hubs found; select one with --name or --address".into(),
        )),
        _ => {
            let hub = select_interactively(&hubs)?;
            Ok(options.base().with_address(&hub.address))
        },
    }
}

fn select_interactively(hubs: &[DiscoveredHub]) -> Result<&DiscoveredHub> {
    let items: Vec<String> = hubs.iter().map(describe_hub).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a hub")
        .items(&items)
        .default(0)
        .interact_opt();

    match selection {
        Ok(Some(index)) => Ok(&hubs[index]),
        Ok(None) => Err(Error::DiscoveryCancelled),
        Err(e) => {
            debug!("Hub chooser failed: {e}");
            Err(Error::DiscoveryCancelled)
        },
    }
}

fn describe_hub(hub: &DiscoveredHub) -> String {
    let rssi = hub
        .rssi
        .map(|v| format!(" [{v} dBm]"))
        .unwrap_or_default();
    format!("{} ({}){rssi}", hub.display_name(), hub.address)
}

/// Offer to remember a freshly selected hub in the global config.
pub fn ask_remember_hub(address: &str, name: Option<&str>, config: &mut Config) -> Result<()> {
    if config.hub.address.as_deref() == Some(address) {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this hub for future runs?")
        .default(true)
        .interact_opt()
        .unwrap_or(Some(false))
        .unwrap_or(false);

    if remember {
        config.hub.address = Some(address.to_string());
        config.hub.name = name.map(ToString::to_string);
        if let Err(e) = config.save_global() {
            debug!("Could not save config: {e}");
        } else {
            eprintln!("{} Saved to global config", style("✓").green());
        }
    }
    Ok(())
}
