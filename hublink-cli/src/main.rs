//! hublink CLI - upload and run programs on Pybricks-compatible BLE hubs.
//!
//! ## Features
//!
//! - Scan for advertising hubs
//! - Upload a program and run it, streaming its output
//! - Stop the running program
//! - Live output monitor
//! - Hub capability inspection
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use hublink::{
    ConsoleSink, HubSession, LinkState, LogRecord, ProgramImage, ProtocolRevision, SessionConfig,
    Severity,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod config;
mod picker;

use config::Config;
use picker::{PickerOptions, choose_hub};

/// hublink - upload and run programs on Pybricks-compatible BLE hubs.
///
/// Environment variables:
///   HUBLINK_NAME              - Default hub name
///   HUBLINK_ADDRESS           - Default hub address
///   HUBLINK_SCAN_TIMEOUT      - Scan timeout in seconds (default: 10)
///   HUBLINK_REVISION          - Protocol revision (v1, v2)
///   HUBLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hublink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/hublink-rs/hublink")]
struct Cli {
    /// Hub name to connect to (scans for any hub if not specified).
    #[arg(short = 'n', long, global = true, env = "HUBLINK_NAME")]
    name: Option<String>,

    /// Hub Bluetooth address to connect to.
    #[arg(short = 'a', long, global = true, env = "HUBLINK_ADDRESS")]
    address: Option<String>,

    /// Scan timeout in seconds.
    #[arg(long, global = true, default_value = "10", env = "HUBLINK_SCAN_TIMEOUT")]
    scan_timeout: u64,

    /// Protocol revision to speak.
    #[arg(short = 'r', long, global = true, env = "HUBLINK_REVISION")]
    revision: Option<Revision>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HUBLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Protocol revisions selectable from the CLI.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Revision {
    /// Base revision: program runs straight from RAM.
    V1,
    /// Revision that persists the program after upload (commit step).
    V2,
}

impl From<Revision> for ProtocolRevision {
    fn from(revision: Revision) -> Self {
        match revision {
            Revision::V1 => ProtocolRevision::V1,
            Revision::V2 => ProtocolRevision::V2,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Scan for advertising hubs.
    Scan {
        /// Output the hub list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Upload a program to the hub and run it.
    Run {
        /// Path to the program source file.
        program: PathBuf,

        /// Exit after starting instead of streaming output.
        #[arg(long)]
        detach: bool,
    },

    /// Stop the running program.
    Stop,

    /// Stream program output without uploading anything.
    Monitor,

    /// Show the hub's negotiated capabilities.
    Info {
        /// Output capabilities as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Prints hub output and session records to the terminal.
struct TerminalConsole;

impl ConsoleSink for TerminalConsole {
    fn log(&self, record: LogRecord) {
        let time = style(format!("[{}]", format_time(record.timestamp))).dim();
        let text = match record.severity {
            Severity::Info => record.text,
            Severity::Success => style(record.text).green().to_string(),
            Severity::Warning => style(record.text).yellow().to_string(),
            Severity::Error => style(record.text).red().to_string(),
        };
        println!("{time} {text}");
    }
}

/// Wall-clock HH:MM:SS for console records.
fn format_time(timestamp: SystemTime) -> String {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs();
    format!("{:02}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "hublink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let result = match &cli.command {
        Commands::Scan { json } => cmd_scan(&cli, *json).await,
        Commands::Run { program, detach } => cmd_run(&cli, &mut config, program, *detach).await,
        Commands::Stop => cmd_stop(&cli, &mut config).await,
        Commands::Monitor => cmd_monitor(&cli, &mut config).await,
        Commands::Info { json } => cmd_info(&cli, &mut config, *json).await,
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    };

    // A dismissed chooser is information, not a failure
    match result {
        Err(e)
            if e.downcast_ref::<hublink::Error>()
                .is_some_and(|e| matches!(e, hublink::Error::DiscoveryCancelled)) =>
        {
            eprintln!("{} Cancelled.", style("•").dim());
            Ok(())
        },
        other => other,
    }
}

/// Resolve a hub and establish a session with it.
async fn open_session(cli: &Cli, config: &mut Config) -> Result<HubSession<hublink::BleChannel>> {
    let picker = PickerOptions {
        name: cli.name.clone(),
        address: cli.address.clone(),
        non_interactive: cli.non_interactive,
        scan_timeout: Duration::from_secs(cli.scan_timeout),
    };
    let ble = choose_hub(&picker, config).await?;

    let revision = cli
        .revision
        .map(ProtocolRevision::from)
        .or_else(|| config.revision())
        .unwrap_or_default();
    let session_config = SessionConfig {
        revision,
        upload: config.upload_config(),
    };

    if !cli.quiet {
        eprintln!("{} Connecting...", style("⏳").yellow());
    }
    let session = HubSession::connect(&ble, Arc::new(TerminalConsole), session_config).await?;
    if !cli.quiet {
        eprintln!(
            "{} Connected to {}",
            style("✓").green(),
            style(session.name()).cyan()
        );
    }

    // Offer to remember a hub that came out of an interactive scan
    let was_scanned = cli.name.is_none()
        && cli.address.is_none()
        && config.hub.name.is_none()
        && config.hub.address.is_none();
    if was_scanned && !cli.non_interactive && console::Term::stderr().is_term() {
        if let Some(address) = &ble.address {
            let _ = picker::ask_remember_hub(address, Some(session.name()), config);
        }
    }

    Ok(session)
}

/// Scan command implementation.
async fn cmd_scan(cli: &Cli, json: bool) -> Result<()> {
    let timeout = Duration::from_secs(cli.scan_timeout);
    if !json && !cli.quiet {
        eprintln!(
            "{} Scanning for hubs ({}s)...",
            style("🔍").cyan(),
            timeout.as_secs()
        );
    }

    let hubs = hublink::scan(timeout).await?;

    if json {
        let entries: Vec<serde_json::Value> = hubs
            .iter()
            .map(|h| {
                serde_json::json!({
                    "name": h.name,
                    "address": h.address,
                    "rssi": h.rssi,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Discovered hubs:").bold().underlined());
    if hubs.is_empty() {
        eprintln!(
            "  {}",
            style("No hubs found. Make sure the hub is on and in range.").dim()
        );
    } else {
        for hub in &hubs {
            let rssi = hub.rssi.map(|v| format!(" [{v} dBm]")).unwrap_or_default();
            eprintln!(
                "  {} {} ({}){}",
                style("•").green(),
                style(hub.display_name()).cyan(),
                hub.address,
                style(rssi).dim()
            );
        }
    }
    Ok(())
}

/// Run command implementation.
async fn cmd_run(cli: &Cli, config: &mut Config, program: &PathBuf, detach: bool) -> Result<()> {
    let source = std::fs::read_to_string(program)
        .with_context(|| format!("Failed to read program {}", program.display()))?;
    let image = ProgramImage::from_source(&source);
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            program.display(),
            image.len()
        );
    }

    let session = open_session(cli, config).await?;

    // Ctrl-C during the upload cancels it; the engine stops the hub
    let cancel = session.cancel_handle();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let pb = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(image.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message("uploading");
        pb
    };

    let result = session
        .run_program(&image, |sent, _total| {
            pb.set_position(sent as u64);
        })
        .await;
    pb.finish_and_clear();
    signal.abort();

    match result {
        Ok(()) => {
            if !cli.quiet {
                eprintln!("{} Program started", style("▶").green().bold());
            }
        },
        Err(hublink::Error::Cancelled) => {
            eprintln!("{} Upload cancelled; hub stopped", style("⚠").yellow());
            session.disconnect().await?;
            return Ok(());
        },
        Err(e) => {
            session.disconnect().await.ok();
            return Err(e).context("Upload failed");
        },
    }

    if !detach {
        follow_program(cli, &session).await?;
    }

    session.disconnect().await?;
    Ok(())
}

/// Stream output until the program finishes, the link drops, or Ctrl-C.
async fn follow_program(cli: &Cli, session: &HubSession<hublink::BleChannel>) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{}",
            style("Streaming output; press Ctrl-C to stop the program.").dim()
        );
    }

    let mut status = session.status();
    let mut state = session.link_state();
    let mut started = status.borrow().is_some_and(|r| r.program_running());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.stop_program().await.ok();
                if !cli.quiet {
                    eprintln!("{} Program stopped", style("■").yellow());
                }
                break;
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let running = status.borrow().is_some_and(|r| r.program_running());
                if running {
                    started = true;
                } else if started {
                    if !cli.quiet {
                        eprintln!("{} Program finished", style("✓").green());
                    }
                    break;
                }
            },
            _ = state.wait_for(|s| *s == LinkState::Disconnected) => {
                eprintln!("{} Hub disconnected", style("⚠").yellow());
                break;
            },
        }
    }
    Ok(())
}

/// Stop command implementation.
async fn cmd_stop(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = open_session(cli, config).await?;
    session.stop_program().await?;
    if !cli.quiet {
        eprintln!("{} Program stopped", style("■").yellow());
    }
    session.disconnect().await?;
    Ok(())
}

/// Monitor command implementation.
async fn cmd_monitor(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = open_session(cli, config).await?;
    if !cli.quiet {
        eprintln!("{}", style("Monitoring output; press Ctrl-C to exit.").dim());
    }

    let mut state = session.link_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = state.wait_for(|s| *s == LinkState::Disconnected) => {
            eprintln!("{} Hub disconnected", style("⚠").yellow());
        },
    }

    session.disconnect().await?;
    Ok(())
}

/// Info command implementation.
async fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = open_session(cli, config).await?;
    let caps = session.capabilities();

    if json {
        let info = serde_json::json!({
            "hub": session.name(),
            "revision": session.revision().to_string(),
            "max_write_size": caps.max_write_size,
            "max_program_size": caps.max_program_size,
            "flags": caps.flags,
            "repl": caps.has_repl(),
            "multi_file_program": caps.has_multi_file_program(),
        });
        println!("{}", serde_json::to_string_pretty(&info).unwrap_or_default());
    } else {
        eprintln!("\n{}", style("Hub capabilities").bold().underlined());
        eprintln!("  Hub:              {}", style(session.name()).cyan());
        eprintln!("  Protocol:         {}", session.revision());
        eprintln!("  Max write size:   {} bytes", caps.max_write_size);
        match caps.max_program_size {
            Some(max) => eprintln!("  Max program size: {max} bytes"),
            None => eprintln!("  Max program size: unbounded"),
        }
        eprintln!(
            "  REPL:             {}",
            if caps.has_repl() { "yes" } else { "no" }
        );
        eprintln!(
            "  Multi-file:       {}",
            if caps.has_multi_file_program() { "yes" } else { "no" }
        );
    }

    session.disconnect().await?;
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
