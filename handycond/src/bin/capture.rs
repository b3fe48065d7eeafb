//! Diagnostic tool: print raw events of an input node and what the daemon would make of them
//! Usage: handycon-capture [--grab] <device_path>
//!        handycon-capture --list

use evdev::{Device, InputEventKind};
use handycon_common::{tracing, ModeId, SourceId};
use handycond::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use handycond::event::RawEvent;
use handycond::hardware::HardwareIdentifier;
use handycond::normalizer::Normalizer;
use handycond::quirks::{self, QuirkProfile, QuirkStore};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let grab = args.iter().any(|a| a == "--grab");
    let list = args.iter().any(|a| a == "--list");
    let device_path = args.iter().skip(1).find(|a| !a.starts_with("--")).cloned();

    if list {
        for (path, device) in evdev::enumerate() {
            info!(
                "{}: '{}' phys={}",
                path.display(),
                device.name().unwrap_or("unknown"),
                device.physical_path().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let Some(device_path) = device_path else {
        eprintln!("Usage: {} [--grab] <device_path>", args[0]);
        eprintln!("       {} --list", args[0]);
        eprintln!("Example: {} --grab /dev/input/event3", args[0]);
        eprintln!("\nThis tool will:");
        eprintln!("  1. Identify the handheld and resolve its quirk profile");
        eprintln!("  2. Optionally grab the device exclusively (EVIOCGRAB)");
        eprintln!("  3. Print every key and axis event with its logical meaning");
        eprintln!("  4. Press Ctrl+C to exit and ungrab");
        std::process::exit(1);
    };

    if !nix::unistd::getuid().is_root() {
        error!("This tool must be run as root for device access");
        std::process::exit(1);
    }

    let mut device = Device::open(&device_path)?;
    let name = device.name().unwrap_or("unknown").to_string();
    let phys = device.physical_path().map(str::to_string);
    info!("Opened '{}' at {} (phys {})", name, device_path, phys.as_deref().unwrap_or("-"));

    let profile = resolve_profile().await;
    let source = profile.as_ref().and_then(|profile| {
        profile
            .sources
            .iter()
            .find(|s| s.matches(Some(&name), phys.as_deref()))
            .map(|s| s.id.clone())
    });
    let mut normalizer = profile.as_ref().map(Normalizer::new);
    let mode = profile
        .as_ref()
        .map(|p| p.default_mode.clone())
        .unwrap_or_else(|| ModeId::new("default"));
    match (&profile, &source) {
        (Some(profile), Some(source)) => info!("Device is source '{}' of profile {}", source, profile.name),
        (Some(profile), None) => warn!("Device is not a source of profile {}", profile.name),
        _ => {}
    }

    if grab {
        device.grab()?;
        info!("Device grabbed. Events from this device no longer reach other applications.");
    }
    info!("Press Ctrl+C to exit.");

    let (tx, mut rx) = mpsc::channel(256);
    std::thread::spawn(move || loop {
        match device.fetch_events() {
            Ok(events) => {
                for event in events {
                    if tx.blocking_send((event.kind(), event.code(), event.value())).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Read failed: {}", e);
                return;
            }
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let source = source.unwrap_or_else(|| SourceId::new("capture"));

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some((kind, code, value)) = received else { break };
                let (label, raw) = match kind {
                    InputEventKind::Key(key) => (format!("{:?}", key), RawEvent::key(&source, code, value, Instant::now())),
                    InputEventKind::AbsAxis(axis) => (format!("{:?}", axis), RawEvent::abs(&source, code, value, Instant::now())),
                    _ => continue,
                };
                let meaning = normalizer
                    .as_mut()
                    .and_then(|n| n.normalize(&raw, &mode))
                    .map(|n| format!("{:?}", n))
                    .unwrap_or_else(|| "-".to_string());
                info!("{} ({}) value {} -> {}", label, code, value, meaning);
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, cleaning up...");
                break;
            }
        }
    }

    // The reader thread owns the device; exiting closes it and drops the grab
    info!("Capture complete");
    Ok(())
}

/// Profile the daemon would pick, honoring an existing configuration file
async fn resolve_profile() -> Option<QuirkProfile> {
    let mut manager = ConfigManager::new(DEFAULT_CONFIG_PATH);
    if manager.config_path.exists() {
        if let Err(e) = manager.load_config().await {
            warn!("{}", e);
        }
    }
    let settings = &manager.config().quirks;

    let identifier = HardwareIdentifier::detect()
        .with_product_override(settings.product_override.as_deref());
    let dirs: Vec<PathBuf> = settings.profile_dirs.iter().map(PathBuf::from).collect();
    let store = match QuirkStore::load(&dirs) {
        Ok(store) => store,
        Err(e) => {
            warn!("{}", e);
            return None;
        }
    };
    match quirks::resolve(&store, &identifier) {
        Ok(profile) => Some(profile),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}
