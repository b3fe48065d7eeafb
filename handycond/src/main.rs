//! Handycon Daemon - Main Entry Point
//!
//! Privileged system daemon that:
//! - Identifies the handheld and resolves its quirk profile
//! - Grabs the built-in input sources and exposes one virtual controller
//! - Recognizes vendor button chords and handles the power button
//! - Serves status over IPC

use handycon_common::tracing;
use handycond::config::{ConfigManager, PowerBackendKind, DEFAULT_CONFIG_PATH};
use handycond::device::{self, DeviceWatcher, SourceControl};
use handycond::dispatcher::Dispatcher;
use handycond::engine::Engine;
use handycond::event::EngineEvent;
use handycond::feedback::{EvdevFeedback, Feedback, NullFeedback};
use handycond::hardware::HardwareIdentifier;
use handycond::ipc::IpcServer;
use handycond::power::{LogindBackend, PowerBackend, PowerInterceptor, SystemctlBackend};
use handycond::quirks::{self, QuirkStore, SourceRole};
use handycond::rumble::GamepadRumble;
use handycond::sink::{self, UinputGamepad, VirtualControllerSink};
use handycond::DaemonError;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_manager = ConfigManager::new(config_path());
    let loaded = config_manager.load_config().await;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config_manager.config().daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Handycon Daemon v{}", env!("CARGO_PKG_VERSION"));
    loaded.map_err(fatal)?;
    let config = config_manager.config().clone();

    if !nix::unistd::getuid().is_root() {
        error!("Handycon daemon must be started as root for device access");
        return Err("Insufficient privileges".into());
    }

    let identifier = HardwareIdentifier::detect()
        .with_product_override(config.quirks.product_override.as_deref());
    let dirs: Vec<PathBuf> = config.quirks.profile_dirs.iter().map(PathBuf::from).collect();
    let store = QuirkStore::load(&dirs).map_err(fatal)?;
    let profile = quirks::resolve(&store, &identifier).map_err(fatal)?;
    info!("Using quirk profile {} ({} chords)", profile.name, profile.chords.len());

    let rumble_source = profile
        .sources
        .iter()
        .find(|s| s.role == SourceRole::Gamepad)
        .cloned();

    let gamepad = UinputGamepad::new(&sink::output_codes(&profile)).map_err(fatal)?;
    match &rumble_source {
        Some(spec) if config.feedback.forward_rumble => {
            if let Err(e) = gamepad.forward_rumble(GamepadRumble::new(spec.clone())) {
                warn!("{}, games will not rumble", e);
            }
        }
        _ => info!("Rumble forwarding disabled"),
    }
    let sink = VirtualControllerSink::new(Arc::new(gamepad), &profile);
    device::install_panic_hook();

    let (events_tx, events_rx) = mpsc::channel(config.watcher.event_queue_size.max(1));
    let watcher = Arc::new(DeviceWatcher::watch(&profile, &config.watcher, events_tx.clone()));

    let command_timeout = Duration::from_millis(config.power.command_timeout_ms);
    let backend: Arc<dyn PowerBackend> = match config.power.backend {
        PowerBackendKind::Logind => match LogindBackend::connect() {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                warn!("{}, falling back to systemctl", e);
                Arc::new(SystemctlBackend::new(command_timeout))
            }
        },
        PowerBackendKind::Systemctl => Arc::new(SystemctlBackend::new(command_timeout)),
    };
    info!("Power backend: {}", backend.name());

    let sources: Arc<dyn SourceControl> = watcher.clone();
    let mut interceptor = PowerInterceptor::new(&profile, config.power.action, backend, sources);
    interceptor.start(events_tx.clone()).await;

    let feedback: Arc<dyn Feedback> = if config.feedback.haptics || config.feedback.led_path.is_some() {
        Arc::new(EvdevFeedback::new(rumble_source, config.feedback.led_path.as_ref().map(PathBuf::from)))
    } else {
        Arc::new(NullFeedback)
    };

    let dispatcher = Dispatcher::new(&profile, &config.feedback, sink, interceptor, feedback);
    let engine = Engine::new(&profile, dispatcher);

    let mut ipc_server = IpcServer::new(&config.daemon.socket_path)?;
    ipc_server.start(engine.status(), profile.summary(), &config.daemon.socket_group)?;
    info!("IPC server started successfully");

    let mut engine_task = tokio::spawn(engine.run(events_rx));

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let finished = tokio::select! {
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            None
        }
        _ = interrupt.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            None
        }
        result = &mut engine_task => Some(result),
    };

    let engine_result = match finished {
        Some(result) => result,
        None => {
            let _ = events_tx.send(EngineEvent::Shutdown).await;
            engine_task.await
        }
    };
    drop(events_tx);

    info!("Starting cleanup...");
    match Arc::try_unwrap(watcher) {
        Ok(watcher) => watcher.shutdown().await,
        Err(watcher) => {
            warn!("Device watcher still in use, releasing sources");
            watcher.release_all().await;
        }
    }
    if let Err(e) = ipc_server.shutdown().await {
        warn!("Failed to remove IPC socket: {}", e);
    }

    match engine_result {
        Ok(Ok(())) => {
            info!("Handycon Daemon shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(fatal(e)),
        Err(e) => {
            error!("Engine task failed: {}", e);
            Err(e.into())
        }
    }
}

/// `--config <path>` or the default location
fn config_path() -> PathBuf {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn fatal(e: DaemonError) -> Box<dyn std::error::Error> {
    error!("{}", e);
    Box::new(e)
}
