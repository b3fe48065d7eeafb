//! Device watcher
//!
//! One supervisor task per profile source keeps its node open and grabbed,
//! re-locating it with bounded backoff after it vanishes. Blocking readers
//! feed the engine queue; every (re)acquisition is announced with
//! `SourceReset` before the first event of the new session.

use async_trait::async_trait;
use evdev::{Device as EvdevDevice, EventType, InputEvent};
use handycon_common::{tracing, SourceId};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::BTreeSet;
use std::fs::File;
use std::future::pending;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WatcherSettings;
use crate::error::DaemonError;
use crate::event::{EngineEvent, RawEvent};
use crate::quirks::{QuirkProfile, SourceSpec};

// EVIOCGRAB ioctl number for exclusive device access
const EVIOCGRAB: u64 = 0x40044590;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Descriptors currently holding an exclusive grab
static GRABBED_FDS: Mutex<BTreeSet<RawFd>> = Mutex::new(BTreeSet::new());

fn register_grab(fd: RawFd) {
    let mut fds = GRABBED_FDS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    fds.insert(fd);
}

fn unregister_grab(fd: RawFd) {
    let mut fds = GRABBED_FDS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    fds.remove(&fd);
}

fn registered_grabs() -> Vec<RawFd> {
    let fds = GRABBED_FDS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    fds.iter().copied().collect()
}

/// Release every registered grab, then run the previous hook and exit.
///
/// A panicking daemon would otherwise leave the handheld's controls grabbed
/// and dead until the process is reaped.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        for fd in registered_grabs() {
            unsafe {
                libc::ioctl(fd, EVIOCGRAB, 0 as libc::c_int);
            }
        }
        previous(info);
        std::process::exit(101);
    }));
}

/// Find and open the device node for a source
pub fn locate(spec: &SourceSpec) -> Result<(PathBuf, EvdevDevice), String> {
    if let Some(path) = &spec.path {
        let device = EvdevDevice::open(path)
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        return Ok((path.clone(), device));
    }

    evdev::enumerate()
        .find(|(_, device)| spec.matches(device.name(), device.physical_path()))
        .ok_or_else(|| match &spec.name {
            Some(name) => format!("no device named '{}' with a matching phys path", name),
            None => "no matching device".to_string(),
        })
}

/// Outcome of one blocking wait on a source
#[derive(Debug)]
pub enum ReadBatch {
    Events(Vec<InputEvent>),
    Cancelled,
    Lost(String),
}

/// An opened input node
pub trait SourceDevice: Send {
    fn name(&self) -> String;

    fn grab(&mut self) -> io::Result<()>;

    fn ungrab(&mut self) -> io::Result<()>;

    /// Block until the node has events or `cancel` becomes readable
    fn read_batch(&mut self, cancel: BorrowedFd<'_>) -> ReadBatch;
}

/// Finds and opens the node behind a source
pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &SourceSpec) -> Result<(PathBuf, Box<dyn SourceDevice>), String>;
}

/// Opens real evdev nodes through [`locate`]
pub struct EvdevOpener;

impl SourceOpener for EvdevOpener {
    fn open(&self, spec: &SourceSpec) -> Result<(PathBuf, Box<dyn SourceDevice>), String> {
        let (path, device) = locate(spec)?;
        Ok((path, Box::new(EvdevSource { device })))
    }
}

struct EvdevSource {
    device: EvdevDevice,
}

impl SourceDevice for EvdevSource {
    fn name(&self) -> String {
        self.device.name().unwrap_or("unknown").to_string()
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()?;
        register_grab(self.device.as_raw_fd());
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        unregister_grab(self.device.as_raw_fd());
        self.device.ungrab()
    }

    fn read_batch(&mut self, cancel: BorrowedFd<'_>) -> ReadBatch {
        loop {
            let device_fd = unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) };
            let mut fds = [
                PollFd::new(device_fd, PollFlags::POLLIN),
                PollFd::new(cancel, PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return ReadBatch::Lost(format!("poll failed: {}", e)),
            }
            if fds[1].revents().map_or(false, |r| !r.is_empty()) {
                return ReadBatch::Cancelled;
            }
            if fds[0].revents().map_or(true, |r| r.is_empty()) {
                continue;
            }

            match self.device.fetch_events() {
                Ok(fetched) => return ReadBatch::Events(fetched.collect()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return ReadBatch::Lost(e.to_string()),
            }
        }
    }
}

/// Exponential backoff step, bounded by `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Control surface used around suspend and by the power fallback
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Ungrab and close every source
    async fn release_all(&self);

    /// Re-open every source that was released, except disabled ones
    async fn reacquire_all(&self);

    /// Ungrab and close one source until the daemon restarts
    async fn release(&self, source: &SourceId);
}

#[derive(Debug)]
enum Command {
    Release(oneshot::Sender<()>),
    Reacquire(oneshot::Sender<()>),
    Disable(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, PartialEq)]
enum ReaderExit {
    Cancelled,
    Lost(String),
    QueueClosed,
}

/// An open source node; dropping it releases the grab
struct Reader {
    source: SourceId,
    path: PathBuf,
    device: Box<dyn SourceDevice>,
    grabbed: bool,
}

impl Reader {
    fn run(
        mut self,
        cancel: OwnedFd,
        mut cancel_rx: watch::Receiver<bool>,
        events: mpsc::Sender<EngineEvent>,
        rt: Handle,
    ) -> ReaderExit {
        info!("Starting event reader for {} at {}", self.source, self.path.display());

        loop {
            let fetched = match self.device.read_batch(cancel.as_fd()) {
                ReadBatch::Events(fetched) => fetched,
                ReadBatch::Cancelled => return ReaderExit::Cancelled,
                ReadBatch::Lost(reason) => return ReaderExit::Lost(reason),
            };
            let now = Instant::now();
            let batch: Vec<RawEvent> = fetched
                .into_iter()
                .filter(|ev| matches!(ev.event_type(), EventType::KEY | EventType::ABSOLUTE))
                .map(|ev| RawEvent {
                    source: self.source.clone(),
                    event_type: ev.event_type().0,
                    code: ev.code(),
                    value: ev.value(),
                    timestamp: now,
                })
                .collect();

            for raw in batch {
                debug!("Event from {}: type={} code={} value={}", raw.source, raw.event_type, raw.code, raw.value);
                let exit = rt.block_on(async {
                    tokio::select! {
                        sent = events.send(EngineEvent::Raw(raw)) => match sent {
                            Ok(()) => None,
                            Err(_) => Some(ReaderExit::QueueClosed),
                        },
                        _ = cancel_rx.changed() => Some(ReaderExit::Cancelled),
                    }
                });
                if let Some(exit) = exit {
                    return exit;
                }
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if !self.grabbed {
            return;
        }
        match self.device.ungrab() {
            Ok(()) => info!("Released grab on {}", self.path.display()),
            Err(e) => debug!("Ungrab of {} failed: {}", self.path.display(), e),
        }
    }
}

struct ActiveReader {
    cancel_pipe: File,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<ReaderExit>,
}

impl ActiveReader {
    async fn stop(self) -> ReaderExit {
        let _ = self.cancel.send(true);
        if let Err(e) = (&self.cancel_pipe).write_all(&[1]) {
            warn!("Failed to wake event reader: {}", e);
        }
        self.handle
            .await
            .unwrap_or_else(|e| ReaderExit::Lost(e.to_string()))
    }
}

async fn wait_reader(active: &mut Option<ActiveReader>) -> ReaderExit {
    match active {
        Some(reader) => (&mut reader.handle)
            .await
            .unwrap_or_else(|e| ReaderExit::Lost(e.to_string())),
        None => pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Keeps one source open, re-locating it after it vanishes
struct Supervisor {
    spec: SourceSpec,
    opener: Arc<dyn SourceOpener>,
    settings: WatcherSettings,
    events: mpsc::Sender<EngineEvent>,
    commands: mpsc::Receiver<Command>,
    wanted: bool,
    disabled: bool,
    backoff: Duration,
    reported_failure: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut active: Option<ActiveReader> = None;
        let mut retry_at = Some(Instant::now());

        loop {
            let due = retry_at.map_or(false, |at| at <= Instant::now());
            if active.is_none() && self.wanted && !self.disabled && due {
                match self.acquire().await {
                    Ok(Some(reader)) => {
                        active = Some(reader);
                        retry_at = None;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        self.report_failure(&e);
                        retry_at = Some(Instant::now() + self.backoff);
                        self.backoff = next_backoff(self.backoff, self.settings.backoff_max());
                    }
                }
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Release(ack)) => {
                        self.wanted = false;
                        self.stop(&mut active, ack, "released").await;
                    }
                    Some(Command::Disable(ack)) => {
                        self.disabled = true;
                        self.stop(&mut active, ack, "disabled").await;
                    }
                    Some(Command::Reacquire(ack)) => {
                        if !self.disabled && !self.wanted {
                            self.wanted = true;
                            self.backoff = self.settings.backoff_initial();
                            retry_at = Some(Instant::now());
                        }
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        if let Some(reader) = active.take() {
                            reader.stop().await;
                        }
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        if let Some(reader) = active.take() {
                            reader.stop().await;
                        }
                        return;
                    }
                },
                exit = wait_reader(&mut active) => {
                    active = None;
                    match exit {
                        ReaderExit::QueueClosed => return,
                        ReaderExit::Cancelled => {}
                        ReaderExit::Lost(reason) => {
                            warn!("Input source {} lost: {}", self.spec.id, reason);
                            if !self.notify(EngineEvent::SourceLost { source: self.spec.id.clone(), reason }).await {
                                return;
                            }
                            self.backoff = self.settings.backoff_initial();
                            retry_at = Some(Instant::now() + self.backoff);
                        }
                    }
                },
                _ = wait_until(retry_at), if active.is_none() && self.wanted && !self.disabled => {}
            }
        }
    }

    /// Open, grab and start reading; `Ok(None)` when the engine is gone
    async fn acquire(&mut self) -> Result<Option<ActiveReader>, DaemonError> {
        let id = self.spec.id.clone();
        let (path, mut device) = self
            .opener
            .open(&self.spec)
            .map_err(|reason| DaemonError::source_unavailable(&id, reason))?;
        let (cancel_read, cancel_write) = nix::unistd::pipe()
            .map_err(|e| DaemonError::source_unavailable(&id, format!("cannot create pipe: {}", e)))?;

        if self.spec.grab {
            device.grab().map_err(|e| {
                DaemonError::source_unavailable(&id, format!("cannot grab {}: {}", path.display(), e))
            })?;
        }
        let reader = Reader {
            source: id.clone(),
            path: path.clone(),
            device,
            grabbed: self.spec.grab,
        };

        info!(
            "Input source {} acquired: {} at {}{}",
            id,
            reader.device.name(),
            path.display(),
            if self.spec.grab { " (grabbed)" } else { "" }
        );
        self.reported_failure = false;
        self.backoff = self.settings.backoff_initial();

        // The engine must see the reset before the first event of this session
        let reset = EngineEvent::SourceReset {
            source: id,
            path,
            grabbed: self.spec.grab,
        };
        if !self.notify(reset).await {
            return Ok(None);
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let events = self.events.clone();
        let rt = Handle::current();
        let handle = tokio::task::spawn_blocking(move || reader.run(cancel_read, cancel_rx, events, rt));

        Ok(Some(ActiveReader {
            cancel_pipe: File::from(cancel_write),
            cancel,
            handle,
        }))
    }

    async fn stop(&mut self, active: &mut Option<ActiveReader>, ack: oneshot::Sender<()>, reason: &str) {
        let reader = active.take();
        if let Some(reader) = reader {
            reader.stop().await;
            let _ = ack.send(());
            info!("Input source {} {}", self.spec.id, reason);
            self.notify(EngineEvent::SourceLost {
                source: self.spec.id.clone(),
                reason: reason.to_string(),
            })
            .await;
        } else {
            let _ = ack.send(());
        }
    }

    fn report_failure(&mut self, e: &DaemonError) {
        if self.reported_failure || self.spec.optional {
            debug!("{} (retrying in {:?})", e, self.backoff);
        } else {
            warn!("{} (retrying in {:?})", e, self.backoff);
            self.reported_failure = true;
        }
    }

    async fn notify(&self, event: EngineEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Engine queue closed, stopping supervisor for {}", self.spec.id);
            return false;
        }
        true
    }
}

struct SourceHandle {
    id: SourceId,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Supervises every input source of the active profile
pub struct DeviceWatcher {
    sources: Vec<SourceHandle>,
}

impl DeviceWatcher {
    /// Spawn one supervisor per source. Must be called within a tokio runtime.
    pub fn watch(
        profile: &QuirkProfile,
        settings: &WatcherSettings,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self::watch_with(profile, settings, events, Arc::new(EvdevOpener))
    }

    /// Like [`DeviceWatcher::watch`], opening nodes through `opener`
    pub fn watch_with(
        profile: &QuirkProfile,
        settings: &WatcherSettings,
        events: mpsc::Sender<EngineEvent>,
        opener: Arc<dyn SourceOpener>,
    ) -> Self {
        info!("Watching {} input sources for {}", profile.sources.len(), profile.name);

        let sources = profile
            .sources
            .iter()
            .map(|spec| {
                let (commands, receiver) = mpsc::channel(8);
                let supervisor = Supervisor {
                    spec: spec.clone(),
                    opener: Arc::clone(&opener),
                    settings: settings.clone(),
                    events: events.clone(),
                    commands: receiver,
                    wanted: true,
                    disabled: false,
                    backoff: settings.backoff_initial(),
                    reported_failure: false,
                };
                SourceHandle {
                    id: spec.id.clone(),
                    commands,
                    task: tokio::spawn(supervisor.run()),
                }
            })
            .collect();

        Self { sources }
    }

    async fn command(&self, handle: &SourceHandle, make: fn(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if handle.commands.send(make(ack)).await.is_err() {
            debug!("Supervisor for {} is gone", handle.id);
            return;
        }
        match timeout(ACK_TIMEOUT, done).await {
            Ok(_) => {}
            Err(_) => warn!("Input source {} did not answer within {:?}", handle.id, ACK_TIMEOUT),
        }
    }

    /// Stop every supervisor, releasing all grabs
    pub async fn shutdown(self) {
        info!("Shutting down device watcher");
        for handle in &self.sources {
            self.command(handle, Command::Shutdown).await;
        }
        for handle in self.sources {
            if let Err(e) = handle.task.await {
                error!("Supervisor for {} failed: {}", handle.id, e);
            }
        }
        info!("Device watcher shutdown complete");
    }
}

#[async_trait]
impl SourceControl for DeviceWatcher {
    async fn release_all(&self) {
        info!("Releasing all input sources");
        for handle in &self.sources {
            self.command(handle, Command::Release).await;
        }
    }

    async fn reacquire_all(&self) {
        info!("Re-acquiring input sources");
        for handle in &self.sources {
            self.command(handle, Command::Reacquire).await;
        }
    }

    async fn release(&self, source: &SourceId) {
        for handle in self.sources.iter().filter(|h| &h.id == source) {
            self.command(handle, Command::Disable).await;
        }
    }
}
