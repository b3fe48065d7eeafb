//! Power button and suspend/resume handling
//!
//! Power requests from chords are routed according to the profile's power
//! mode. Sleep notifications from the OS arrive as ordinary engine events so
//! that grabs are released before sleep and re-taken after resume in order
//! with everything else.

use async_trait::async_trait;
use handycon_common::{tracing, Action, PowerKind, SourceId};
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zbus::blocking::{Connection, Proxy};

use crate::device::SourceControl;
use crate::error::DaemonError;
use crate::event::EngineEvent;
use crate::quirks::{effective_power_kind, PowerMode, QuirkProfile, SourceRole};
use crate::sink::VirtualControllerSink;

const LOGIND_DESTINATION: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const LOGIND_INTERFACE: &str = "org.freedesktop.login1.Manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Awake,
    SuspendRequested,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PowerState::Awake => "awake",
            PowerState::SuspendRequested => "suspend_requested",
            PowerState::Suspended => "suspended",
        };
        write!(f, "{}", name)
    }
}

/// What the dispatcher has to do after the interceptor ran
#[derive(Debug, Clone, PartialEq)]
pub enum PowerOutcome {
    Handled,
    /// Dispatch this action instead
    Remap(Action),
    /// Held input state is stale; reset the recognizer for all sources
    ResetAll,
}

/// OS side of power management
#[async_trait]
pub trait PowerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forward sleep notifications as [`EngineEvent::Sleep`]. Returns false
    /// when the backend has no notifications.
    async fn subscribe(&self, events: mpsc::Sender<EngineEvent>) -> Result<bool, DaemonError>;

    /// Take a delay inhibitor so sleep waits for the grabs to be released
    async fn inhibit(&self) -> Result<(), DaemonError>;

    async fn release_inhibitor(&self);

    async fn request(&self, kind: PowerKind) -> Result<(), DaemonError>;
}

fn hook_error(e: impl fmt::Display) -> DaemonError {
    DaemonError::PowerHookFailure(e.to_string())
}

async fn run_blocking<T, F>(f: F) -> Result<T, DaemonError>
where
    F: FnOnce() -> Result<T, DaemonError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(hook_error)?
}

/// systemd-logind over the system bus
pub struct LogindBackend {
    connection: Connection,
    inhibitor: Mutex<Option<zbus::zvariant::OwnedFd>>,
}

impl LogindBackend {
    pub fn connect() -> Result<Self, DaemonError> {
        let connection = Connection::system().map_err(hook_error)?;
        Ok(Self {
            connection,
            inhibitor: Mutex::new(None),
        })
    }

    fn manager(connection: &Connection) -> Result<Proxy<'static>, DaemonError> {
        Proxy::new(connection, LOGIND_DESTINATION, LOGIND_PATH, LOGIND_INTERFACE).map_err(hook_error)
    }
}

#[async_trait]
impl PowerBackend for LogindBackend {
    fn name(&self) -> &'static str {
        "logind"
    }

    async fn subscribe(&self, events: mpsc::Sender<EngineEvent>) -> Result<bool, DaemonError> {
        let connection = self.connection.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("logind-signals".to_string())
            .spawn(move || {
                let signals = match Self::manager(&connection)
                    .and_then(|proxy| proxy.receive_signal("PrepareForSleep").map_err(hook_error))
                {
                    Ok(signals) => {
                        let _ = ready_tx.send(Ok(()));
                        signals
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for message in signals {
                    match message.body().deserialize::<bool>() {
                        Ok(entering) => {
                            debug!("PrepareForSleep({})", entering);
                            if events.blocking_send(EngineEvent::Sleep(entering)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Malformed PrepareForSleep signal: {}", e),
                    }
                }
                debug!("logind signal listener stopped");
            })
            .map_err(hook_error)?;

        ready_rx.await.map_err(hook_error)??;
        info!("Subscribed to logind sleep notifications");
        Ok(true)
    }

    async fn inhibit(&self) -> Result<(), DaemonError> {
        let connection = self.connection.clone();
        let fd = run_blocking(move || {
            let manager = Self::manager(&connection)?;
            manager
                .call::<_, _, zbus::zvariant::OwnedFd>(
                    "Inhibit",
                    &("sleep", "handycon", "Release input devices before sleep", "delay"),
                )
                .map_err(hook_error)
        })
        .await?;

        let mut inhibitor = self.inhibitor.lock().unwrap_or_else(|p| p.into_inner());
        *inhibitor = Some(fd);
        debug!("Sleep delay inhibitor taken");
        Ok(())
    }

    async fn release_inhibitor(&self) {
        let mut inhibitor = self.inhibitor.lock().unwrap_or_else(|p| p.into_inner());
        if inhibitor.take().is_some() {
            debug!("Sleep delay inhibitor released");
        }
    }

    async fn request(&self, kind: PowerKind) -> Result<(), DaemonError> {
        let method = match kind {
            PowerKind::Suspend => "Suspend",
            PowerKind::Hibernate => "Hibernate",
            PowerKind::Shutdown => "PowerOff",
            PowerKind::Ignore => return Ok(()),
        };
        let connection = self.connection.clone();
        run_blocking(move || {
            let manager = Self::manager(&connection)?;
            manager.call::<_, _, ()>(method, &(false,)).map_err(hook_error)
        })
        .await
    }
}

/// Falls back to running systemctl; has no sleep notifications
pub struct SystemctlBackend {
    timeout: Duration,
}

impl SystemctlBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PowerBackend for SystemctlBackend {
    fn name(&self) -> &'static str {
        "systemctl"
    }

    async fn subscribe(&self, _events: mpsc::Sender<EngineEvent>) -> Result<bool, DaemonError> {
        Ok(false)
    }

    async fn inhibit(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn release_inhibitor(&self) {}

    async fn request(&self, kind: PowerKind) -> Result<(), DaemonError> {
        let verb = match kind {
            PowerKind::Suspend => "suspend",
            PowerKind::Hibernate => "hibernate",
            PowerKind::Shutdown => "poweroff",
            PowerKind::Ignore => return Ok(()),
        };
        info!("Executing systemctl {}", verb);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("systemctl")
                .arg(verb)
                .env_clear()
                .env("PATH", "/usr/bin:/bin")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(DaemonError::PowerHookFailure(format!(
                "systemctl {} failed: {}",
                verb,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(e)) => Err(DaemonError::PowerHookFailure(format!("cannot run systemctl: {}", e))),
            Err(_) => Err(DaemonError::PowerHookFailure(format!(
                "systemctl {} timed out after {:?}",
                verb, self.timeout
            ))),
        }
    }
}

/// Routes power requests and sleep notifications
pub struct PowerInterceptor {
    backend: Arc<dyn PowerBackend>,
    sources: Arc<dyn SourceControl>,
    mode: PowerMode,
    remap: Option<Action>,
    override_kind: Option<PowerKind>,
    power_sources: Vec<SourceId>,
    state: PowerState,
    degraded: bool,
    notifies: bool,
}

impl PowerInterceptor {
    pub fn new(
        profile: &QuirkProfile,
        override_kind: Option<PowerKind>,
        backend: Arc<dyn PowerBackend>,
        sources: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            backend,
            sources,
            mode: profile.power_mode,
            remap: profile.power_remap.clone(),
            override_kind,
            power_sources: profile
                .sources
                .iter()
                .filter(|s| s.role == SourceRole::Power)
                .map(|s| s.id.clone())
                .collect(),
            state: PowerState::Awake,
            degraded: false,
            notifies: false,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Subscribe to sleep notifications and take the first inhibitor
    pub async fn start(&mut self, events: mpsc::Sender<EngineEvent>) {
        match self.backend.subscribe(events).await {
            Ok(notifies) => {
                self.notifies = notifies;
                if notifies {
                    if let Err(e) = self.backend.inhibit().await {
                        warn!("Could not take sleep inhibitor: {}", e);
                    }
                } else {
                    info!("Power backend {} has no sleep notifications", self.backend.name());
                }
            }
            Err(e) => {
                warn!("{}", e);
                self.degrade().await;
            }
        }
    }

    /// Handle a power request coming from a chord
    pub async fn handle_request(
        &mut self,
        requested: PowerKind,
        sink: &mut VirtualControllerSink,
    ) -> Result<PowerOutcome, DaemonError> {
        let kind = effective_power_kind(requested, self.override_kind);
        if kind == PowerKind::Ignore {
            debug!("Power request {} ignored by configuration", requested);
            return Ok(PowerOutcome::Handled);
        }
        if self.state != PowerState::Awake {
            debug!("Power request {} while {}, ignored", kind, self.state);
            return Ok(PowerOutcome::Handled);
        }

        match self.mode {
            PowerMode::InterceptAndIgnore => {
                info!("Power request {} intercepted and dropped", kind);
                Ok(PowerOutcome::Handled)
            }
            PowerMode::InterceptAndRemap => match &self.remap {
                Some(action) => {
                    debug!("Power request {} remapped to {}", kind, action);
                    Ok(PowerOutcome::Remap(action.clone()))
                }
                None => Ok(PowerOutcome::Handled),
            },
            PowerMode::NativeSuspend => self.native(kind, sink).await,
        }
    }

    async fn native(
        &mut self,
        kind: PowerKind,
        sink: &mut VirtualControllerSink,
    ) -> Result<PowerOutcome, DaemonError> {
        info!("Requesting {} via {}", kind, self.backend.name());
        sink.release_all().await?;
        self.sources.release_all().await;
        self.state = PowerState::SuspendRequested;

        match self.backend.request(kind).await {
            Ok(()) if self.notifies => Ok(PowerOutcome::Handled),
            Ok(()) => Ok(self.resume().await),
            Err(e) => {
                warn!("{}", e);
                self.degrade().await;
                self.sources.reacquire_all().await;
                self.state = PowerState::Awake;
                Ok(PowerOutcome::ResetAll)
            }
        }
    }

    /// Handle a sleep notification from the OS
    pub async fn on_sleep(
        &mut self,
        entering: bool,
        sink: &mut VirtualControllerSink,
    ) -> Result<PowerOutcome, DaemonError> {
        if entering {
            info!("System is going to sleep");
            sink.release_all().await?;
            self.sources.release_all().await;
            self.backend.release_inhibitor().await;
            self.state = PowerState::Suspended;
            Ok(PowerOutcome::Handled)
        } else {
            info!("System resumed");
            Ok(self.resume().await)
        }
    }

    async fn resume(&mut self) -> PowerOutcome {
        if self.notifies {
            if let Err(e) = self.backend.inhibit().await {
                warn!("Could not take sleep inhibitor: {}", e);
            }
        }
        self.sources.reacquire_all().await;
        self.state = PowerState::Awake;
        PowerOutcome::ResetAll
    }

    /// Give the power button back to the OS
    async fn degrade(&mut self) {
        if self.degraded {
            return;
        }
        self.degraded = true;
        warn!("Power handling degraded, the power button is left to the OS");
        for source in &self.power_sources {
            self.sources.release(source).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sink::tests::RecordingDevice;
    use crate::sink::OutputEvent;
    use handycon_common::{LogicalButton, Phase};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        ReleaseAll,
        ReacquireAll,
        Release(SourceId),
        Subscribe,
        Inhibit,
        ReleaseInhibitor,
        Request(PowerKind),
    }

    /// Records calls to both the source control and the power backend
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub calls: Mutex<Vec<Call>>,
        pub notifies: bool,
        pub fail_requests: bool,
        pub fail_subscribe: bool,
    }

    impl Recorder {
        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl SourceControl for Recorder {
        async fn release_all(&self) {
            self.push(Call::ReleaseAll);
        }

        async fn reacquire_all(&self) {
            self.push(Call::ReacquireAll);
        }

        async fn release(&self, source: &SourceId) {
            self.push(Call::Release(source.clone()));
        }
    }

    #[async_trait]
    impl PowerBackend for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn subscribe(&self, _events: mpsc::Sender<EngineEvent>) -> Result<bool, DaemonError> {
            self.push(Call::Subscribe);
            if self.fail_subscribe {
                return Err(DaemonError::PowerHookFailure("no bus".into()));
            }
            Ok(self.notifies)
        }

        async fn inhibit(&self) -> Result<(), DaemonError> {
            self.push(Call::Inhibit);
            Ok(())
        }

        async fn release_inhibitor(&self) {
            self.push(Call::ReleaseInhibitor);
        }

        async fn request(&self, kind: PowerKind) -> Result<(), DaemonError> {
            self.push(Call::Request(kind));
            if self.fail_requests {
                return Err(DaemonError::PowerHookFailure("denied".into()));
            }
            Ok(())
        }
    }

    const PROFILE: &str = r#"
name: TEST
product_names: ["Test Handheld"]
sources:
  - { id: keyboard, role: keyboard, name: "AT Translated Set 2 keyboard" }
  - { id: power, role: power, name: "Power Button", optional: true }
mappings:
  - { source: power, code: 116, button: power }
chords:
  - buttons: [power]
    action: !power_request suspend
"#;

    fn setup(
        recorder: Recorder,
        mode: PowerMode,
        override_kind: Option<PowerKind>,
    ) -> (PowerInterceptor, Arc<Recorder>, VirtualControllerSink, Arc<RecordingDevice>) {
        let mut profile = QuirkProfile::from_yaml(PROFILE).unwrap();
        profile.power_mode = mode;
        profile.power_remap = Some(Action::SynthesizeButton(LogicalButton::Guide, Phase::Down));
        let recorder = Arc::new(recorder);
        let interceptor = PowerInterceptor::new(&profile, override_kind, recorder.clone(), recorder.clone());
        let device = Arc::new(RecordingDevice::default());
        let sink = VirtualControllerSink::new(device.clone(), &profile);
        (interceptor, recorder, sink, device)
    }

    fn logind_like() -> Recorder {
        Recorder {
            notifies: true,
            ..Recorder::default()
        }
    }

    #[tokio::test]
    async fn test_native_suspend_with_notifications() {
        let (mut interceptor, recorder, mut sink, device) =
            setup(logind_like(), PowerMode::NativeSuspend, None);
        let (tx, _rx) = mpsc::channel(4);
        interceptor.start(tx).await;
        recorder.clear();

        sink.apply(&Action::SynthesizeButton(LogicalButton::South, Phase::Down)).await.unwrap();
        let outcome = interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert_eq!(outcome, PowerOutcome::Handled);
        assert_eq!(interceptor.state(), PowerState::SuspendRequested);
        assert_eq!(recorder.calls(), vec![Call::ReleaseAll, Call::Request(PowerKind::Suspend)]);
        assert_eq!(device.batches().last().unwrap(), &vec![OutputEvent::Key { code: 304, pressed: false }]);

        // A second press while the request is in flight is ignored
        interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert_eq!(recorder.calls().len(), 2);

        recorder.clear();
        interceptor.on_sleep(true, &mut sink).await.unwrap();
        assert_eq!(interceptor.state(), PowerState::Suspended);
        assert_eq!(recorder.calls(), vec![Call::ReleaseAll, Call::ReleaseInhibitor]);

        recorder.clear();
        let outcome = interceptor.on_sleep(false, &mut sink).await.unwrap();
        assert_eq!(outcome, PowerOutcome::ResetAll);
        assert_eq!(interceptor.state(), PowerState::Awake);
        assert_eq!(recorder.calls(), vec![Call::Inhibit, Call::ReacquireAll]);
    }

    #[tokio::test]
    async fn test_backend_without_notifications_resumes_immediately() {
        let (mut interceptor, recorder, mut sink, _) =
            setup(Recorder::default(), PowerMode::NativeSuspend, None);
        let (tx, _rx) = mpsc::channel(4);
        interceptor.start(tx).await;

        let outcome = interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert_eq!(outcome, PowerOutcome::ResetAll);
        assert_eq!(interceptor.state(), PowerState::Awake);
        assert_eq!(
            recorder.calls(),
            vec![Call::Subscribe, Call::ReleaseAll, Call::Request(PowerKind::Suspend), Call::ReacquireAll]
        );
    }

    #[tokio::test]
    async fn test_failed_request_degrades() {
        let recorder = Recorder {
            notifies: true,
            fail_requests: true,
            ..Recorder::default()
        };
        let (mut interceptor, recorder, mut sink, _) = setup(recorder, PowerMode::NativeSuspend, None);
        let (tx, _rx) = mpsc::channel(4);
        interceptor.start(tx).await;
        recorder.clear();

        let outcome = interceptor.handle_request(PowerKind::Shutdown, &mut sink).await.unwrap();
        assert_eq!(outcome, PowerOutcome::ResetAll);
        assert!(interceptor.is_degraded());
        assert_eq!(interceptor.state(), PowerState::Awake);
        assert_eq!(
            recorder.calls(),
            vec![
                Call::ReleaseAll,
                Call::Request(PowerKind::Shutdown),
                Call::Release(SourceId::new("power")),
                Call::ReacquireAll,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_subscription_degrades() {
        let recorder = Recorder {
            fail_subscribe: true,
            ..Recorder::default()
        };
        let (mut interceptor, recorder, _, _) = setup(recorder, PowerMode::NativeSuspend, None);
        let (tx, _rx) = mpsc::channel(4);
        interceptor.start(tx).await;
        assert!(interceptor.is_degraded());
        assert_eq!(recorder.calls(), vec![Call::Subscribe, Call::Release(SourceId::new("power"))]);
    }

    #[tokio::test]
    async fn test_intercept_modes() {
        let (mut interceptor, recorder, mut sink, _) =
            setup(logind_like(), PowerMode::InterceptAndRemap, None);
        let outcome = interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert_eq!(
            outcome,
            PowerOutcome::Remap(Action::SynthesizeButton(LogicalButton::Guide, Phase::Down))
        );

        let (mut interceptor, _, mut sink, _) =
            setup(logind_like(), PowerMode::InterceptAndIgnore, None);
        let outcome = interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert_eq!(outcome, PowerOutcome::Handled);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_configured_action_override() {
        let (mut interceptor, recorder, mut sink, _) =
            setup(logind_like(), PowerMode::NativeSuspend, Some(PowerKind::Hibernate));
        interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert!(recorder.calls().contains(&Call::Request(PowerKind::Hibernate)));

        let (mut interceptor, recorder, mut sink, _) =
            setup(logind_like(), PowerMode::NativeSuspend, Some(PowerKind::Ignore));
        interceptor.handle_request(PowerKind::Suspend, &mut sink).await.unwrap();
        assert!(recorder.calls().is_empty());
    }
}
