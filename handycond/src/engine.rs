//! Engine loop
//!
//! The one place where raw events, recognizer deadlines, hot-plug notices and
//! sleep notifications are put in order. It owns the normalizer, recognizer
//! and dispatcher, and publishes a status snapshot for the IPC server.

use handycon_common::{tracing, Action, SourceId, SourceInfo, StatusInfo};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, Followup};
use crate::error::DaemonError;
use crate::event::EngineEvent;
use crate::normalizer::{Normalized, Normalizer};
use crate::quirks::QuirkProfile;
use crate::recognizer::Recognizer;

#[derive(Debug, Clone)]
struct SourceState {
    role: &'static str,
    name: String,
    path: Option<PathBuf>,
    connected: bool,
    grabbed: bool,
    last_seen: Option<Instant>,
}

pub struct Engine {
    profile_name: String,
    normalizer: Normalizer,
    recognizer: Recognizer,
    dispatcher: Dispatcher,
    sources: BTreeMap<SourceId, SourceState>,
    status: watch::Sender<StatusInfo>,
    started: Instant,
    events_processed: u64,
}

impl Engine {
    pub fn new(profile: &QuirkProfile, dispatcher: Dispatcher) -> Self {
        let sources = profile
            .sources
            .iter()
            .map(|spec| {
                let name = spec
                    .name
                    .clone()
                    .or_else(|| spec.path.as_ref().map(|p| p.display().to_string()))
                    .unwrap_or_default();
                let state = SourceState {
                    role: spec.role.as_str(),
                    name,
                    path: None,
                    connected: false,
                    grabbed: false,
                    last_seen: None,
                };
                (spec.id.clone(), state)
            })
            .collect();

        let engine = Self {
            profile_name: profile.name.clone(),
            normalizer: Normalizer::new(profile),
            recognizer: Recognizer::new(profile),
            dispatcher,
            sources,
            status: watch::channel(empty_status()).0,
            started: Instant::now(),
            events_processed: 0,
        };
        engine.publish();
        engine
    }

    /// Receiver for status snapshots, updated after every processed event
    pub fn status(&self) -> watch::Receiver<StatusInfo> {
        self.status.subscribe()
    }

    /// Process events until shutdown, then release every held output
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<(), DaemonError> {
        info!("Engine started for {}", self.profile_name);

        let result = loop {
            let deadline = self.recognizer.next_deadline();

            let step = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(EngineEvent::Shutdown) | None => break Ok(()),
                    Some(event) => self.handle(event).await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let actions = self.recognizer.advance(Instant::now());
                    self.dispatch_all(actions).await
                }
            };

            if let Err(e) = step {
                if e.is_fatal() {
                    error!("Engine stopping: {}", e);
                    break Err(e);
                }
                warn!("{}", e);
            }
            self.publish();
        };

        if let Err(e) = self.dispatcher.sink_mut().release_all().await {
            warn!("Failed to release outputs on exit: {}", e);
        }
        self.publish();
        info!("Engine stopped after {} events", self.events_processed);
        result
    }

    /// Process one queued event
    pub async fn handle(&mut self, event: EngineEvent) -> Result<(), DaemonError> {
        match event {
            EngineEvent::Raw(raw) => {
                self.events_processed += 1;
                if let Some(state) = self.sources.get_mut(&raw.source) {
                    state.last_seen = Some(raw.timestamp);
                }
                match self.normalizer.normalize(&raw, self.dispatcher.mode()) {
                    Some(Normalized::Logical(event)) => {
                        let actions = self.recognizer.handle(event);
                        self.dispatch_all(actions).await
                    }
                    Some(other) => self.dispatch_all(vec![passthrough(other)]).await,
                    None => Ok(()),
                }
            }
            EngineEvent::SourceReset { source, path, grabbed } => {
                debug!("Source {} reset at {}", source, path.display());
                if let Some(state) = self.sources.get_mut(&source) {
                    state.path = Some(path);
                    state.connected = true;
                    state.grabbed = grabbed;
                }
                self.reset_source(&source).await
            }
            EngineEvent::SourceLost { source, reason } => {
                debug!("Source {} lost: {}", source, reason);
                if let Some(state) = self.sources.get_mut(&source) {
                    state.connected = false;
                    state.grabbed = false;
                }
                self.reset_source(&source).await
            }
            EngineEvent::Sleep(entering) => {
                let followup = self.dispatcher.sleep(entering).await?;
                self.follow(followup).await
            }
            EngineEvent::Shutdown => Ok(()),
        }
    }

    async fn reset_source(&mut self, source: &SourceId) -> Result<(), DaemonError> {
        let mut actions = self.recognizer.reset_source(source, Instant::now());
        actions.extend(self.normalizer.reset_source(source).into_iter().map(passthrough));
        self.dispatch_all(actions).await
    }

    async fn reset_all(&mut self) -> Result<(), DaemonError> {
        info!("Resetting input state of all sources");
        let mut actions = self.recognizer.reset_all();
        let ids: Vec<SourceId> = self.sources.keys().cloned().collect();
        for id in &ids {
            actions.extend(self.normalizer.reset_source(id).into_iter().map(passthrough));
        }
        for action in actions {
            // Releases only; they cannot request another reset
            self.dispatcher.dispatch(action).await?;
        }
        Ok(())
    }

    async fn dispatch_all(&mut self, actions: Vec<Action>) -> Result<(), DaemonError> {
        let mut followup = Followup::None;
        for action in actions {
            if self.dispatcher.dispatch(action).await? == Followup::ResetAll {
                followup = Followup::ResetAll;
            }
        }
        self.follow(followup).await
    }

    async fn follow(&mut self, followup: Followup) -> Result<(), DaemonError> {
        match followup {
            Followup::ResetAll => self.reset_all().await,
            Followup::None => Ok(()),
        }
    }

    fn publish(&self) {
        let now = Instant::now();
        let interceptor = self.dispatcher.interceptor();
        let sources = self
            .sources
            .iter()
            .map(|(id, state)| SourceInfo {
                id: id.clone(),
                role: state.role.to_string(),
                name: state.name.clone(),
                path: state.path.clone(),
                connected: state.connected,
                grabbed: state.grabbed,
                last_seen_ms: state
                    .last_seen
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            })
            .collect();

        self.status.send_replace(StatusInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: now.saturating_duration_since(self.started).as_secs(),
            profile: self.profile_name.clone(),
            mode: self.dispatcher.mode().to_string(),
            recognizer: self.recognizer.phase().to_string(),
            power_state: interceptor.state().to_string(),
            power_degraded: interceptor.is_degraded(),
            events_processed: self.events_processed,
            actions_dispatched: self.dispatcher.dispatched(),
            held_outputs: self.dispatcher.sink().held_outputs(),
            sources,
        });
    }
}

fn passthrough(normalized: Normalized) -> Action {
    match normalized {
        Normalized::Button { button, phase } => Action::SynthesizeButton(button, phase),
        Normalized::Axis { axis, value } => Action::SynthesizeAxis(axis, value),
        Normalized::Logical(event) => Action::SynthesizeButton(event.button, event.phase),
    }
}

fn empty_status() -> StatusInfo {
    StatusInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: 0,
        profile: String::new(),
        mode: String::new(),
        recognizer: String::new(),
        power_state: String::new(),
        power_degraded: false,
        events_processed: 0,
        actions_dispatched: 0,
        held_outputs: Vec::new(),
        sources: Vec::new(),
    }
}
