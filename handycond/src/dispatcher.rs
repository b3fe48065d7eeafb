//! Action dispatcher
//!
//! Executes recognizer actions in emission order against the sink, the mode
//! state and the power interceptor.

use handycon_common::{tracing, Action, ModeId, Phase};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{FeedbackSettings, ModeColor};
use crate::error::DaemonError;
use crate::feedback::Feedback;
use crate::power::{PowerInterceptor, PowerOutcome};
use crate::quirks::QuirkProfile;
use crate::sink::VirtualControllerSink;

/// Currently active profile mode
#[derive(Debug, Clone, PartialEq)]
pub struct ModeState {
    default: ModeId,
    current: ModeId,
}

impl ModeState {
    pub fn new(default: ModeId) -> Self {
        Self {
            current: default.clone(),
            default,
        }
    }

    pub fn current(&self) -> &ModeId {
        &self.current
    }

    /// Switch to `mode`, or back to the default if `mode` is already active
    pub fn toggle(&mut self, mode: &ModeId) -> &ModeId {
        self.current = if &self.current == mode {
            self.default.clone()
        } else {
            mode.clone()
        };
        &self.current
    }
}

/// What the engine has to do after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    None,
    /// Drop every source's held state in the recognizer
    ResetAll,
}

pub struct Dispatcher {
    sink: VirtualControllerSink,
    modes: ModeState,
    interceptor: PowerInterceptor,
    feedback: Arc<dyn Feedback>,
    haptics: bool,
    rumble: Duration,
    mode_colors: Vec<ModeColor>,
    dispatched: u64,
}

impl Dispatcher {
    pub fn new(
        profile: &QuirkProfile,
        settings: &FeedbackSettings,
        sink: VirtualControllerSink,
        interceptor: PowerInterceptor,
        feedback: Arc<dyn Feedback>,
    ) -> Self {
        Self {
            sink,
            modes: ModeState::new(profile.default_mode.clone()),
            interceptor,
            feedback,
            haptics: profile.haptics && settings.haptics,
            rumble: Duration::from_millis(settings.rumble_ms),
            mode_colors: settings.mode_colors.clone(),
            dispatched: 0,
        }
    }

    pub fn mode(&self) -> &ModeId {
        self.modes.current()
    }

    pub fn sink(&self) -> &VirtualControllerSink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut VirtualControllerSink {
        &mut self.sink
    }

    pub fn interceptor(&self) -> &PowerInterceptor {
        &self.interceptor
    }

    pub fn interceptor_mut(&mut self) -> &mut PowerInterceptor {
        &mut self.interceptor
    }

    /// Number of actions executed so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub async fn dispatch(&mut self, action: Action) -> Result<Followup, DaemonError> {
        let mut queue = vec![action];
        let mut followup = Followup::None;

        while !queue.is_empty() {
            let action = queue.remove(0);
            debug!("Dispatching {}", action);
            self.dispatched += 1;

            match action {
                Action::ToggleMode(mode) => self.toggle_mode(&mode),
                Action::PowerRequest(kind) => {
                    match self.interceptor.handle_request(kind, &mut self.sink).await? {
                        PowerOutcome::Handled => {}
                        PowerOutcome::ResetAll => followup = Followup::ResetAll,
                        // A remapped press has no release of its own
                        PowerOutcome::Remap(Action::SynthesizeButton(button, Phase::Down)) => {
                            queue.push(Action::SynthesizeButton(button, Phase::Down));
                            queue.push(Action::SynthesizeButton(button, Phase::Up));
                        }
                        PowerOutcome::Remap(other) => queue.push(other),
                    }
                }
                synthesize => self.sink.apply(&synthesize).await?,
            }
        }

        Ok(followup)
    }

    /// Handle a sleep notification
    pub async fn sleep(&mut self, entering: bool) -> Result<Followup, DaemonError> {
        match self.interceptor.on_sleep(entering, &mut self.sink).await? {
            PowerOutcome::ResetAll => Ok(Followup::ResetAll),
            _ => Ok(Followup::None),
        }
    }

    fn toggle_mode(&mut self, mode: &ModeId) {
        let current = self.modes.toggle(mode).clone();
        info!("Mode is now {}", current);

        if self.haptics {
            self.feedback.pulse(self.rumble);
        }
        if let Some(entry) = self.mode_colors.iter().find(|c| c.mode == current.0) {
            self.feedback.set_led(entry.color);
        }
    }
}
