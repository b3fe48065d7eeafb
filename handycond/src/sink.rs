//! Virtual controller sink
//!
//! Owns the uinput gamepad that games see and the reference-counted mirror of
//! what it currently reports.

use async_trait::async_trait;
use evdev::uinput::{UInputEvent, VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, FFEffectType, InputEvent,
    InputEventKind, InputId, Key, UInputEventType, UinputAbsSetup,
};
use handycon_common::{tracing, Action, AxisId, LogicalButton, Phase};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::normalizer::NATIVE_BUTTONS;
use crate::quirks::QuirkProfile;
use crate::rumble::{RumbleRelay, RumbleTarget, MAX_EFFECTS};

pub const DEVICE_NAME: &str = "Handheld Controller";

const XBOX360_VENDOR: u16 = 0x045e;
const XBOX360_PRODUCT: u16 = 0x028e;
const XBOX360_VERSION: u16 = 0x110;

const GUIDE: u16 = 316;

/// One transition written to the virtual controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    Key { code: u16, pressed: bool },
    Abs { axis: AxisId, value: i32 },
}

/// Writes batches of transitions, each terminated by a sync report
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn emit(&self, batch: &[OutputEvent]) -> Result<(), DaemonError>;
}

/// Output codes a logical button produces unless the profile overrides them
pub fn default_output(button: LogicalButton) -> Vec<u16> {
    if let Some((code, _)) = NATIVE_BUTTONS.iter().find(|(_, b)| *b == button) {
        return vec![*code];
    }
    match button {
        LogicalButton::Mode => vec![GUIDE],
        LogicalButton::QuickAccess => vec![GUIDE, 304],
        LogicalButton::Screenshot => vec![GUIDE, 311],
        LogicalButton::Keyboard => vec![GUIDE, 307],
        LogicalButton::Escape => vec![1],
        LogicalButton::VolumeUp => vec![115],
        LogicalButton::VolumeDown => vec![114],
        LogicalButton::Key(code) => vec![code],
        _ => Vec::new(),
    }
}

fn axis_setup(axis: AxisId) -> (u16, AbsInfo) {
    match axis {
        AxisId::LeftX => (0, AbsInfo::new(0, -32768, 32767, 16, 128, 0)),
        AxisId::LeftY => (1, AbsInfo::new(0, -32768, 32767, 16, 128, 0)),
        AxisId::LeftTrigger => (2, AbsInfo::new(0, 0, 255, 0, 0, 0)),
        AxisId::RightX => (3, AbsInfo::new(0, -32768, 32767, 16, 128, 0)),
        AxisId::RightY => (4, AbsInfo::new(0, -32768, 32767, 16, 128, 0)),
        AxisId::RightTrigger => (5, AbsInfo::new(0, 0, 255, 0, 0, 0)),
        AxisId::HatX => (16, AbsInfo::new(0, -1, 1, 0, 0, 0)),
        AxisId::HatY => (17, AbsInfo::new(0, -1, 1, 0, 0, 0)),
    }
}

const ALL_AXES: [AxisId; 8] = [
    AxisId::LeftX,
    AxisId::LeftY,
    AxisId::LeftTrigger,
    AxisId::RightX,
    AxisId::RightY,
    AxisId::RightTrigger,
    AxisId::HatX,
    AxisId::HatY,
];

/// Every key code the profile can make the virtual controller emit
pub fn output_codes(profile: &QuirkProfile) -> BTreeSet<u16> {
    let mut codes: BTreeSet<u16> = NATIVE_BUTTONS.iter().map(|(code, _)| *code).collect();

    let mut buttons: Vec<LogicalButton> = vec![
        LogicalButton::Mode,
        LogicalButton::QuickAccess,
        LogicalButton::Screenshot,
        LogicalButton::Keyboard,
        LogicalButton::Escape,
        LogicalButton::VolumeUp,
        LogicalButton::VolumeDown,
    ];
    buttons.extend(profile.mappings.iter().filter_map(|m| m.button));
    buttons.extend(profile.chords.iter().map(|c| &c.action).chain(profile.power_remap.iter()).filter_map(
        |action| match action {
            Action::SynthesizeButton(button, _) => Some(*button),
            _ => None,
        },
    ));

    for button in buttons {
        match profile.outputs.get(&button) {
            Some(codes_override) => codes.extend(codes_override.iter().copied()),
            None => codes.extend(default_output(button)),
        }
    }
    for override_codes in profile.outputs.values() {
        codes.extend(override_codes.iter().copied());
    }
    codes
}

/// Reference-counted view of what the virtual controller reports
#[derive(Debug, Default, Clone)]
pub struct VirtualControllerState {
    keys: BTreeMap<u16, u32>,
    axes: BTreeMap<AxisId, i32>,
}

impl VirtualControllerState {
    /// Count a press; true when the code goes from released to held
    pub fn press(&mut self, code: u16) -> bool {
        let count = self.keys.entry(code).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count a release; true when the last holder let go
    pub fn release(&mut self, code: u16) -> bool {
        match self.keys.get_mut(&code) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.keys.remove(&code);
                true
            }
            None => false,
        }
    }

    pub fn set_axis(&mut self, axis: AxisId, value: i32) -> bool {
        self.axes.insert(axis, value) != Some(value)
    }

    pub fn held(&self) -> Vec<u16> {
        self.keys.keys().copied().collect()
    }

    pub fn is_held(&self, code: u16) -> bool {
        self.keys.contains_key(&code)
    }

    /// Drop all holders, returning the codes that were held
    pub fn clear(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.keys).into_keys().collect()
    }
}

/// Split transitions so that no batch carries two transitions of one key
pub fn split_batches(events: &[OutputEvent]) -> Vec<Vec<OutputEvent>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut seen: HashSet<u16> = HashSet::new();

    for event in events {
        if let OutputEvent::Key { code, .. } = event {
            if !seen.insert(*code) {
                batches.push(std::mem::take(&mut current));
                seen.clear();
                seen.insert(*code);
            }
        }
        current.push(*event);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Applies synthesize actions to the virtual controller
pub struct VirtualControllerSink {
    device: Arc<dyn OutputDevice>,
    state: VirtualControllerState,
    outputs: BTreeMap<LogicalButton, Vec<u16>>,
    button_delay: Duration,
}

impl VirtualControllerSink {
    pub fn new(device: Arc<dyn OutputDevice>, profile: &QuirkProfile) -> Self {
        Self {
            device,
            state: VirtualControllerState::default(),
            outputs: profile.outputs.clone(),
            button_delay: profile.button_delay(),
        }
    }

    pub fn outputs_for(&self, button: LogicalButton) -> Vec<u16> {
        self.outputs
            .get(&button)
            .cloned()
            .unwrap_or_else(|| default_output(button))
    }

    pub fn held_outputs(&self) -> Vec<u16> {
        self.state.held()
    }

    pub fn state(&self) -> &VirtualControllerState {
        &self.state
    }

    /// Apply a synthesize action; other actions are ignored
    pub async fn apply(&mut self, action: &Action) -> Result<(), DaemonError> {
        match action {
            Action::SynthesizeButton(button, phase) => self.button(*button, *phase).await,
            Action::SynthesizeAxis(axis, value) => {
                if self.state.set_axis(*axis, *value) {
                    self.write(&[OutputEvent::Abs { axis: *axis, value: *value }]).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn button(&mut self, button: LogicalButton, phase: Phase) -> Result<(), DaemonError> {
        let mut codes = self.outputs_for(button);
        if codes.is_empty() {
            debug!("{} has no output codes", button);
            return Ok(());
        }
        if phase == Phase::Up {
            codes.reverse();
        }

        let pressed = phase == Phase::Down;
        let step_by_step = codes.len() > 1 && !self.button_delay.is_zero();
        let mut events = Vec::new();

        for (i, code) in codes.into_iter().enumerate() {
            let changed = if pressed {
                self.state.press(code)
            } else {
                self.state.release(code)
            };
            if !changed {
                continue;
            }
            if step_by_step {
                if i > 0 {
                    sleep(self.button_delay).await;
                }
                self.write(&[OutputEvent::Key { code, pressed }]).await?;
            } else {
                events.push(OutputEvent::Key { code, pressed });
            }
        }

        if !events.is_empty() {
            self.write(&events).await?;
        }
        Ok(())
    }

    /// Release every held code, e.g. before exit or sleep
    pub async fn release_all(&mut self) -> Result<(), DaemonError> {
        let held = self.state.clear();
        if held.is_empty() {
            return Ok(());
        }
        info!("Releasing {} held outputs", held.len());
        let events: Vec<OutputEvent> = held
            .into_iter()
            .rev()
            .map(|code| OutputEvent::Key { code, pressed: false })
            .collect();
        self.write(&events).await
    }

    async fn write(&self, events: &[OutputEvent]) -> Result<(), DaemonError> {
        for batch in split_batches(events) {
            debug!("Emitting {:?}", batch);
            self.device.emit(&batch).await?;
        }
        Ok(())
    }
}

/// The uinput gamepad, presenting itself as an Xbox 360 pad
pub struct UinputGamepad {
    device: Arc<Mutex<VirtualDevice>>,
}

impl UinputGamepad {
    pub fn new(codes: &BTreeSet<u16>) -> Result<Self, DaemonError> {
        info!("Creating virtual controller '{}' with {} keys", DEVICE_NAME, codes.len());

        let mut keys = AttributeSet::<Key>::new();
        for code in codes {
            keys.insert(Key::new(*code));
        }

        let failure = |e: std::io::Error| {
            DaemonError::OutputDeviceFailure(format!(
                "{}. Ensure the uinput module is loaded and the daemon runs as root",
                e
            ))
        };

        let mut effects = AttributeSet::<FFEffectType>::new();
        for effect in [
            FFEffectType::FF_RUMBLE,
            FFEffectType::FF_PERIODIC,
            FFEffectType::FF_SQUARE,
            FFEffectType::FF_TRIANGLE,
            FFEffectType::FF_SINE,
            FFEffectType::FF_GAIN,
        ] {
            effects.insert(effect);
        }

        let mut builder = VirtualDeviceBuilder::new()
            .map_err(failure)?
            .name(DEVICE_NAME)
            .input_id(InputId::new(BusType::BUS_USB, XBOX360_VENDOR, XBOX360_PRODUCT, XBOX360_VERSION))
            .with_keys(&keys)
            .map_err(failure)?
            .with_ff(&effects)
            .map_err(failure)?
            .with_ff_effects_max(u32::from(MAX_EFFECTS));
        for axis in ALL_AXES {
            let (code, info) = axis_setup(axis);
            builder = builder
                .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisType(code), info))
                .map_err(failure)?;
        }
        let device = builder.build().map_err(failure)?;

        Ok(Self {
            device: Arc::new(Mutex::new(device)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, VirtualDevice>, DaemonError> {
        self.device
            .lock()
            .map_err(|_| DaemonError::OutputDeviceFailure("virtual controller lock poisoned".into()))
    }

    /// Serve force feedback requests from games on a dedicated thread,
    /// replaying them on `target`
    pub fn forward_rumble<T: RumbleTarget + 'static>(&self, target: T) -> Result<(), DaemonError> {
        let fd = self.lock()?.as_raw_fd();
        let device = Arc::clone(&self.device);
        std::thread::Builder::new()
            .name("rumble".to_string())
            .spawn(move || serve_rumble(device, fd, RumbleRelay::new(target)))
            .map_err(|e| DaemonError::OutputDeviceFailure(format!("cannot start rumble forwarding: {}", e)))?;
        Ok(())
    }
}

fn serve_rumble<T: RumbleTarget>(device: Arc<Mutex<VirtualDevice>>, fd: RawFd, mut relay: RumbleRelay<T>) {
    info!("Forwarding force feedback from the virtual controller");
    loop {
        // `device` keeps the descriptor open for the life of this thread
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Force feedback forwarding stopped: {}", e);
                return;
            }
        }

        let Ok(mut device) = device.lock() else {
            return;
        };
        let requests: Vec<UInputEvent> = match device.fetch_events() {
            Ok(events) => events.collect(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!("Force feedback forwarding stopped: {}", e);
                return;
            }
        };
        for request in requests {
            if let Err(e) = serve_request(&mut device, &mut relay, request) {
                warn!("Force feedback request failed: {}", e);
            }
        }
    }
}

fn serve_request<T: RumbleTarget>(
    device: &mut VirtualDevice,
    relay: &mut RumbleRelay<T>,
    request: UInputEvent,
) -> io::Result<()> {
    match request.kind() {
        InputEventKind::UInput(code) if code == UInputEventType::UI_FF_UPLOAD.0 => {
            let mut upload = device.process_ff_upload(request).map_err(io::Error::other)?;
            let slot = i16::try_from(upload.effect_id()).unwrap_or(-1);
            let result = relay.upload(slot, upload.effect());
            // The game's upload completes when `upload` is dropped
            upload.set_retval(if result.is_ok() { 0 } else { -libc::EIO });
            result
        }
        InputEventKind::UInput(code) if code == UInputEventType::UI_FF_ERASE.0 => {
            let mut erase = device.process_ff_erase(request).map_err(io::Error::other)?;
            let slot = i16::try_from(erase.effect_id()).unwrap_or(-1);
            let result = relay.erase(slot);
            erase.set_retval(if result.is_ok() { 0 } else { -libc::EIO });
            result
        }
        InputEventKind::ForceFeedback(code) if code < MAX_EFFECTS => relay.play(code, request.value()),
        _ => Ok(()),
    }
}

#[async_trait]
impl OutputDevice for UinputGamepad {
    async fn emit(&self, batch: &[OutputEvent]) -> Result<(), DaemonError> {
        let events: Vec<InputEvent> = batch
            .iter()
            .map(|event| match event {
                OutputEvent::Key { code, pressed } => {
                    InputEvent::new(EventType::KEY, *code, i32::from(*pressed))
                }
                OutputEvent::Abs { axis, value } => {
                    InputEvent::new(EventType::ABSOLUTE, axis_setup(*axis).0, *value)
                }
            })
            .collect();

        let mut device = self.lock()?;
        // evdev appends the SYN_REPORT
        device.emit(&events).map_err(|e| {
            warn!("Failed to write to virtual controller: {}", e);
            DaemonError::OutputDeviceFailure(e.to_string())
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every batch instead of writing to uinput
    #[derive(Default)]
    pub(crate) struct RecordingDevice {
        pub batches: Mutex<Vec<Vec<OutputEvent>>>,
    }

    impl RecordingDevice {
        pub fn batches(&self) -> Vec<Vec<OutputEvent>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutputDevice for RecordingDevice {
        async fn emit(&self, batch: &[OutputEvent]) -> Result<(), DaemonError> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn profile(delay_ms: u64) -> QuirkProfile {
        let yaml = format!(
            r#"
name: TEST
product_names: ["Test Handheld"]
button_delay_ms: {}
sources:
  - {{ id: keyboard, role: keyboard, name: "AT Translated Set 2 keyboard" }}
mappings:
  - {{ source: keyboard, code: 186, button: turbo }}
outputs:
  turbo: [316, 305]
"#,
            delay_ms
        );
        QuirkProfile::from_yaml(&yaml).unwrap()
    }

    fn key(code: u16, pressed: bool) -> OutputEvent {
        OutputEvent::Key { code, pressed }
    }

    fn sink(delay_ms: u64) -> (VirtualControllerSink, Arc<RecordingDevice>) {
        let device = Arc::new(RecordingDevice::default());
        (VirtualControllerSink::new(device.clone(), &profile(delay_ms)), device)
    }

    #[tokio::test]
    async fn test_multi_code_output_order() {
        let (mut sink, device) = sink(0);
        sink.apply(&Action::SynthesizeButton(LogicalButton::QuickAccess, Phase::Down)).await.unwrap();
        sink.apply(&Action::SynthesizeButton(LogicalButton::QuickAccess, Phase::Up)).await.unwrap();

        assert_eq!(
            device.batches(),
            vec![
                vec![key(316, true), key(304, true)],
                vec![key(304, false), key(316, false)],
            ]
        );
        assert!(sink.held_outputs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_delay_splits_steps() {
        let (mut sink, device) = sink(100);
        let start = tokio::time::Instant::now();
        sink.apply(&Action::SynthesizeButton(LogicalButton::Screenshot, Phase::Down)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        assert_eq!(device.batches(), vec![vec![key(316, true)], vec![key(311, true)]]);
    }

    #[tokio::test]
    async fn test_overlapping_outputs_are_refcounted() {
        let (mut sink, device) = sink(0);
        sink.apply(&Action::SynthesizeButton(LogicalButton::Guide, Phase::Down)).await.unwrap();
        sink.apply(&Action::SynthesizeButton(LogicalButton::QuickAccess, Phase::Down)).await.unwrap();
        sink.apply(&Action::SynthesizeButton(LogicalButton::Guide, Phase::Up)).await.unwrap();
        assert!(sink.state().is_held(316));

        sink.apply(&Action::SynthesizeButton(LogicalButton::QuickAccess, Phase::Up)).await.unwrap();
        assert_eq!(
            device.batches(),
            vec![
                vec![key(316, true)],
                vec![key(304, true)],
                vec![key(304, false), key(316, false)],
            ]
        );
    }

    #[tokio::test]
    async fn test_release_without_press_is_silent() {
        let (mut sink, device) = sink(0);
        sink.apply(&Action::SynthesizeButton(LogicalButton::South, Phase::Up)).await.unwrap();
        sink.apply(&Action::SynthesizeButton(LogicalButton::Turbo, Phase::Up)).await.unwrap();
        assert!(device.batches().is_empty());
    }

    #[tokio::test]
    async fn test_profile_outputs_override_defaults() {
        let (mut sink, device) = sink(0);
        assert_eq!(sink.outputs_for(LogicalButton::Turbo), vec![316, 305]);
        assert!(sink.outputs_for(LogicalButton::LeftCustom).is_empty());
        sink.apply(&Action::SynthesizeButton(LogicalButton::Turbo, Phase::Down)).await.unwrap();
        assert_eq!(device.batches(), vec![vec![key(316, true), key(305, true)]]);
    }

    #[tokio::test]
    async fn test_axis_only_emits_changes() {
        let (mut sink, device) = sink(0);
        sink.apply(&Action::SynthesizeAxis(AxisId::LeftX, 1200)).await.unwrap();
        sink.apply(&Action::SynthesizeAxis(AxisId::LeftX, 1200)).await.unwrap();
        sink.apply(&Action::SynthesizeAxis(AxisId::LeftX, -5)).await.unwrap();
        assert_eq!(
            device.batches(),
            vec![
                vec![OutputEvent::Abs { axis: AxisId::LeftX, value: 1200 }],
                vec![OutputEvent::Abs { axis: AxisId::LeftX, value: -5 }],
            ]
        );
    }

    #[tokio::test]
    async fn test_release_all() {
        let (mut sink, device) = sink(0);
        sink.apply(&Action::SynthesizeButton(LogicalButton::Keyboard, Phase::Down)).await.unwrap();
        sink.apply(&Action::SynthesizeButton(LogicalButton::Escape, Phase::Down)).await.unwrap();
        sink.release_all().await.unwrap();
        sink.release_all().await.unwrap();

        let batches = device.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![key(316, false), key(307, false), key(1, false)]);
        assert!(sink.held_outputs().is_empty());
    }

    #[test]
    fn test_batches_never_repeat_a_code() {
        let events = [key(316, true), key(304, true), key(304, false), key(316, false), key(1, true)];
        let batches = split_batches(&events);
        assert_eq!(
            batches,
            vec![
                vec![key(316, true), key(304, true)],
                vec![key(304, false), key(316, false), key(1, true)],
            ]
        );
        for batch in batches {
            let mut codes = HashSet::new();
            for event in batch {
                if let OutputEvent::Key { code, .. } = event {
                    assert!(codes.insert(code));
                }
            }
        }
    }

    #[test]
    fn test_output_codes_cover_profile() {
        let codes = output_codes(&profile(0));
        assert!(codes.contains(&304));
        assert!(codes.contains(&1));
        assert!(codes.contains(&115));
        assert!(codes.contains(&305));
    }
}
