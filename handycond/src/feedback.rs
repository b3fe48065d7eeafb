//! Haptic and LED feedback
//!
//! Fire-and-forget: failures are logged and never reach the engine.

use evdev::{FFEffectData, FFEffectKind, FFReplay, FFTrigger};
use handycon_common::tracing;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::device::locate;
use crate::quirks::SourceSpec;

const RUMBLE_MAGNITUDE: u16 = 0x6000;

pub trait Feedback: Send + Sync {
    /// Short rumble on the controller
    fn pulse(&self, duration: Duration);

    /// Set the controller LED color
    fn set_led(&self, color: [u8; 3]);
}

/// Feedback that does nothing, for setups without haptics or LED
pub struct NullFeedback;

impl Feedback for NullFeedback {
    fn pulse(&self, _duration: Duration) {}

    fn set_led(&self, _color: [u8; 3]) {}
}

/// Rumble through the gamepad source's force feedback and an optional sysfs LED
pub struct EvdevFeedback {
    gamepad: Option<SourceSpec>,
    led_path: Option<PathBuf>,
}

impl EvdevFeedback {
    pub fn new(gamepad: Option<SourceSpec>, led_path: Option<PathBuf>) -> Self {
        Self { gamepad, led_path }
    }
}

fn rumble(spec: &SourceSpec, duration: Duration) -> Result<(), String> {
    let (path, mut device) = locate(spec)?;
    let length = u16::try_from(duration.as_millis()).unwrap_or(u16::MAX);
    let data = FFEffectData {
        direction: 0,
        trigger: FFTrigger {
            button: 0,
            interval: 0,
        },
        replay: FFReplay { length, delay: 0 },
        kind: FFEffectKind::Rumble {
            strong_magnitude: RUMBLE_MAGNITUDE,
            weak_magnitude: RUMBLE_MAGNITUDE,
        },
    };

    let mut effect = device
        .upload_ff_effect(data)
        .map_err(|e| format!("cannot upload rumble to {}: {}", path.display(), e))?;
    effect
        .play(1)
        .map_err(|e| format!("cannot play rumble on {}: {}", path.display(), e))?;
    // The effect is erased when dropped
    std::thread::sleep(duration);
    Ok(())
}

/// Format of a sysfs `multi_intensity` write
pub fn led_value(color: [u8; 3]) -> String {
    format!("{} {} {}", color[0], color[1], color[2])
}

impl Feedback for EvdevFeedback {
    fn pulse(&self, duration: Duration) {
        let Some(spec) = self.gamepad.clone() else {
            return;
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = rumble(&spec, duration) {
                warn!("Haptic feedback failed: {}", e);
            }
        });
    }

    fn set_led(&self, color: [u8; 3]) {
        let Some(path) = self.led_path.clone() else {
            return;
        };
        tokio::task::spawn_blocking(move || match std::fs::write(&path, led_value(color)) {
            Ok(()) => debug!("LED set to {:?}", color),
            Err(e) => warn!("Failed to set LED at {}: {}", path.display(), e),
        });
    }
}
