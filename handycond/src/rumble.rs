//! Force feedback forwarding
//!
//! Games upload rumble effects to the virtual controller. The kernel hands
//! each upload, erase and play request to the daemon through uinput, and the
//! relay replays it on the gamepad source under the id the gamepad assigned.

use evdev::{Device as EvdevDevice, FFEffect, FFEffectData};
use handycon_common::tracing;
use std::collections::HashMap;
use std::io;
use tracing::{debug, info};

use crate::device::locate;
use crate::quirks::SourceSpec;

/// Effect slots offered by the virtual controller. `EV_FF` codes at or above
/// this are device settings such as gain, not effect ids.
pub const MAX_EFFECTS: u16 = 16;

/// Device that plays forwarded effects
pub trait RumbleTarget: Send {
    /// Upload a new effect, returning the id the target gave it
    fn upload(&mut self, effect: FFEffectData) -> io::Result<u16>;

    fn play(&mut self, id: u16, count: i32) -> io::Result<()>;

    fn stop(&mut self, id: u16) -> io::Result<()>;

    fn erase(&mut self, id: u16) -> io::Result<()>;
}

/// Maps effect ids of the virtual controller to ids on the target
pub struct RumbleRelay<T> {
    target: T,
    effects: HashMap<i16, u16>,
}

impl<T: RumbleTarget> RumbleRelay<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            effects: HashMap::new(),
        }
    }

    /// Store the effect a game uploaded under `virtual_id`, replacing any
    /// earlier effect in that slot
    pub fn upload(&mut self, virtual_id: i16, effect: FFEffectData) -> io::Result<()> {
        if let Some(previous) = self.effects.remove(&virtual_id) {
            if let Err(e) = self.target.erase(previous) {
                debug!("Erasing replaced effect {} failed: {}", previous, e);
            }
        }
        let id = self.target.upload(effect)?;
        debug!("Effect {} forwarded as {}", virtual_id, id);
        self.effects.insert(virtual_id, id);
        Ok(())
    }

    /// Start an effect `count` times, or stop it when `count` is zero
    pub fn play(&mut self, virtual_id: u16, count: i32) -> io::Result<()> {
        let target_id = i16::try_from(virtual_id)
            .ok()
            .and_then(|id| self.effects.get(&id).copied());
        let Some(id) = target_id else {
            debug!("Ignoring play of unknown effect {}", virtual_id);
            return Ok(());
        };
        if count > 0 {
            self.target.play(id, count)
        } else {
            self.target.stop(id)
        }
    }

    pub fn erase(&mut self, virtual_id: i16) -> io::Result<()> {
        match self.effects.remove(&virtual_id) {
            Some(id) => self.target.erase(id),
            None => Ok(()),
        }
    }
}

/// Plays effects on the gamepad source through its own ungrabbed handle.
///
/// The handle is opened on first use and dropped after a failure, so a
/// replugged gamepad is picked up by the next upload.
pub struct GamepadRumble {
    spec: SourceSpec,
    device: Option<EvdevDevice>,
    effects: HashMap<u16, FFEffect>,
}

impl GamepadRumble {
    pub fn new(spec: SourceSpec) -> Self {
        Self {
            spec,
            device: None,
            effects: HashMap::new(),
        }
    }

    fn device(&mut self) -> io::Result<&mut EvdevDevice> {
        if self.device.is_none() {
            let (path, device) =
                locate(&self.spec).map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
            info!("Forwarding rumble to {}", path.display());
            self.device = Some(device);
        }
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn effect(&mut self, id: u16) -> io::Result<&mut FFEffect> {
        self.effects
            .get_mut(&id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no effect {}", id)))
    }

    fn forget(&mut self) {
        self.effects.clear();
        self.device = None;
    }
}

impl RumbleTarget for GamepadRumble {
    fn upload(&mut self, effect: FFEffectData) -> io::Result<u16> {
        let uploaded = match self.device()?.upload_ff_effect(effect) {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.forget();
                return Err(e);
            }
        };
        let id = uploaded.id();
        self.effects.insert(id, uploaded);
        Ok(id)
    }

    fn play(&mut self, id: u16, count: i32) -> io::Result<()> {
        self.effect(id)?.play(count)
    }

    fn stop(&mut self, id: u16) -> io::Result<()> {
        self.effect(id)?.stop()
    }

    fn erase(&mut self, id: u16) -> io::Result<()> {
        // Dropping the effect erases it from the device
        self.effects.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::{FFEffectKind, FFReplay, FFTrigger};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Upload(u16),
        Play(u16, i32),
        Stop(u16),
        Erase(u16),
    }

    /// Hands out ids from 100 upwards so they never match the virtual ones
    #[derive(Clone, Default)]
    struct RecordingTarget {
        calls: Arc<Mutex<Vec<Call>>>,
        next_id: u16,
        fail_uploads: bool,
    }

    impl RecordingTarget {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RumbleTarget for RecordingTarget {
        fn upload(&mut self, effect: FFEffectData) -> io::Result<u16> {
            if self.fail_uploads {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let id = 100 + self.next_id;
            self.next_id += 1;
            assert_eq!(effect.replay.length, 200);
            self.calls.lock().unwrap().push(Call::Upload(id));
            Ok(id)
        }

        fn play(&mut self, id: u16, count: i32) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::Play(id, count));
            Ok(())
        }

        fn stop(&mut self, id: u16) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::Stop(id));
            Ok(())
        }

        fn erase(&mut self, id: u16) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::Erase(id));
            Ok(())
        }
    }

    fn rumble() -> FFEffectData {
        FFEffectData {
            direction: 0,
            trigger: FFTrigger {
                button: 0,
                interval: 0,
            },
            replay: FFReplay {
                length: 200,
                delay: 0,
            },
            kind: FFEffectKind::Rumble {
                strong_magnitude: 0x8000,
                weak_magnitude: 0x4000,
            },
        }
    }

    #[test]
    fn test_effects_play_under_target_ids() {
        let target = RecordingTarget::default();
        let mut relay = RumbleRelay::new(target.clone());

        relay.upload(0, rumble()).unwrap();
        relay.upload(1, rumble()).unwrap();
        relay.play(1, 1).unwrap();
        relay.play(0, 3).unwrap();
        relay.play(1, 0).unwrap();

        assert_eq!(
            target.calls(),
            vec![
                Call::Upload(100),
                Call::Upload(101),
                Call::Play(101, 1),
                Call::Play(100, 3),
                Call::Stop(101),
            ]
        );
    }

    #[test]
    fn test_reupload_replaces_the_slot() {
        let target = RecordingTarget::default();
        let mut relay = RumbleRelay::new(target.clone());

        relay.upload(0, rumble()).unwrap();
        relay.upload(0, rumble()).unwrap();
        relay.play(0, 1).unwrap();

        assert_eq!(
            target.calls(),
            vec![Call::Upload(100), Call::Erase(100), Call::Upload(101), Call::Play(101, 1)]
        );
    }

    #[test]
    fn test_erase_frees_the_mapping() {
        let target = RecordingTarget::default();
        let mut relay = RumbleRelay::new(target.clone());

        relay.upload(2, rumble()).unwrap();
        relay.erase(2).unwrap();
        relay.play(2, 1).unwrap();
        relay.erase(2).unwrap();

        assert_eq!(target.calls(), vec![Call::Upload(100), Call::Erase(100)]);
    }

    #[test]
    fn test_unknown_effects_are_ignored() {
        let target = RecordingTarget::default();
        let mut relay = RumbleRelay::new(target.clone());

        relay.play(5, 1).unwrap();
        relay.play(u16::MAX, 1).unwrap();
        relay.erase(7).unwrap();
        assert!(target.calls().is_empty());
    }

    #[test]
    fn test_failed_upload_leaves_slot_empty() {
        let target = RecordingTarget {
            fail_uploads: true,
            ..Default::default()
        };
        let mut relay = RumbleRelay::new(target.clone());

        assert!(relay.upload(0, rumble()).is_err());
        relay.play(0, 1).unwrap();
        assert!(target.calls().is_empty());
    }
}
