//! Raw event normalization
//!
//! Translates `(source, type, code, value)` records into logical button
//! transitions or passthrough output, using the resolved quirk profile and the
//! current mode.

use handycon_common::{tracing, AxisId, LogicalButton, ModeId, Phase, SourceId};
use std::collections::HashMap;
use tracing::debug;

use crate::event::{LogicalEvent, RawEvent, EV_ABS, EV_KEY};
use crate::quirks::{QuirkProfile, RawKind};

/// Key codes of a standard xpad gamepad
pub const NATIVE_BUTTONS: &[(u16, LogicalButton)] = &[
    (304, LogicalButton::South),
    (305, LogicalButton::East),
    (307, LogicalButton::North),
    (308, LogicalButton::West),
    (310, LogicalButton::LeftBumper),
    (311, LogicalButton::RightBumper),
    (312, LogicalButton::LeftTrigger),
    (313, LogicalButton::RightTrigger),
    (314, LogicalButton::Select),
    (315, LogicalButton::Start),
    (316, LogicalButton::Guide),
    (317, LogicalButton::LeftStick),
    (318, LogicalButton::RightStick),
    (544, LogicalButton::DPadUp),
    (545, LogicalButton::DPadDown),
    (546, LogicalButton::DPadLeft),
    (547, LogicalButton::DPadRight),
];

/// Absolute axis codes of a standard xpad gamepad
pub const NATIVE_AXES: &[(u16, AxisId)] = &[
    (0, AxisId::LeftX),
    (1, AxisId::LeftY),
    (2, AxisId::LeftTrigger),
    (3, AxisId::RightX),
    (4, AxisId::RightY),
    (5, AxisId::RightTrigger),
    (16, AxisId::HatX),
    (17, AxisId::HatY),
];

/// Result of normalizing one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Goes through the combination recognizer
    Logical(LogicalEvent),
    /// Pure passthrough button, straight to the sink
    Button { button: LogicalButton, phase: Phase },
    /// Passthrough axis, straight to the sink
    Axis { axis: AxisId, value: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Button { button: LogicalButton, direct: bool },
    Axis(AxisId),
}

#[derive(Debug, Clone)]
struct Entry {
    mode: Option<ModeId>,
    target: Target,
}

type TableKey = (SourceId, RawKind, u16);

/// Stateful normalizer bound to one profile
pub struct Normalizer {
    table: HashMap<TableKey, Vec<Entry>>,
    /// Target a key resolved to on Down, so its Up resolves the same way
    latched: HashMap<(SourceId, u16), Target>,
}

impl Normalizer {
    pub fn new(profile: &QuirkProfile) -> Self {
        let members = profile.chord_members();
        let mut table: HashMap<TableKey, Vec<Entry>> = HashMap::new();

        let button_target = |button: LogicalButton, passthrough: bool| Target::Button {
            button,
            direct: passthrough && !members.contains(&button),
        };

        for source in profile.sources.iter().filter(|s| s.native) {
            for (code, button) in NATIVE_BUTTONS {
                table.entry((source.id.clone(), RawKind::Key, *code)).or_default().push(Entry {
                    mode: None,
                    target: button_target(*button, true),
                });
            }
            for (code, axis) in NATIVE_AXES {
                table.entry((source.id.clone(), RawKind::Abs, *code)).or_default().push(Entry {
                    mode: None,
                    target: Target::Axis(*axis),
                });
            }
        }

        // Explicit mappings come after the native table and win over it
        for mapping in &profile.mappings {
            let target = match (mapping.button, mapping.axis) {
                (Some(button), _) => button_target(button, mapping.passthrough),
                (None, Some(axis)) => Target::Axis(axis),
                (None, None) => continue,
            };
            table
                .entry((mapping.source.clone(), mapping.kind, mapping.code))
                .or_default()
                .push(Entry {
                    mode: mapping.mode.clone(),
                    target,
                });
        }

        Self {
            table,
            latched: HashMap::new(),
        }
    }

    fn lookup(&self, source: &SourceId, kind: RawKind, code: u16, mode: &ModeId) -> Option<Target> {
        let entries = self.table.get(&(source.clone(), kind, code))?;
        entries
            .iter()
            .find(|e| e.mode.as_ref() == Some(mode))
            .or_else(|| entries.iter().rev().find(|e| e.mode.is_none()))
            .map(|e| e.target)
    }

    /// Normalize one raw record in the given mode
    pub fn normalize(&mut self, raw: &RawEvent, mode: &ModeId) -> Option<Normalized> {
        match raw.event_type {
            EV_KEY => self.normalize_key(raw, mode),
            EV_ABS => match self.lookup(&raw.source, RawKind::Abs, raw.code, mode)? {
                Target::Axis(axis) => Some(Normalized::Axis {
                    axis,
                    value: raw.value,
                }),
                Target::Button { .. } => None,
            },
            _ => None,
        }
    }

    fn normalize_key(&mut self, raw: &RawEvent, mode: &ModeId) -> Option<Normalized> {
        let phase = match raw.value {
            1 => Phase::Down,
            0 => Phase::Up,
            _ => return None,
        };

        let latch_key = (raw.source.clone(), raw.code);
        let target = match phase {
            Phase::Down => {
                let target = self.lookup(&raw.source, RawKind::Key, raw.code, mode)?;
                self.latched.insert(latch_key, target);
                target
            }
            Phase::Up => match self.latched.remove(&latch_key) {
                Some(target) => target,
                None => self.lookup(&raw.source, RawKind::Key, raw.code, mode)?,
            },
        };

        let normalized = match target {
            Target::Button { button, direct: true } => Normalized::Button { button, phase },
            Target::Button { button, direct: false } => {
                Normalized::Logical(LogicalEvent::new(&raw.source, button, phase, raw.timestamp))
            }
            Target::Axis(_) => return None,
        };
        debug!("{} code {} value {} -> {:?}", raw.source, raw.code, raw.value, normalized);
        Some(normalized)
    }

    /// Forget a source's latched presses, returning releases for its passthrough buttons
    pub fn reset_source(&mut self, source: &SourceId) -> Vec<Normalized> {
        let mut releases = Vec::new();
        self.latched.retain(|(latched_source, _), target| {
            if latched_source != source {
                return true;
            }
            if let Target::Button { button, direct: true } = target {
                releases.push(Normalized::Button {
                    button: *button,
                    phase: Phase::Up,
                });
            }
            false
        });
        releases
    }
}
